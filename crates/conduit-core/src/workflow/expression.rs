//! JEXL expression evaluation for guards, transforms and argument templates.
//!
//! Runtime expressions are written as `${ ... }`. Guards (`if`, `when`,
//! `while`, `until`) accept the bare form as well. Template evaluation walks
//! a JSON value and replaces every string leaf that is a runtime expression
//! with its evaluated result; other strings are kept verbatim.
//!
//! Payloads are always passed as context objects, never interpolated into
//! expression strings.

use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression '{expression}' failed: {reason}")]
    EvalFailed { expression: String, reason: String },

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// Evaluates one expression language against a JSON data object.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate `expression` (without `${ }` delimiters) against `data`.
    fn evaluate(&self, expression: &str, data: &Value) -> Result<Value, ExpressionError>;

    /// Evaluate and coerce the result with JavaScript-like truthiness.
    fn evaluate_bool(&self, expression: &str, data: &Value) -> Result<bool, ExpressionError> {
        self.evaluate(expression, data).map(|v| is_truthy(&v))
    }
}

/// JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// WorkflowEvaluator
// ---------------------------------------------------------------------------

thread_local! {
    static JEXL: jexl_eval::Evaluator<'static> = build_jexl();
}

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(|v| v.as_str()).unwrap_or("")
}

fn build_jexl() -> jexl_eval::Evaluator<'static> {
    jexl_eval::Evaluator::new()
        // String transforms
        .with_transform("lower", |args: &[Value]| Ok(json!(str_arg(args, 0).to_lowercase())))
        .with_transform("upper", |args: &[Value]| Ok(json!(str_arg(args, 0).to_uppercase())))
        .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
        .with_transform("split", |args: &[Value]| {
            let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
            let parts: Vec<&str> = str_arg(args, 0).split(delimiter).collect();
            Ok(json!(parts))
        })
        .with_transform("contains", |args: &[Value]| {
            let found = match args.first() {
                Some(Value::Array(items)) => {
                    items.contains(args.get(1).unwrap_or(&Value::Null))
                }
                _ => str_arg(args, 0).contains(str_arg(args, 1)),
            };
            Ok(json!(found))
        })
        .with_transform("startsWith", |args: &[Value]| {
            Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
        })
        .with_transform("endsWith", |args: &[Value]| {
            Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
        })
        // Boolean
        .with_transform("not", |args: &[Value]| {
            Ok(json!(!is_truthy(args.first().unwrap_or(&Value::Null))))
        })
        // Collections
        .with_transform("length", |args: &[Value]| {
            let len = match args.first() {
                Some(Value::String(s)) => s.chars().count(),
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(o)) => o.len(),
                _ => 0,
            };
            Ok(json!(len as f64))
        })
        .with_transform("keys", |args: &[Value]| {
            let keys: Vec<&String> = match args.first() {
                Some(Value::Object(o)) => o.keys().collect(),
                _ => Vec::new(),
            };
            Ok(json!(keys))
        })
        .with_transform("default", |args: &[Value]| {
            let value = args.first().cloned().unwrap_or(Value::Null);
            Ok(if value.is_null() {
                args.get(1).cloned().unwrap_or(Value::Null)
            } else {
                value
            })
        })
        .with_transform("json", |args: &[Value]| {
            let value = args.first().cloned().unwrap_or(Value::Null);
            Ok(json!(value.to_string()))
        })
}

/// JEXL evaluator with the standard transforms registered.
///
/// Available transforms: `lower`, `upper`, `trim`, `split`, `contains`,
/// `startsWith`, `endsWith`, `not`, `length`, `keys`, `default`, `json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowEvaluator;

impl WorkflowEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionEvaluator for WorkflowEvaluator {
    fn evaluate(&self, expression: &str, data: &Value) -> Result<Value, ExpressionError> {
        if !data.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        JEXL.with(|jexl| {
            jexl.eval_in_context(expression, data)
                .map_err(|e| ExpressionError::EvalFailed {
                    expression: expression.to_string(),
                    reason: e.to_string(),
                })
        })
    }
}

// ---------------------------------------------------------------------------
// Runtime expressions
// ---------------------------------------------------------------------------

/// The inner expression if `raw` is a `${ ... }` runtime expression.
pub fn runtime_expression(raw: &str) -> Option<&str> {
    raw.trim()
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .map(str::trim)
}

/// Evaluate an expression written with or without `${ }` delimiters.
pub fn evaluate_expression(
    evaluator: &dyn ExpressionEvaluator,
    raw: &str,
    data: &Value,
) -> Result<Value, ExpressionError> {
    let expression = runtime_expression(raw).unwrap_or(raw.trim());
    evaluator.evaluate(expression, data)
}

/// Evaluate a guard written with or without `${ }` delimiters.
pub fn evaluate_condition(
    evaluator: &dyn ExpressionEvaluator,
    raw: &str,
    data: &Value,
) -> Result<bool, ExpressionError> {
    let expression = runtime_expression(raw).unwrap_or(raw.trim());
    evaluator.evaluate_bool(expression, data)
}

/// Evaluate every runtime-expression string leaf of `template`.
pub fn evaluate_template(
    evaluator: &dyn ExpressionEvaluator,
    template: &Value,
    data: &Value,
) -> Result<Value, ExpressionError> {
    match template {
        Value::String(s) => match runtime_expression(s) {
            Some(expression) => evaluator.evaluate(expression, data),
            None => Ok(template.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate_template(evaluator, item, data))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), evaluate_template(evaluator, value, data)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn eval() -> WorkflowEvaluator {
        WorkflowEvaluator::new()
    }

    #[test]
    fn test_simple_comparison_against_input() {
        let data = json!({"input": {"count": 5}});
        assert!(eval().evaluate_bool("input.count > 2", &data).unwrap());
        assert!(!eval().evaluate_bool("input.count > 9", &data).unwrap());
    }

    #[test]
    fn test_string_equality_and_logic() {
        let data = json!({"error": {"status": "503", "type": "x"}});
        assert!(eval()
            .evaluate_bool("error.status == '503' && error.type == 'x'", &data)
            .unwrap());
    }

    #[test]
    fn test_transforms_are_registered() {
        let data = json!({"name": "Hello", "items": [1, 2, 3]});
        assert_eq!(eval().evaluate("name|upper", &data).unwrap(), json!("HELLO"));
        assert_eq!(eval().evaluate("name|lower", &data).unwrap(), json!("hello"));
        assert_eq!(eval().evaluate("items|length", &data).unwrap().as_f64(), Some(3.0));
        assert_eq!(
            eval().evaluate("'a,b'|split(',')", &data).unwrap(),
            json!(["a", "b"])
        );
        assert!(eval().evaluate_bool("name|startsWith('He')", &data).unwrap());
    }

    #[test]
    fn test_non_object_context_is_rejected() {
        let err = eval().evaluate("1 == 1", &json!([1])).unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidContext(_)));
    }

    #[test]
    fn test_syntax_errors_surface_as_eval_failed() {
        let err = eval().evaluate("input.count >", &json!({})).unwrap_err();
        assert!(matches!(err, ExpressionError::EvalFailed { .. }));
    }

    #[test]
    fn test_runtime_expression_delimiters() {
        assert_eq!(runtime_expression("${ input.a }"), Some("input.a"));
        assert_eq!(runtime_expression("  ${input}  "), Some("input"));
        assert_eq!(runtime_expression("plain text"), None);
        assert_eq!(runtime_expression("${ unterminated"), None);
    }

    #[test]
    fn test_condition_accepts_both_forms() {
        let data = json!({"input": {"ok": true}});
        assert!(evaluate_condition(&eval(), "${ input.ok }", &data).unwrap());
        assert!(evaluate_condition(&eval(), "input.ok", &data).unwrap());
    }

    #[test]
    fn test_template_replaces_only_expression_leaves() {
        let data = json!({"input": {"user": "ada", "n": 2}});
        let template = json!({
            "who": "${ input.user }",
            "literal": "input.user",
            "nested": [{"count": "${ input.n }"}, 7],
        });
        let out = evaluate_template(&eval(), &template, &data).unwrap();
        assert_eq!(out["who"], json!("ada"));
        assert_eq!(out["literal"], json!("input.user"));
        assert_eq!(out["nested"][0]["count"].as_f64(), Some(2.0));
        assert_eq!(out["nested"][1], json!(7));
    }

    #[test]
    fn test_truthiness_rules() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!("x")));
    }
}
