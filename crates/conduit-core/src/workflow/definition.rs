//! Workflow definition parsing, validation, and filesystem loading.
//!
//! Converts YAML or JSON documents into the immutable `WorkflowDefinition`
//! and checks the structural constraints the interpreter relies on: unique
//! names per scope, non-empty task lists, resolvable retry policies and
//! resolvable named flow directives.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use conduit_types::reference::{ScopeKind, TaskReference};
use conduit_types::retry::{RetryPolicy, RetryPolicyRef};
use conduit_types::task::{FlowDirective, TaskDefinition, TaskKind, WorkflowDefinition};
use thiserror::Error;

use super::flow::resolve_next;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Document namespace, name and version are non-empty; name and
///   namespace use only alphanumerics, `-` and `_`
/// - Every task list (`do`, `try`, `catch.do`, `for.do`, fork branches)
///   is non-empty and its names are unique and `/`-free
/// - Switch tasks have cases and at most one default case
/// - Named retry policies exist under `use.retries`
/// - Every retry policy is bounded: it declares `limit.attempt.count`, or
///   `limit.duration_ms` together with a non-zero `delay_ms`; jitter
///   windows are ordered
/// - `timeout_secs` is > 0 when set
/// - Every named `then` (task or switch case) resolves to a reachable task
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    let doc = &def.document;
    for (field, value) in [
        ("namespace", &doc.namespace),
        ("name", &doc.name),
        ("version", &doc.version),
    ] {
        if value.trim().is_empty() {
            return Err(invalid(format!("document {field} must not be empty")));
        }
    }
    for (field, value) in [("namespace", &doc.namespace), ("name", &doc.name)] {
        if !value
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid(format!(
                "document {field} '{value}' contains invalid characters (only alphanumeric, '-' and '_' allowed)"
            )));
        }
    }

    for (name, policy) in &def.components.retries {
        validate_retry_policy(&format!("use.retries.{name}"), policy)?;
    }

    validate_list(def, &def.tasks, None, ScopeKind::Do)
}

fn invalid(message: String) -> WorkflowError {
    WorkflowError::ValidationError(message)
}

fn validate_list(
    def: &WorkflowDefinition,
    tasks: &[TaskDefinition],
    owner: Option<&TaskReference>,
    scope: ScopeKind,
) -> Result<(), WorkflowError> {
    let location = owner.map_or_else(|| "workflow".to_string(), |o| format!("{o}/{scope}"));
    if tasks.is_empty() {
        return Err(invalid(format!("{location}: task list must not be empty")));
    }

    let mut seen = HashSet::new();
    for (index, task) in tasks.iter().enumerate() {
        if task.name.is_empty() || task.name.contains('/') {
            return Err(invalid(format!(
                "{location}: task name '{}' must be non-empty and must not contain '/'",
                task.name
            )));
        }
        if !seen.insert(task.name.as_str()) {
            return Err(invalid(format!("{location}: duplicate task name '{}'", task.name)));
        }

        let reference = match owner {
            None => TaskReference::root(index, &task.name),
            Some(o) => o.child(scope, index, &task.name),
        };
        validate_task(def, task, &reference)?;
    }
    Ok(())
}

fn validate_task(
    def: &WorkflowDefinition,
    task: &TaskDefinition,
    reference: &TaskReference,
) -> Result<(), WorkflowError> {
    if task.timeout_secs == Some(0) {
        return Err(invalid(format!("{reference}: timeout_secs must be > 0")));
    }
    if let Some(FlowDirective::Goto(_)) = &task.then {
        check_directive(def, reference, &task.directive())?;
    }

    match &task.kind {
        TaskKind::Do(t) => validate_list(def, &t.tasks, Some(reference), ScopeKind::Do)?,
        TaskKind::For(t) => {
            if t.source.trim().is_empty() {
                return Err(invalid(format!("{reference}: for.in must not be empty")));
            }
            validate_list(def, &t.tasks, Some(reference), ScopeKind::Do)?;
        }
        TaskKind::Fork(t) => {
            validate_list(def, &t.branches, Some(reference), ScopeKind::Branches)?;
        }
        TaskKind::Try(t) => {
            validate_list(def, &t.tasks, Some(reference), ScopeKind::Try)?;
            if let Some(tasks) = &t.catch.tasks {
                validate_list(def, tasks, Some(reference), ScopeKind::Catch)?;
            }
            match &t.catch.retry {
                Some(RetryPolicyRef::Named(name)) if !def.components.retries.contains_key(name) => {
                    return Err(invalid(format!(
                        "{reference}: unknown retry policy '{name}'"
                    )));
                }
                Some(RetryPolicyRef::Inline(policy)) => {
                    validate_retry_policy(&format!("{reference}/catch/retry"), policy)?;
                }
                _ => {}
            }
        }
        TaskKind::Switch(t) => {
            if t.cases.is_empty() {
                return Err(invalid(format!("{reference}: switch must have cases")));
            }
            let defaults = t.cases.iter().filter(|c| c.when.is_none()).count();
            if defaults > 1 {
                return Err(invalid(format!(
                    "{reference}: switch has {defaults} default cases"
                )));
            }
            for case in &t.cases {
                if matches!(case.then, FlowDirective::Goto(_)) {
                    check_directive(def, reference, &case.then)?;
                }
            }
        }
        TaskKind::Call(t) if t.function.trim().is_empty() => {
            return Err(invalid(format!("{reference}: call.function must not be empty")));
        }
        _ => {}
    }
    Ok(())
}

fn validate_retry_policy(location: &str, policy: &RetryPolicy) -> Result<(), WorkflowError> {
    let limit = &policy.limit;
    let bounded = limit.attempt.count.is_some()
        || (limit.duration_ms.is_some() && policy.delay_ms > 0);
    if !bounded {
        return Err(invalid(format!(
            "{location}: retry policy needs limit.attempt.count, or limit.duration_ms with a non-zero delay_ms"
        )));
    }
    if let Some(jitter) = &policy.jitter {
        if jitter.from_ms > jitter.to_ms {
            return Err(invalid(format!(
                "{location}: jitter from_ms ({}) exceeds to_ms ({})",
                jitter.from_ms, jitter.to_ms
            )));
        }
    }
    Ok(())
}

fn check_directive(
    def: &WorkflowDefinition,
    from: &TaskReference,
    directive: &FlowDirective,
) -> Result<(), WorkflowError> {
    resolve_next(def, from, directive)
        .map(|_| ())
        .map_err(|e| invalid(e.to_string()))
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML or JSON file (by extension).
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

/// Discover all workflow files (`.yaml`, `.yml`, `.json`) under `base_dir`.
///
/// Files that fail to parse are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_workflow = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e, "yaml" | "yml" | "json"));
        if !is_workflow {
            continue;
        }
        match load_workflow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping unparseable workflow file"),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "document: { namespace: test, name: wf, version: '1' }\n";

    fn parse(body: &str) -> Result<WorkflowDefinition, WorkflowError> {
        parse_workflow_yaml(&format!("{HEADER}{body}"))
    }

    fn expect_invalid(body: &str, needle: &str) {
        match parse(body) {
            Err(WorkflowError::ValidationError(msg)) => {
                assert!(msg.contains(needle), "'{msg}' should mention '{needle}'")
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_definition_parses() {
        let def = parse(
            r#"
do:
  - name: first
    type: set
    set: { a: 1 }
  - name: pick
    type: switch
    cases:
      - name: again
        when: "input.a < 3"
        then: first
      - name: fallback
        then: end
"#,
        )
        .unwrap();
        assert_eq!(def.tasks.len(), 2);
    }

    #[test]
    fn test_empty_workflow_rejected() {
        expect_invalid("do: []\n", "must not be empty");
    }

    #[test]
    fn test_duplicate_names_rejected() {
        expect_invalid(
            r#"
do:
  - { name: a, type: set, set: {} }
  - { name: a, type: set, set: {} }
"#,
            "duplicate task name 'a'",
        );
    }

    #[test]
    fn test_unknown_goto_rejected() {
        expect_invalid(
            r#"
do:
  - { name: a, type: set, set: {}, then: nowhere }
"#,
            "nowhere",
        );
    }

    #[test]
    fn test_goto_out_of_loop_rejected() {
        expect_invalid(
            r#"
do:
  - name: start
    type: set
    set: {}
  - name: loop
    type: for
    in: "input.items"
    do:
      - { name: body, type: set, set: {}, then: start }
"#,
            "start",
        );
    }

    #[test]
    fn test_unknown_retry_policy_rejected() {
        expect_invalid(
            r#"
do:
  - name: guarded
    type: try
    try:
      - { name: a, type: set, set: {} }
    catch:
      retry: missing
"#,
            "unknown retry policy 'missing'",
        );
    }

    #[test]
    fn test_unbounded_inline_retry_rejected() {
        expect_invalid(
            r#"
do:
  - name: guarded
    type: try
    try:
      - name: fail
        type: raise
        error: { type: https://example.com/errors/boom, status: 500, title: Boom }
    catch:
      retry: {}
"#,
            "retry policy needs limit.attempt.count",
        );
    }

    #[test]
    fn test_duration_limit_without_delay_rejected() {
        expect_invalid(
            r#"
use:
  retries:
    spin:
      limit:
        duration_ms: 1000
do:
  - { name: a, type: set, set: {} }
"#,
            "use.retries.spin",
        );
    }

    #[test]
    fn test_bounded_retry_policies_accepted() {
        let def = parse(
            r#"
use:
  retries:
    patient:
      delay_ms: 100
      limit:
        duration_ms: 5000
do:
  - name: guarded
    type: try
    try:
      - { name: a, type: set, set: {} }
    catch:
      retry:
        limit:
          attempt:
            count: 2
"#,
        )
        .unwrap();
        assert_eq!(def.components.retries.len(), 1);
    }

    #[test]
    fn test_inverted_jitter_rejected() {
        expect_invalid(
            r#"
do:
  - name: guarded
    type: try
    try:
      - { name: a, type: set, set: {} }
    catch:
      retry:
        limit: { attempt: { count: 1 } }
        jitter: { from_ms: 50, to_ms: 10 }
"#,
            "jitter from_ms (50) exceeds to_ms (10)",
        );
    }

    #[test]
    fn test_two_default_cases_rejected() {
        expect_invalid(
            r#"
do:
  - name: pick
    type: switch
    cases:
      - { name: one }
      - { name: two }
"#,
            "2 default cases",
        );
    }

    #[test]
    fn test_invalid_document_name_rejected() {
        let yaml = "document: { namespace: test, name: 'bad name', version: '1' }\ndo:\n  - { name: a, type: set, set: {} }\n";
        assert!(matches!(
            parse_workflow_yaml(yaml),
            Err(WorkflowError::ValidationError(_))
        ));
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        assert!(matches!(
            parse_workflow_yaml("do: [unclosed"),
            Err(WorkflowError::ParseError(_))
        ));
    }

    #[test]
    fn test_json_definition_parses() {
        let json = r#"{
            "document": {"namespace": "test", "name": "wf", "version": "1"},
            "do": [{"name": "a", "type": "set", "set": {"x": 1}}]
        }"#;
        assert_eq!(parse_workflow_json(json).unwrap().tasks[0].name, "a");
    }

    #[test]
    fn test_yaml_roundtrip() {
        let def = parse("do:\n  - { name: a, type: wait, duration_ms: 5 }\n").unwrap();
        let yaml = serde_yaml_ng::to_string(&def).unwrap();
        assert_eq!(parse_workflow_yaml(&yaml).unwrap(), def);
    }

    #[test]
    fn test_discover_skips_invalid_files() {
        let dir = std::env::temp_dir().join(format!("conduit-discover-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(
            dir.join("nested/ok.yaml"),
            format!("{HEADER}do:\n  - {{ name: a, type: set, set: {{}} }}\n"),
        )
        .unwrap();
        std::fs::write(dir.join("broken.yml"), "not: [valid").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let found = discover_workflows(&dir).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.document.name, "wf");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
