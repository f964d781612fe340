//! Scope state of composite tasks and the data object expressions see.
//!
//! Expressions are evaluated against a JSON object with these keys:
//!
//! | key        | value                                                 |
//! |------------|-------------------------------------------------------|
//! | `input`    | the task input                                        |
//! | `output`   | the raw task output (output transforms only)          |
//! | `context`  | the workflow context, as updated by `export`          |
//! | `workflow` | `{ id, name, input }`                                 |
//! | `task`     | `{ name, reference }`                                 |
//! | *vars*     | loop item and index, caught error, from every ancestor |
//!
//! Reserved keys win over variables of the same name.

use conduit_types::instance::DocumentRef;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ScopeState
// ---------------------------------------------------------------------------

/// Bookkeeping a composite task keeps in its context document.
///
/// A `for` task rewrites this document once per iteration, so it only
/// holds fixed-size data: the sequence and the iteration outputs live in
/// documents of their own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeState {
    /// Variables visible to every descendant.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub vars: Map<String, Value>,
    /// `for`: document holding the sequence, evaluated once when the loop starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<DocumentRef>,
    /// `for`: length of the sequence.
    #[serde(default)]
    pub count: usize,
    /// `for`: index of the current iteration.
    #[serde(default)]
    pub position: usize,
    /// `for`: newest link of the iteration output chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<DocumentRef>,
}

impl ScopeState {
    /// Decode a stored scope document. A missing document is an empty scope.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// One iteration output of a `for` task, linked to the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputLink {
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<DocumentRef>,
}

// ---------------------------------------------------------------------------
// ExpressionData
// ---------------------------------------------------------------------------

/// Builder for the data object of one expression evaluation.
#[derive(Debug, Clone, Default)]
pub struct ExpressionData {
    vars: Map<String, Value>,
    reserved: Map<String, Value>,
}

impl ExpressionData {
    pub fn new(input: Value) -> Self {
        let mut data = Self::default();
        data.reserved.insert("input".to_string(), input);
        data
    }

    pub fn context(mut self, context: Value) -> Self {
        self.reserved.insert("context".to_string(), context);
        self
    }

    pub fn output(mut self, output: Value) -> Self {
        self.reserved.insert("output".to_string(), output);
        self
    }

    pub fn workflow(mut self, id: Uuid, name: &str, input: Value) -> Self {
        self.reserved.insert(
            "workflow".to_string(),
            json!({ "id": id.to_string(), "name": name, "input": input }),
        );
        self
    }

    pub fn task(mut self, name: &str, reference: &str) -> Self {
        self.reserved.insert(
            "task".to_string(),
            json!({ "name": name, "reference": reference }),
        );
        self
    }

    pub fn var(mut self, name: &str, value: Value) -> Self {
        self.vars.insert(name.to_string(), value);
        self
    }

    /// Add variables; later calls shadow earlier ones.
    pub fn vars(mut self, vars: &Map<String, Value>) -> Self {
        for (name, value) in vars {
            self.vars.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn into_value(self) -> Value {
        let mut out = self.vars;
        out.extend(self.reserved);
        Value::Object(out)
    }
}
