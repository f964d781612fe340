//! Task definition model.
//!
//! The immutable, in-memory form of a workflow document. Every task is a
//! [`TaskDefinition`]: the fields shared by all kinds (`if`, `input`,
//! `output`, `export`, `timeout_secs`, `then`) plus one [`TaskKind`] variant
//! internally tagged by `type`:
//!
//! ```yaml
//! document:
//!   namespace: shop
//!   name: checkout
//!   version: 1.0.0
//! do:
//!   - name: charge
//!     type: call
//!     function: http
//!     with:
//!       method: POST
//!       endpoint: https://payments.example.com/charge
//!   - name: done
//!     type: set
//!     set:
//!       ok: true
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::correlation::ConsumptionStrategy;
use crate::error::TaskError;
use crate::reference::{ScopeKind, TaskReference};
use crate::retry::{RetryPolicy, RetryPolicyRef};

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// Identity block of a workflow document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub namespace: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Addresses one version of one workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionRef {
    pub namespace: String,
    pub name: String,
    pub version: String,
}

impl fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.namespace, self.name, self.version)
    }
}

/// Reusable components declared under `use`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Components {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub retries: BTreeMap<String, RetryPolicy>,
}

/// A complete workflow definition. Immutable once loaded and freely shared
/// between instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub document: DocumentMetadata,
    #[serde(default, rename = "use")]
    pub components: Components,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputTransform>,
    /// Top-level tasks, executed sequentially.
    #[serde(rename = "do")]
    pub tasks: Vec<TaskDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputTransform>,
}

impl WorkflowDefinition {
    pub fn definition_ref(&self) -> DefinitionRef {
        DefinitionRef {
            namespace: self.document.namespace.clone(),
            name: self.document.name.clone(),
            version: self.document.version.clone(),
        }
    }

    /// Look up the task a reference points at.
    pub fn resolve(&self, reference: &TaskReference) -> Option<&TaskDefinition> {
        let mut list: &[TaskDefinition] = &self.tasks;
        let mut found = None;
        for step in reference.steps() {
            if let Some(owner) = found {
                list = TaskDefinition::children(owner, step.scope)?;
            }
            let task = list.get(step.index).filter(|t| t.name == step.name)?;
            found = Some(task);
        }
        found
    }

    /// The task list of a scope; `owner == None` is the top-level list.
    pub fn scope_tasks(
        &self,
        owner: Option<&TaskReference>,
        scope: ScopeKind,
    ) -> Option<&[TaskDefinition]> {
        match owner {
            None => (scope == ScopeKind::Do).then_some(self.tasks.as_slice()),
            Some(owner) => self.resolve(owner)?.children(scope),
        }
    }

    /// Resolve an inline or named retry policy.
    pub fn retry_policy<'a>(&'a self, policy: &'a RetryPolicyRef) -> Option<&'a RetryPolicy> {
        match policy {
            RetryPolicyRef::Inline(p) => Some(p),
            RetryPolicyRef::Named(name) => self.components.retries.get(name),
        }
    }
}

// ---------------------------------------------------------------------------
// Task definition
// ---------------------------------------------------------------------------

/// What runs after a task completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FlowDirective {
    /// Next sibling in declaration order.
    #[default]
    Continue,
    /// Leave the enclosing scope.
    Exit,
    /// Terminate the enclosing workflow, loop iteration or fork branch.
    End,
    /// Jump to the named task.
    Goto(String),
}

impl From<String> for FlowDirective {
    fn from(value: String) -> Self {
        match value.as_str() {
            "continue" => FlowDirective::Continue,
            "exit" => FlowDirective::Exit,
            "end" => FlowDirective::End,
            _ => FlowDirective::Goto(value),
        }
    }
}

impl From<FlowDirective> for String {
    fn from(value: FlowDirective) -> Self {
        value.to_string()
    }
}

impl fmt::Display for FlowDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowDirective::Continue => f.write_str("continue"),
            FlowDirective::Exit => f.write_str("exit"),
            FlowDirective::End => f.write_str("end"),
            FlowDirective::Goto(name) => f.write_str(name),
        }
    }
}

/// Shapes the data a task receives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputTransform {
    /// Value or `${ }` expression producing the task input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

/// Shapes the data a task produces (also used for `export`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputTransform {
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub projection: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

/// One node of the task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique within its scope.
    pub name: String,
    /// Guard; when false the task is skipped.
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputTransform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputTransform>,
    /// Updates the workflow context from the task output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<OutputTransform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<FlowDirective>,
    #[serde(flatten)]
    pub kind: TaskKind,
}

impl TaskDefinition {
    /// Child list of this task for the given scope, if it owns one.
    pub fn children(&self, scope: ScopeKind) -> Option<&[TaskDefinition]> {
        match (scope, &self.kind) {
            (ScopeKind::Do, TaskKind::Do(t)) => Some(&t.tasks),
            (ScopeKind::Do, TaskKind::For(t)) => Some(&t.tasks),
            (ScopeKind::Try, TaskKind::Try(t)) => Some(&t.tasks),
            (ScopeKind::Catch, TaskKind::Try(t)) => t.catch.tasks.as_deref(),
            (ScopeKind::Branches, TaskKind::Fork(t)) => Some(&t.branches),
            _ => None,
        }
    }

    /// The directive applied when the task completes without choosing one.
    pub fn directive(&self) -> FlowDirective {
        self.then.clone().unwrap_or_default()
    }
}

/// Kind-specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    Call(CallTask),
    Do(DoTask),
    Emit(EmitTask),
    For(ForTask),
    Fork(ForkTask),
    Listen(ListenTask),
    Raise(RaiseTask),
    Run(RunTask),
    Set(SetTask),
    Switch(SwitchTask),
    Try(TryTask),
    Wait(WaitTask),
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Call(_) => "call",
            TaskKind::Do(_) => "do",
            TaskKind::Emit(_) => "emit",
            TaskKind::For(_) => "for",
            TaskKind::Fork(_) => "fork",
            TaskKind::Listen(_) => "listen",
            TaskKind::Raise(_) => "raise",
            TaskKind::Run(_) => "run",
            TaskKind::Set(_) => "set",
            TaskKind::Switch(_) => "switch",
            TaskKind::Try(_) => "try",
            TaskKind::Wait(_) => "wait",
        }
    }
}

// ---------------------------------------------------------------------------
// Kind configurations
// ---------------------------------------------------------------------------

/// Invoke a registered function (e.g. `http`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTask {
    pub function: String,
    /// Arguments; string leaves may be `${ }` expressions.
    #[serde(default)]
    pub with: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoTask {
    #[serde(rename = "do")]
    pub tasks: Vec<TaskDefinition>,
}

/// Publish an event built from an attribute template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitTask {
    pub event: Map<String, Value>,
}

fn default_each() -> String {
    "item".to_string()
}

fn default_at() -> String {
    "index".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForTask {
    /// Variable bound to the current item.
    #[serde(default = "default_each")]
    pub each: String,
    /// Expression producing the item sequence, evaluated once.
    #[serde(rename = "in")]
    pub source: String,
    /// Variable bound to the current index.
    #[serde(default = "default_at")]
    pub at: String,
    /// Checked before each iteration.
    #[serde(default, rename = "while", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(rename = "do")]
    pub tasks: Vec<TaskDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkTask {
    pub branches: Vec<TaskDefinition>,
    /// First completed branch wins and the rest are cancelled.
    #[serde(default)]
    pub compete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenTask {
    pub to: ConsumptionStrategy,
    /// Streaming: keep consuming until this holds against `{ events, keys }`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseTask {
    pub error: TaskError,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTask {
    pub process: ProcessSpec,
    /// When false the task completes as soon as the process is launched.
    #[serde(default = "default_true", rename = "await")]
    pub await_completion: bool,
    #[serde(default, rename = "return")]
    pub returns: ProcessReturn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetTask {
    pub set: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub name: String,
    /// Absent on the default case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default)]
    pub then: FlowDirective,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchTask {
    pub cases: Vec<SwitchCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryTask {
    #[serde(rename = "try")]
    pub tasks: Vec<TaskDefinition>,
    pub catch: CatchClause,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatchClause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorFilter>,
    /// Variable the caught error is bound to (default `error`).
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub binding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicyRef>,
    /// Recovery body.
    #[serde(default, rename = "do", skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<TaskDefinition>>,
}

impl CatchClause {
    pub fn binding(&self) -> &str {
        self.binding.as_deref().unwrap_or("error")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorFilter {
    #[serde(default)]
    pub with: ErrorMatcher,
}

/// Error properties a caught error must carry. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorMatcher {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Number or string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitTask {
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

/// Runtime host a process is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Container,
    Shell,
    Script,
    Workflow,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessKind::Container => "container",
            ProcessKind::Shell => "shell",
            ProcessKind::Script => "script",
            ProcessKind::Workflow => "workflow",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessSpec {
    Container(ContainerProcess),
    Shell(ShellProcess),
    Script(ScriptProcess),
    Workflow(SubWorkflowProcess),
}

impl ProcessSpec {
    pub fn kind(&self) -> ProcessKind {
        match self {
            ProcessSpec::Container(_) => ProcessKind::Container,
            ProcessSpec::Shell(_) => ProcessKind::Shell,
            ProcessSpec::Script(_) => ProcessKind::Script,
            ProcessSpec::Workflow(_) => ProcessKind::Workflow,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerProcess {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellProcess {
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptProcess {
    /// e.g. `python`, `js`.
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubWorkflowProcess {
    pub namespace: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub input: Value,
}

/// Which part of a finished process becomes the task output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessReturn {
    #[default]
    Stdout,
    Stderr,
    Code,
    All,
    None,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const NESTED: &str = r#"
document:
  namespace: test
  name: nested
  version: 0.1.0
use:
  retries:
    patient:
      delay_ms: 1000
      backoff: linear
do:
  - name: prepare
    type: set
    set:
      count: 3
  - name: guarded
    type: try
    try:
      - name: charge
        type: call
        function: http
        with:
          endpoint: https://example.com
    catch:
      errors:
        with:
          status: 503
      retry: patient
      do:
        - name: compensate
          type: raise
          error:
            type: https://example.com/errors/compensated
            status: 500
  - name: fan-out
    type: fork
    branches:
      - name: left
        type: wait
        duration_ms: 10
      - name: right
        type: do
        do:
          - name: inner
            type: emit
            event:
              source: test
              type: test.done
    then: end
"#;

    fn nested() -> WorkflowDefinition {
        serde_yaml_ng::from_str(NESTED).unwrap()
    }

    #[test]
    fn test_parses_nested_kinds_and_common_fields() {
        let def = nested();
        assert_eq!(def.tasks.len(), 3);
        assert!(matches!(def.tasks[0].kind, TaskKind::Set(_)));
        assert_eq!(def.tasks[2].then, Some(FlowDirective::End));
        assert_eq!(def.definition_ref().to_string(), "test.nested:0.1.0");

        let TaskKind::Try(t) = &def.tasks[1].kind else {
            panic!("expected try");
        };
        assert_eq!(t.catch.binding(), "error");
        assert_eq!(t.catch.tasks.as_ref().map(Vec::len), Some(1));
        let policy = def.retry_policy(t.catch.retry.as_ref().unwrap()).unwrap();
        assert_eq!(policy.delay_ms, 1000);
    }

    #[test]
    fn test_resolve_walks_every_scope_kind() {
        let def = nested();
        let guarded = TaskReference::root(1, "guarded");

        let charge = guarded.child(ScopeKind::Try, 0, "charge");
        assert_eq!(def.resolve(&charge).unwrap().name, "charge");

        let compensate = guarded.child(ScopeKind::Catch, 0, "compensate");
        assert!(matches!(def.resolve(&compensate).unwrap().kind, TaskKind::Raise(_)));

        let inner = TaskReference::root(2, "fan-out")
            .child(ScopeKind::Branches, 1, "right")
            .child(ScopeKind::Do, 0, "inner");
        assert!(matches!(def.resolve(&inner).unwrap().kind, TaskKind::Emit(_)));
    }

    #[test]
    fn test_resolve_rejects_name_mismatch_and_wrong_scope() {
        let def = nested();
        assert!(def.resolve(&TaskReference::root(0, "other")).is_none());
        assert!(def.resolve(&TaskReference::root(9, "prepare")).is_none());
        let wrong_scope = TaskReference::root(1, "guarded").child(ScopeKind::Do, 0, "charge");
        assert!(def.resolve(&wrong_scope).is_none());
    }

    #[test]
    fn test_scope_tasks_returns_root_and_nested_lists() {
        let def = nested();
        assert_eq!(def.scope_tasks(None, ScopeKind::Do).unwrap().len(), 3);
        assert!(def.scope_tasks(None, ScopeKind::Try).is_none());
        let fork = TaskReference::root(2, "fan-out");
        assert_eq!(def.scope_tasks(Some(&fork), ScopeKind::Branches).unwrap().len(), 2);
    }

    #[test]
    fn test_flow_directive_string_forms() {
        let d: FlowDirective = serde_json::from_str("\"exit\"").unwrap();
        assert_eq!(d, FlowDirective::Exit);
        let d: FlowDirective = serde_json::from_str("\"cleanup\"").unwrap();
        assert_eq!(d, FlowDirective::Goto("cleanup".into()));
        assert_eq!(serde_json::to_string(&FlowDirective::End).unwrap(), "\"end\"");
    }

    #[test]
    fn test_for_and_run_defaults() {
        let yaml = r#"
name: loop
type: for
in: "input.items"
do:
  - name: build
    type: run
    process:
      shell:
        command: make
"#;
        let task: TaskDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        let TaskKind::For(f) = &task.kind else {
            panic!("expected for");
        };
        assert_eq!(f.each, "item");
        assert_eq!(f.at, "index");
        let TaskKind::Run(r) = &f.tasks[0].kind else {
            panic!("expected run");
        };
        assert!(r.await_completion);
        assert_eq!(r.returns, ProcessReturn::Stdout);
        assert_eq!(r.process.kind(), ProcessKind::Shell);
    }
}
