//! Capability ports the interpreter calls out through.
//!
//! Each capability is declared twice, following the provider pattern used
//! across the engine:
//! 1. an ergonomic trait with RPITIT async methods (`FunctionCaller`,
//!    `RuntimeHost`, `EventPublisher`) for implementors;
//! 2. an object-safe `*Dyn` twin with boxed futures, blanket-implemented
//!    for every implementor, so [`Capabilities`] can hold them as
//!    `Arc<dyn ...>` and look them up at runtime.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use conduit_types::correlation::CloudEvent;
use conduit_types::error::TaskError;
use conduit_types::reference::TaskReference;
use conduit_types::task::{ProcessKind, ProcessReturn, ProcessSpec};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::expression::{ExpressionEvaluator, WorkflowEvaluator};

type BoxedResult<'a, T> = Pin<Box<dyn Future<Output = Result<T, TaskError>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// Function calls
// ---------------------------------------------------------------------------

/// A `call` task invocation with its arguments already evaluated.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub instance_id: Uuid,
    pub task_id: Uuid,
    pub reference: TaskReference,
    pub function: String,
    pub arguments: Map<String, Value>,
}

/// Executes a named function for `call` tasks.
pub trait FunctionCaller: Send + Sync {
    fn call(&self, request: CallRequest) -> impl Future<Output = Result<Value, TaskError>> + Send;
}

/// Object-safe version of [`FunctionCaller`].
pub trait FunctionCallerDyn: Send + Sync {
    fn call_boxed(&self, request: CallRequest) -> BoxedResult<'_, Value>;
}

impl<T: FunctionCaller> FunctionCallerDyn for T {
    fn call_boxed(&self, request: CallRequest) -> BoxedResult<'_, Value> {
        Box::pin(self.call(request))
    }
}

/// Adapts a synchronous closure into a [`FunctionCaller`].
pub struct FnCaller<F>(pub F);

impl<F> FunctionCaller for FnCaller<F>
where
    F: Fn(CallRequest) -> Result<Value, TaskError> + Send + Sync,
{
    async fn call(&self, request: CallRequest) -> Result<Value, TaskError> {
        (self.0)(request)
    }
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

/// A `run` task launch with its process spec already evaluated.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub instance_id: Uuid,
    pub task_id: Uuid,
    pub reference: TaskReference,
    pub process: ProcessSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl ProcessOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// The task output selected by the `return` setting.
    pub fn project(&self, returns: ProcessReturn) -> Value {
        match returns {
            ProcessReturn::Stdout => Value::String(self.stdout.trim_end().to_string()),
            ProcessReturn::Stderr => Value::String(self.stderr.trim_end().to_string()),
            ProcessReturn::Code => json!(self.exit_code),
            ProcessReturn::All => json!({
                "code": self.exit_code,
                "stdout": self.stdout,
                "stderr": self.stderr,
            }),
            ProcessReturn::None => Value::Null,
        }
    }
}

/// Launches processes of one [`ProcessKind`].
///
/// Implementations must stop the process when `cancel` fires and then
/// return promptly.
pub trait RuntimeHost: Send + Sync {
    fn run(
        &self,
        request: ProcessRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<ProcessOutput, TaskError>> + Send;
}

/// Object-safe version of [`RuntimeHost`].
pub trait RuntimeHostDyn: Send + Sync {
    fn run_boxed(
        &self,
        request: ProcessRequest,
        cancel: CancellationToken,
    ) -> BoxedResult<'_, ProcessOutput>;
}

impl<T: RuntimeHost> RuntimeHostDyn for T {
    fn run_boxed(
        &self,
        request: ProcessRequest,
        cancel: CancellationToken,
    ) -> BoxedResult<'_, ProcessOutput> {
        Box::pin(self.run(request, cancel))
    }
}

// ---------------------------------------------------------------------------
// Event publishing
// ---------------------------------------------------------------------------

/// Delivers events built by `emit` tasks.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: CloudEvent) -> impl Future<Output = Result<(), TaskError>> + Send;
}

/// Object-safe version of [`EventPublisher`].
pub trait EventPublisherDyn: Send + Sync {
    fn publish_boxed(&self, event: CloudEvent) -> BoxedResult<'_, ()>;
}

impl<T: EventPublisher> EventPublisherDyn for T {
    fn publish_boxed(&self, event: CloudEvent) -> BoxedResult<'_, ()> {
        Box::pin(self.publish(event))
    }
}

// ---------------------------------------------------------------------------
// Schema validation
// ---------------------------------------------------------------------------

/// Validates task and workflow payloads against declared schemas.
pub trait SchemaValidator: Send + Sync {
    /// `Err` carries a human-readable description of the first violation.
    fn validate(&self, data: &Value, schema: &Value) -> Result<(), String>;
}

/// Accepts every payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllSchemas;

impl SchemaValidator for AcceptAllSchemas {
    fn validate(&self, _data: &Value, _schema: &Value) -> Result<(), String> {
        Ok(())
    }
}

/// Structural subset of JSON Schema: `type`, `required`, `properties`,
/// `items` and `enum`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralSchemaValidator;

impl StructuralSchemaValidator {
    fn check(data: &Value, schema: &Value, path: &str) -> Result<(), String> {
        let Some(schema) = schema.as_object() else {
            return Ok(());
        };

        if let Some(expected) = schema.get("type").and_then(Value::as_str) {
            let ok = match expected {
                "object" => data.is_object(),
                "array" => data.is_array(),
                "string" => data.is_string(),
                "number" => data.is_number(),
                "integer" => data.is_i64() || data.is_u64(),
                "boolean" => data.is_boolean(),
                "null" => data.is_null(),
                _ => true,
            };
            if !ok {
                return Err(format!("{path}: expected {expected}"));
            }
        }

        if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
            if !allowed.contains(data) {
                return Err(format!("{path}: value not in enum"));
            }
        }

        if let (Some(required), Some(object)) =
            (schema.get("required").and_then(Value::as_array), data.as_object())
        {
            for field in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(field) {
                    return Err(format!("{path}: missing required property '{field}'"));
                }
            }
        }

        if let (Some(properties), Some(object)) =
            (schema.get("properties").and_then(Value::as_object), data.as_object())
        {
            for (name, sub) in properties {
                if let Some(value) = object.get(name) {
                    Self::check(value, sub, &format!("{path}.{name}"))?;
                }
            }
        }

        if let (Some(items), Some(array)) = (schema.get("items"), data.as_array()) {
            for (i, value) in array.iter().enumerate() {
                Self::check(value, items, &format!("{path}[{i}]"))?;
            }
        }
        Ok(())
    }
}

impl SchemaValidator for StructuralSchemaValidator {
    fn validate(&self, data: &Value, schema: &Value) -> Result<(), String> {
        Self::check(data, schema, "$")
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Runtime registry of everything the interpreter can call out to.
#[derive(Clone)]
pub struct Capabilities {
    functions: HashMap<String, Arc<dyn FunctionCallerDyn>>,
    hosts: HashMap<ProcessKind, Arc<dyn RuntimeHostDyn>>,
    publisher: Option<Arc<dyn EventPublisherDyn>>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    validator: Arc<dyn SchemaValidator>,
}

impl Capabilities {
    /// JEXL expressions, structural schemas, nothing else registered.
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
            hosts: HashMap::new(),
            publisher: None,
            evaluator: Arc::new(WorkflowEvaluator::new()),
            validator: Arc::new(StructuralSchemaValidator),
        }
    }

    pub fn with_function(
        mut self,
        name: impl Into<String>,
        caller: impl FunctionCaller + 'static,
    ) -> Self {
        self.functions.insert(name.into(), Arc::new(caller));
        self
    }

    pub fn with_host(mut self, kind: ProcessKind, host: impl RuntimeHost + 'static) -> Self {
        self.hosts.insert(kind, Arc::new(host));
        self
    }

    pub fn with_publisher(mut self, publisher: impl EventPublisher + 'static) -> Self {
        self.publisher = Some(Arc::new(publisher));
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn function(&self, name: &str) -> Option<Arc<dyn FunctionCallerDyn>> {
        self.functions.get(name).cloned()
    }

    pub fn host(&self, kind: ProcessKind) -> Option<Arc<dyn RuntimeHostDyn>> {
        self.hosts.get(&kind).cloned()
    }

    pub fn publisher(&self) -> Option<Arc<dyn EventPublisherDyn>> {
        self.publisher.clone()
    }

    pub fn evaluator(&self) -> &dyn ExpressionEvaluator {
        self.evaluator.as_ref()
    }

    pub fn validator(&self) -> &dyn SchemaValidator {
        self.validator.as_ref()
    }

    /// Registered function names, sorted.
    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut hosts: Vec<String> = self.hosts.keys().map(ToString::to_string).collect();
        hosts.sort();
        f.debug_struct("Capabilities")
            .field("functions", &self.function_names())
            .field("hosts", &hosts)
            .field("publisher", &self.publisher.is_some())
            .finish()
    }
}
