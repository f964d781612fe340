//! Span and event field names for workflow instrumentation.
//!
//! Usable as constant field names in `tracing` macros:
//! `info_span!("workflow.run", { WORKFLOW_NAME } = name)`.

// --- Workflow definition ---

pub const WORKFLOW_NAMESPACE: &str = "workflow.namespace";

pub const WORKFLOW_NAME: &str = "workflow.name";

pub const WORKFLOW_VERSION: &str = "workflow.version";

// --- Workflow instance ---

/// UUID v7 of the instance.
pub const WORKFLOW_INSTANCE_ID: &str = "workflow.instance.id";

/// Final or current `WorkflowStatus`, snake_case.
pub const WORKFLOW_INSTANCE_STATUS: &str = "workflow.instance.status";

// --- Events ---

/// CloudEvents `type` attribute of an ingested or emitted event.
pub const EVENT_TYPE: &str = "cloudevents.event_type";

pub const EVENT_ID: &str = "cloudevents.event_id";

// --- Operation names ---

pub const OP_VALIDATE: &str = "workflow.validate";

pub const OP_RUN: &str = "workflow.run";
