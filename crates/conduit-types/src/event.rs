//! Engine lifecycle events.
//!
//! `EngineEvent` is broadcast on the engine event bus for observers (CLI
//! progress output, audit logging, metrics). Events describe what already
//! happened; the engine never reads them back to drive execution.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instance::TaskStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A workflow instance started running.
    InstanceStarted {
        instance_id: Uuid,
        workflow: String,
    },

    /// A suspended instance re-entered the interpreter.
    InstanceResumed { instance_id: Uuid, trigger: String },

    /// Every remaining task is waiting on an event, timer or process.
    InstanceSuspended { instance_id: Uuid },

    InstanceCompleted {
        instance_id: Uuid,
        duration_ms: u64,
    },

    InstanceFaulted {
        instance_id: Uuid,
        error: String,
        task: Option<String>,
    },

    InstanceCancelled { instance_id: Uuid },

    /// A task instance moved to a new status.
    TaskStatusChanged {
        instance_id: Uuid,
        task_id: Uuid,
        reference: String,
        status: TaskStatus,
    },

    /// A caught error will be retried after `delay_ms`.
    RetryScheduled {
        instance_id: Uuid,
        task_id: Uuid,
        attempt: u32,
        delay_ms: u64,
    },
}

impl EngineEvent {
    pub fn instance_id(&self) -> Uuid {
        match self {
            EngineEvent::InstanceStarted { instance_id, .. }
            | EngineEvent::InstanceResumed { instance_id, .. }
            | EngineEvent::InstanceSuspended { instance_id }
            | EngineEvent::InstanceCompleted { instance_id, .. }
            | EngineEvent::InstanceFaulted { instance_id, .. }
            | EngineEvent::InstanceCancelled { instance_id }
            | EngineEvent::TaskStatusChanged { instance_id, .. }
            | EngineEvent::RetryScheduled { instance_id, .. } => *instance_id,
        }
    }

    /// Task the event concerns, for task-scoped variants.
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::TaskStatusChanged { task_id, .. }
            | EngineEvent::RetryScheduled { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}
