//! Routing of inbound events to suspended instances.
//!
//! `CorrelationIngress` tracks which instances have a `listen` task waiting,
//! so an inbound event is only offered to instances that can consume it.
//! Entries are added and removed by the runner when it executes the
//! `Subscribe`/`Unsubscribe` commands a drive returns, and rebuilt from
//! persisted correlations on restart.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// CorrelationIngress
// ---------------------------------------------------------------------------

/// Thread-safe registry of listening tasks, keyed by task id.
#[derive(Clone, Default)]
pub struct CorrelationIngress {
    /// Listen task id -> owning instance id.
    listeners: Arc<DashMap<Uuid, Uuid>>,
}

impl CorrelationIngress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route events to `instance_id` on behalf of `task_id`.
    pub fn register(&self, instance_id: Uuid, task_id: Uuid) {
        tracing::debug!(instance_id = %instance_id, task_id = %task_id, "listener registered");
        self.listeners.insert(task_id, instance_id);
    }

    /// Returns true if the task was registered.
    pub fn unregister(&self, task_id: Uuid) -> bool {
        let removed = self.listeners.remove(&task_id).is_some();
        if removed {
            tracing::debug!(task_id = %task_id, "listener unregistered");
        }
        removed
    }

    /// Drop every listener of an instance.
    pub fn forget_instance(&self, instance_id: Uuid) {
        self.listeners.retain(|_, owner| *owner != instance_id);
    }

    /// Instances with at least one listening task, sorted and deduplicated.
    pub fn instances(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.listeners.iter().map(|r| *r.value()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
