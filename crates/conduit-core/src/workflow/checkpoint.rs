//! Durable checkpoints of workflow instances.
//!
//! Wraps an `InstanceStore` with the write discipline the runner relies on:
//! every write carries the version the instance was loaded at, and a stale
//! write surfaces as [`CheckpointError::Conflict`] so the caller can reload
//! and recompute instead of overwriting newer state.

use conduit_types::error::RepositoryError;
use conduit_types::instance::{WorkflowInstance, WorkflowStatus};
use uuid::Uuid;

use crate::repository::InstanceStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Versioned persistence for workflow instances.
///
/// Generic over `S: InstanceStore` so it works with any storage backend.
pub struct CheckpointManager<S: InstanceStore> {
    store: S,
}

impl<S: InstanceStore> CheckpointManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist a new instance and record the stored version on it.
    pub async fn create(&self, instance: &mut WorkflowInstance) -> Result<(), CheckpointError> {
        let version = self
            .store
            .create(instance)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        instance.version = version;
        tracing::debug!(instance_id = %instance.id, version, "checkpointed new instance");
        Ok(())
    }

    pub async fn load(&self, instance_id: Uuid) -> Result<WorkflowInstance, CheckpointError> {
        self.store
            .get(&instance_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::InstanceNotFound(instance_id))
    }

    /// Write `instance` if nobody else wrote it since it was loaded.
    pub async fn save(&self, instance: &mut WorkflowInstance) -> Result<(), CheckpointError> {
        match self.store.update(instance, instance.version).await {
            Ok(version) => {
                tracing::debug!(
                    instance_id = %instance.id,
                    status = %instance.status,
                    version,
                    "checkpointed instance"
                );
                instance.version = version;
                Ok(())
            }
            Err(RepositoryError::Conflict { expected, actual }) => Err(CheckpointError::Conflict {
                instance_id: instance.id,
                expected,
                actual,
            }),
            Err(RepositoryError::NotFound) => Err(CheckpointError::InstanceNotFound(instance.id)),
            Err(e) => Err(CheckpointError::Repository(e.to_string())),
        }
    }

    /// Instances that may still make progress (running or suspended).
    pub async fn list_active(&self) -> Result<Vec<WorkflowInstance>, CheckpointError> {
        let mut active = Vec::new();
        for status in [WorkflowStatus::Running, WorkflowStatus::Suspended] {
            let found = self
                .store
                .list_by_status(status)
                .await
                .map_err(|e| CheckpointError::Repository(e.to_string()))?;
            active.extend(found);
        }
        Ok(active)
    }
}

// ---------------------------------------------------------------------------
// CheckpointError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// The instance was written by someone else since it was loaded.
    #[error("stale checkpoint for {instance_id}: expected version {expected}, found {actual}")]
    Conflict {
        instance_id: Uuid,
        expected: u64,
        actual: u64,
    },
}
