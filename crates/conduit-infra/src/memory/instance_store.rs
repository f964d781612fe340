//! In-memory implementation of [`InstanceStore`].

use std::sync::Arc;

use conduit_core::repository::InstanceStore;
use conduit_types::error::RepositoryError;
use conduit_types::instance::{WorkflowInstance, WorkflowStatus};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

/// Versioned instance rows. Clones share the same rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryInstanceStore {
    rows: Arc<DashMap<Uuid, WorkflowInstance>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl InstanceStore for MemoryInstanceStore {
    async fn create(&self, instance: &WorkflowInstance) -> Result<u64, RepositoryError> {
        match self.rows.entry(instance.id) {
            Entry::Occupied(_) => Err(RepositoryError::Storage(format!(
                "instance {} already exists",
                instance.id
            ))),
            Entry::Vacant(slot) => {
                let mut row = instance.clone();
                row.version = 1;
                slot.insert(row);
                Ok(1)
            }
        }
    }

    async fn get(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.rows.get(id).map(|row| row.value().clone()))
    }

    async fn update(
        &self,
        instance: &WorkflowInstance,
        expected_version: u64,
    ) -> Result<u64, RepositoryError> {
        let mut row = self
            .rows
            .get_mut(&instance.id)
            .ok_or(RepositoryError::NotFound)?;
        if row.version != expected_version {
            return Err(RepositoryError::Conflict {
                expected: expected_version,
                actual: row.version,
            });
        }
        let version = expected_version + 1;
        *row = instance.clone();
        row.version = version;
        Ok(version)
    }

    async fn list_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut found: Vec<WorkflowInstance> = self
            .rows
            .iter()
            .filter(|row| row.status == status)
            .map(|row| row.value().clone())
            .collect();
        found.sort_by_key(|instance| instance.created_at);
        Ok(found)
    }
}
