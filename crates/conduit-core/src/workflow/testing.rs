//! In-memory port implementations shared by the engine tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use conduit_types::error::RepositoryError;
use conduit_types::instance::{DocumentRef, WorkflowInstance, WorkflowStatus};
use conduit_types::task::{DefinitionRef, WorkflowDefinition};
use serde_json::Value;
use uuid::Uuid;

use crate::repository::{DefinitionProvider, DocumentStore, InstanceStore};

/// Clones share the same rows, like two processes over one database.
#[derive(Clone, Default)]
pub struct MemoryInstances {
    rows: Arc<Mutex<HashMap<Uuid, WorkflowInstance>>>,
}

impl MemoryInstances {
    pub fn raw(&self, id: Uuid) -> Option<WorkflowInstance> {
        self.rows.lock().unwrap().get(&id).cloned()
    }
}

impl InstanceStore for MemoryInstances {
    async fn create(&self, instance: &WorkflowInstance) -> Result<u64, RepositoryError> {
        let mut stored = instance.clone();
        stored.version = 1;
        self.rows.lock().unwrap().insert(stored.id, stored);
        Ok(1)
    }

    async fn get(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.rows.lock().unwrap().get(id).cloned())
    }

    async fn update(
        &self,
        instance: &WorkflowInstance,
        expected_version: u64,
    ) -> Result<u64, RepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        let current = rows.get(&instance.id).ok_or(RepositoryError::NotFound)?;
        if current.version != expected_version {
            return Err(RepositoryError::Conflict {
                expected: expected_version,
                actual: current.version,
            });
        }
        let mut stored = instance.clone();
        stored.version = expected_version + 1;
        rows.insert(stored.id, stored);
        Ok(expected_version + 1)
    }

    async fn list_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryDocuments {
    docs: Mutex<HashMap<DocumentRef, Value>>,
}

impl DocumentStore for MemoryDocuments {
    async fn put(&self, payload: &Value) -> Result<DocumentRef, RepositoryError> {
        let reference = DocumentRef(Uuid::now_v7());
        self.docs.lock().unwrap().insert(reference, payload.clone());
        Ok(reference)
    }

    async fn get(&self, reference: &DocumentRef) -> Result<Value, RepositoryError> {
        self.docs
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }
}

#[derive(Clone, Default)]
pub struct MemoryDefinitions {
    defs: Arc<Mutex<HashMap<DefinitionRef, Arc<WorkflowDefinition>>>>,
}

impl DefinitionProvider for MemoryDefinitions {
    async fn get(
        &self,
        definition: &DefinitionRef,
    ) -> Result<Arc<WorkflowDefinition>, RepositoryError> {
        self.defs
            .lock()
            .unwrap()
            .get(definition)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn register(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, RepositoryError> {
        let shared = Arc::new(definition);
        self.defs
            .lock()
            .unwrap()
            .insert(shared.definition_ref(), Arc::clone(&shared));
        Ok(shared)
    }
}

/// Parse a workflow whose `document` header is filled in for the caller.
pub fn workflow(body: &str) -> WorkflowDefinition {
    let yaml = format!("document:\n  namespace: test\n  name: wf\n  version: 0.1.0\n{body}");
    crate::workflow::definition::parse_workflow_yaml(&yaml).unwrap()
}
