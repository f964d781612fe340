//! In-memory implementation of [`DocumentStore`].

use std::sync::Arc;

use conduit_core::repository::DocumentStore;
use conduit_types::error::RepositoryError;
use conduit_types::instance::DocumentRef;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    documents: Arc<DashMap<DocumentRef, Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, payload: &Value) -> Result<DocumentRef, RepositoryError> {
        let reference = DocumentRef(Uuid::now_v7());
        self.documents.insert(reference, payload.clone());
        Ok(reference)
    }

    async fn get(&self, reference: &DocumentRef) -> Result<Value, RepositoryError> {
        self.documents
            .get(reference)
            .map(|doc| doc.value().clone())
            .ok_or(RepositoryError::NotFound)
    }
}
