//! In-memory [`DefinitionProvider`] with workflow directory loading.
//!
//! Definitions are immutable once registered and shared as
//! `Arc<WorkflowDefinition>` across every instance started from them.
//! Registering the same `namespace.name:version` again replaces the entry
//! for future starts; running instances keep the `Arc` they already hold.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use conduit_core::repository::DefinitionProvider;
use conduit_core::workflow::definition::discover_workflows;
use conduit_types::error::RepositoryError;
use conduit_types::task::{DefinitionRef, WorkflowDefinition};
use dashmap::DashMap;

#[derive(Debug, Clone, Default)]
pub struct MemoryDefinitionStore {
    definitions: Arc<DashMap<DefinitionRef, Arc<WorkflowDefinition>>>,
}

impl MemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every parseable workflow file under `dir`.
    ///
    /// Unparseable files are skipped (and logged by the discovery walk).
    /// Returns the paths that were registered.
    pub async fn load_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, RepositoryError> {
        let base = dir.to_path_buf();
        let found = tokio::task::spawn_blocking(move || discover_workflows(&base))
            .await
            .map_err(|e| RepositoryError::Storage(format!("definition loader panicked: {e}")))?
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        let mut loaded = Vec::with_capacity(found.len());
        for (path, definition) in found {
            tracing::debug!(path = %path.display(), workflow = %definition.definition_ref(), "loaded workflow file");
            self.insert(definition);
            loaded.push(path);
        }
        tracing::info!(dir = %dir.display(), count = loaded.len(), "workflow definitions loaded");
        Ok(loaded)
    }

    /// Registered references, sorted by their rendered form.
    pub fn list(&self) -> Vec<DefinitionRef> {
        let mut refs: Vec<DefinitionRef> = self.definitions.iter().map(|e| e.key().clone()).collect();
        refs.sort_by_key(|r| r.to_string());
        refs
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    fn insert(&self, definition: WorkflowDefinition) -> Arc<WorkflowDefinition> {
        let shared = Arc::new(definition);
        if self
            .definitions
            .insert(shared.definition_ref(), Arc::clone(&shared))
            .is_some()
        {
            tracing::warn!(workflow = %shared.definition_ref(), "workflow definition replaced");
        }
        shared
    }
}

impl DefinitionProvider for MemoryDefinitionStore {
    async fn get(
        &self,
        definition: &DefinitionRef,
    ) -> Result<Arc<WorkflowDefinition>, RepositoryError> {
        self.definitions
            .get(definition)
            .map(|d| Arc::clone(d.value()))
            .ok_or(RepositoryError::NotFound)
    }

    async fn register(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, RepositoryError> {
        Ok(self.insert(definition))
    }
}
