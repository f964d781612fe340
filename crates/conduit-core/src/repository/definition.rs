//! Workflow definition provider trait definition.

use std::sync::Arc;

use conduit_types::error::RepositoryError;
use conduit_types::task::{DefinitionRef, WorkflowDefinition};

/// Resolves the definition an instance was started from.
pub trait DefinitionProvider: Send + Sync {
    fn get(
        &self,
        definition: &DefinitionRef,
    ) -> impl std::future::Future<Output = Result<Arc<WorkflowDefinition>, RepositoryError>> + Send;

    /// Make a definition resolvable.
    fn register(
        &self,
        definition: WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<Arc<WorkflowDefinition>, RepositoryError>> + Send;
}
