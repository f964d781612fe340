//! Workflow instance repository trait definition.

use conduit_types::error::RepositoryError;
use conduit_types::instance::{WorkflowInstance, WorkflowStatus};
use uuid::Uuid;

/// Durable store for workflow instances with optimistic concurrency.
///
/// Every successful write bumps the stored version. `update` only succeeds
/// when the caller's expected version equals the stored one, otherwise it
/// fails with [`RepositoryError::Conflict`] and nothing is written.
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait InstanceStore: Send + Sync {
    /// Insert a new instance. Returns the stored version.
    fn create(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Get an instance by ID.
    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Replace an instance if its stored version is `expected_version`.
    /// Returns the new version.
    fn update(
        &self,
        instance: &WorkflowInstance,
        expected_version: u64,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// List instances currently in `status`.
    fn list_by_status(
        &self,
        status: WorkflowStatus,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;
}
