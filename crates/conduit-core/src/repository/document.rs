//! Document store trait definition.

use conduit_types::error::RepositoryError;
use conduit_types::instance::DocumentRef;
use serde_json::Value;

/// Out-of-line storage for task and workflow payloads.
///
/// Documents are immutable once written: every put returns a fresh
/// reference, so an instance snapshot always points at the payloads it was
/// written with.
pub trait DocumentStore: Send + Sync {
    fn put(
        &self,
        payload: &Value,
    ) -> impl std::future::Future<Output = Result<DocumentRef, RepositoryError>> + Send;

    /// Fetch a payload. Fails with `NotFound` for unknown references.
    fn get(
        &self,
        reference: &DocumentRef,
    ) -> impl std::future::Future<Output = Result<Value, RepositoryError>> + Send;
}
