//! In-memory store adapters backed by `DashMap`.
//!
//! Suitable for a single process: state is lost on exit. The instance store
//! enforces the same optimistic versioning a database-backed store would.

pub mod definition_store;
pub mod document_store;
pub mod instance_store;

pub use definition_store::MemoryDefinitionStore;
pub use document_store::MemoryDocumentStore;
pub use instance_store::MemoryInstanceStore;
