//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (conduit-infra) implements. The interpreter never depends on a specific
//! storage technology.

pub mod definition;
pub mod document;
pub mod instance;

pub use definition::DefinitionProvider;
pub use document::DocumentStore;
pub use instance::InstanceStore;
