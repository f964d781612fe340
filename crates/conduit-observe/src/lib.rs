//! Observability for Conduit: tracing subscriber setup and span field names.

pub mod attrs;
pub mod tracing_setup;
