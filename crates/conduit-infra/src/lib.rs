//! Infrastructure layer for Conduit.
//!
//! Contains implementations of the ports defined in `conduit-core`:
//! in-memory instance, document and definition stores, process runtime
//! hosts, the HTTP function caller, a broadcast event publisher and the
//! engine config loader.

pub mod config;
pub mod memory;
pub mod runtime;
