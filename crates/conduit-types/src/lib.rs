//! Shared domain types for Conduit.
//!
//! This crate contains the pure data of the workflow engine: the task
//! definition model, the runtime instance model, correlation state, retry
//! policies, engine events and configuration, plus their error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod correlation;
pub mod error;
pub mod event;
pub mod instance;
pub mod reference;
pub mod retry;
pub mod task;
