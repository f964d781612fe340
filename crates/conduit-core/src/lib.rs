//! Task execution interpreter and port traits for Conduit.
//!
//! This crate defines the "ports" (store and capability traits) that the
//! infrastructure layer implements, plus the interpreter that drives task
//! instances through their lifecycle. It depends only on `conduit-types`,
//! never on `conduit-infra` or any IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
