//! Workflow engine core: definitions, task interpretation and instance driving.
//!
//! - `definition` -- YAML/JSON parsing, validation, filesystem discovery
//! - `expression` -- JEXL evaluator and `${ }` runtime expression helpers
//! - `context` -- scope state and the data object expressions see
//! - `flow` -- flow directive resolution over the task tree
//! - `retry` -- retry decisions, backoff and jitter
//! - `correlation` -- event matching for suspended `listen` tasks
//! - `scheduler` -- engine clock and timer arming (real and virtual)
//! - `capability` -- function, runtime host, publisher and schema ports
//! - `checkpoint` -- versioned instance persistence
//! - `interpreter` -- the per-instance task state machine
//! - `ingress` -- routes inbound events to listening instances
//! - `runner` -- start/resume/cancel entry points with per-instance locking

pub mod capability;
pub mod checkpoint;
pub mod context;
pub mod correlation;
pub mod definition;
pub mod expression;
pub mod flow;
pub mod ingress;
pub mod interpreter;
pub mod retry;
pub mod runner;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;
