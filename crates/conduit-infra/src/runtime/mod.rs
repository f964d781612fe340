//! Capability adapters the interpreter calls out through.
//!
//! - `process` -- shell and script runtime hosts over `tokio::process`
//! - `http` -- the `http` function for `call` tasks, over `reqwest`
//! - `publisher` -- broadcasts emitted events to in-process subscribers

pub mod http;
pub mod process;
pub mod publisher;

pub use http::HttpCaller;
pub use process::{ScriptHost, ShellHost};
pub use publisher::BroadcastPublisher;
