//! Engine wiring for the CLI.
//!
//! `EngineState` pins the runner's generic ports to the in-memory infra
//! adapters and registers every capability the binary ships with.

use std::sync::Arc;

use conduit_core::workflow::capability::Capabilities;
use conduit_core::workflow::runner::WorkflowRunner;
use conduit_core::workflow::scheduler::TokioScheduler;
use conduit_infra::memory::{MemoryDefinitionStore, MemoryDocumentStore, MemoryInstanceStore};
use conduit_infra::runtime::http::HTTP_FUNCTION;
use conduit_infra::runtime::{BroadcastPublisher, HttpCaller, ScriptHost, ShellHost};
use conduit_types::config::EngineConfig;
use conduit_types::task::ProcessKind;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Runner pinned to the in-memory stores.
pub type ConcreteRunner =
    WorkflowRunner<MemoryInstanceStore, MemoryDocumentStore, MemoryDefinitionStore>;

pub struct EngineState {
    pub runner: ConcreteRunner,
    pub definitions: MemoryDefinitionStore,
    background: Vec<JoinHandle<()>>,
}

impl EngineState {
    /// Build the runner and start its background loops: real-time timers
    /// and loopback delivery of emitted events to listening instances.
    pub fn init(config: EngineConfig) -> anyhow::Result<Self> {
        let publisher = BroadcastPublisher::new(config.event_bus_capacity);
        let capabilities = Capabilities::new()
            .with_function(HTTP_FUNCTION, HttpCaller::new()?)
            .with_host(ProcessKind::Shell, ShellHost::new())
            .with_host(ProcessKind::Script, ScriptHost::new())
            .with_publisher(publisher.clone());

        let (scheduler, fired) = TokioScheduler::new();
        let definitions = MemoryDefinitionStore::new();
        let runner = WorkflowRunner::new(
            MemoryInstanceStore::new(),
            Arc::new(MemoryDocumentStore::new()),
            definitions.clone(),
            capabilities,
            Arc::new(scheduler),
            config,
        );

        let timers = runner.spawn_timer_loop(fired);
        let loopback = spawn_loopback(runner.clone(), &publisher);
        Ok(Self {
            runner,
            definitions,
            background: vec![timers, loopback],
        })
    }
}

impl Drop for EngineState {
    fn drop(&mut self) {
        for handle in &self.background {
            handle.abort();
        }
    }
}

/// Route events published by `emit` tasks back into the runner.
fn spawn_loopback(runner: ConcreteRunner, publisher: &BroadcastPublisher) -> JoinHandle<()> {
    let mut events = publisher.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let consumed = runner.ingest(event).await;
                    tracing::debug!(consumed, "emitted event delivered locally");
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "loopback fell behind, emitted events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
