//! Workflow instance runner.
//!
//! `WorkflowRunner` is the entry point the outside world drives instances
//! through. Each entry point (start, resume, cancel) follows the same cycle
//! under a per-instance async lock:
//!
//! 1. load the instance from its last checkpoint
//! 2. let the [`Interpreter`] drive it as far as it can go
//! 3. checkpoint the result with optimistic versioning
//! 4. execute the returned commands (timers, processes, publication, ingress)
//!
//! A stale checkpoint reloads and recomputes, up to `max_conflict_retries`
//! times. Commands of a discarded attempt are never executed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use conduit_types::config::EngineConfig;
use conduit_types::correlation::CloudEvent;
use conduit_types::error::RepositoryError;
use conduit_types::instance::{DocumentRef, PendingTimer, WorkflowInstance};
use conduit_types::task::{DefinitionRef, WorkflowDefinition};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::{DefinitionProvider, DocumentStore, InstanceStore};

use super::capability::{Capabilities, ProcessRequest};
use super::checkpoint::{CheckpointError, CheckpointManager};
use super::ingress::CorrelationIngress;
use super::interpreter::{Command, EngineError, Interpreter, Trigger};
use super::scheduler::Scheduler;

type BoxedDrive = Pin<Box<dyn Future<Output = Result<WorkflowInstance, EngineError>> + Send>>;

/// What a locked drive applies to the loaded instance.
enum Entry {
    Trigger(Trigger),
    Cancel,
}

impl Entry {
    fn label(&self) -> &'static str {
        match self {
            Entry::Trigger(trigger) => trigger.label(),
            Entry::Cancel => "cancel",
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowRunner
// ---------------------------------------------------------------------------

/// Durable, concurrent driver of workflow instances.
///
/// Generic over its three storage ports so tests can run fully in memory.
/// Cloning is cheap and every clone shares the same state.
pub struct WorkflowRunner<S, D, P>
where
    S: InstanceStore,
    D: DocumentStore,
    P: DefinitionProvider,
{
    inner: Arc<RunnerInner<S, D, P>>,
}

struct RunnerInner<S: InstanceStore, D: DocumentStore, P: DefinitionProvider> {
    checkpoint: CheckpointManager<S>,
    definitions: P,
    interpreter: Interpreter<D>,
    capabilities: Arc<Capabilities>,
    scheduler: Arc<dyn Scheduler>,
    ingress: CorrelationIngress,
    /// Serializes drives of one instance.
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Cancellation handles of launched processes, keyed by task id.
    processes: DashMap<Uuid, CancellationToken>,
    events: EventBus,
    config: EngineConfig,
}

impl<S, D, P> Clone for WorkflowRunner<S, D, P>
where
    S: InstanceStore,
    D: DocumentStore,
    P: DefinitionProvider,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, D, P> WorkflowRunner<S, D, P>
where
    S: InstanceStore + 'static,
    D: DocumentStore + 'static,
    P: DefinitionProvider + 'static,
{
    pub fn new(
        store: S,
        documents: Arc<D>,
        definitions: P,
        capabilities: Capabilities,
        scheduler: Arc<dyn Scheduler>,
        config: EngineConfig,
    ) -> Self {
        let events = EventBus::new(config.event_bus_capacity);
        let capabilities = Arc::new(capabilities);
        let interpreter = Interpreter::new(
            documents,
            Arc::clone(&capabilities),
            Arc::clone(&scheduler),
            events.clone(),
            config.clone(),
        );
        Self {
            inner: Arc::new(RunnerInner {
                checkpoint: CheckpointManager::new(store),
                definitions,
                interpreter,
                capabilities,
                scheduler,
                ingress: CorrelationIngress::new(),
                locks: DashMap::new(),
                processes: DashMap::new(),
                events,
                config,
            }),
        }
    }

    /// Lifecycle events of every instance this runner drives.
    pub fn event_bus(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn ingress(&self) -> &CorrelationIngress {
        &self.inner.ingress
    }

    /// Make a definition available to [`Self::start`].
    pub async fn register(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, EngineError> {
        let reference = definition.definition_ref();
        let shared = self
            .inner
            .definitions
            .register(definition)
            .await
            .map_err(|e| EngineError::DefinitionStore(e.to_string()))?;
        tracing::info!(workflow = %reference, "workflow definition registered");
        Ok(shared)
    }

    /// Create an instance of `definition` and drive it from its first task.
    pub async fn start(
        &self,
        definition: &DefinitionRef,
        input: Value,
    ) -> Result<WorkflowInstance, EngineError> {
        let inner = &self.inner;
        let def = self.definition(definition).await?;
        let mut instance = WorkflowInstance::new(def.definition_ref(), inner.scheduler.now());
        let span = info_span!("workflow.start", instance_id = %instance.id, workflow = %definition);

        async move {
            inner.checkpoint.create(&mut instance).await?;
            let lock = self.lock_for(instance.id);
            let _guard = lock.lock().await;

            let outcome = inner.interpreter.start(&def, &mut instance, input).await?;
            inner.checkpoint.save(&mut instance).await?;
            self.execute(instance.id, outcome.commands);
            if instance.is_terminal() {
                self.finished(instance.id);
            }
            Ok(instance)
        }
        .instrument(span)
        .await
    }

    /// Offer `trigger` to an instance and drive it onwards.
    pub async fn resume(
        &self,
        instance_id: Uuid,
        trigger: Trigger,
    ) -> Result<WorkflowInstance, EngineError> {
        self.drive(instance_id, Entry::Trigger(trigger))
            .await
            .map(|(instance, _)| instance)
    }

    /// Cancel an instance and every task still in progress.
    pub async fn cancel(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.drive(instance_id, Entry::Cancel)
            .await
            .map(|(instance, _)| instance)
    }

    /// Offer an inbound event to every instance with a listening task.
    ///
    /// Returns how many instances consumed it. Failures of individual
    /// instances are logged and do not stop delivery to the others.
    pub async fn ingest(&self, event: CloudEvent) -> usize {
        let candidates = self.inner.ingress.instances();
        tracing::debug!(
            event_id = event.id.as_str(),
            event_type = event.event_type.as_str(),
            candidates = candidates.len(),
            "ingesting event"
        );

        let mut consumed = 0;
        for instance_id in candidates {
            match self
                .drive(instance_id, Entry::Trigger(Trigger::Event(event.clone())))
                .await
            {
                Ok((_, true)) => consumed += 1,
                Ok((_, false)) => {}
                Err(e) => {
                    tracing::warn!(instance_id = %instance_id, error = %e, "event delivery failed");
                }
            }
        }
        consumed
    }

    /// Deliver a fired timer to its instance. Timers of deleted instances
    /// are dropped.
    pub async fn handle_timer(&self, timer: PendingTimer) -> Result<(), EngineError> {
        let instance_id = timer.instance_id;
        match self.resume(instance_id, Trigger::Timer(timer)).await {
            Ok(_) => Ok(()),
            Err(EngineError::Checkpoint(CheckpointError::InstanceNotFound(_))) => {
                tracing::debug!(instance_id = %instance_id, "dropping timer of unknown instance");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Re-arm persisted timers and re-register listening tasks of every
    /// active instance. Call once after a restart. Returns the number of
    /// timers armed.
    pub async fn rearm_timers(&self) -> Result<usize, EngineError> {
        let active = self.inner.checkpoint.list_active().await?;
        let mut armed = 0;
        for instance in &active {
            for timer in &instance.timers {
                self.inner.scheduler.arm(timer.clone());
                armed += 1;
            }
            for correlation in instance.correlations.iter().filter(|c| c.is_active()) {
                self.inner.ingress.register(instance.id, correlation.task_id);
            }
        }
        tracing::info!(instances = active.len(), timers = armed, "re-armed pending timers");
        Ok(armed)
    }

    /// Feed timers fired by a `TokioScheduler` back into the runner.
    pub fn spawn_timer_loop(&self, mut fired: mpsc::UnboundedReceiver<PendingTimer>) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            while let Some(timer) = fired.recv().await {
                let runner = runner.clone();
                tokio::spawn(async move {
                    let timer_id = timer.id;
                    if let Err(e) = runner.handle_timer(timer).await {
                        tracing::warn!(timer_id = %timer_id, error = %e, "timer handling failed");
                    }
                });
            }
            tracing::debug!("timer loop stopped");
        })
    }

    /// Latest checkpoint of an instance.
    pub async fn load(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        Ok(self.inner.checkpoint.load(instance_id).await?)
    }

    /// Fetch a payload referenced by an instance or task.
    pub async fn document(&self, reference: DocumentRef) -> Result<Value, EngineError> {
        self.inner
            .interpreter
            .documents()
            .get(&reference)
            .await
            .map_err(|e| EngineError::Document(e.to_string()))
    }

    // -- internals -----------------------------------------------------------

    async fn definition(
        &self,
        reference: &DefinitionRef,
    ) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.inner
            .definitions
            .get(reference)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => EngineError::DefinitionNotFound(reference.to_string()),
                other => EngineError::DefinitionStore(other.to_string()),
            })
    }

    fn lock_for(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        self.inner.locks.entry(instance_id).or_default().clone()
    }

    fn finished(&self, instance_id: Uuid) {
        self.inner.locks.remove(&instance_id);
        self.inner.ingress.forget_instance(instance_id);
    }

    /// Load, apply and checkpoint under the instance lock. Returns the
    /// instance and whether the entry changed it.
    async fn drive(
        &self,
        instance_id: Uuid,
        entry: Entry,
    ) -> Result<(WorkflowInstance, bool), EngineError> {
        let span = info_span!("workflow.resume", instance_id = %instance_id, entry = entry.label());
        async move {
            let inner = &self.inner;
            let lock = self.lock_for(instance_id);
            let _guard = lock.lock().await;

            let mut attempts = 0;
            loop {
                attempts += 1;
                let mut instance = inner.checkpoint.load(instance_id).await?;
                let def = self.definition(&instance.definition).await?;
                let outcome = match &entry {
                    Entry::Trigger(trigger) => {
                        inner
                            .interpreter
                            .apply(&def, &mut instance, trigger.clone())
                            .await?
                    }
                    Entry::Cancel => inner.interpreter.cancel(&def, &mut instance).await?,
                };
                if !outcome.changed {
                    return Ok((instance, false));
                }

                match inner.checkpoint.save(&mut instance).await {
                    Ok(()) => {
                        self.execute(instance_id, outcome.commands);
                        if instance.is_terminal() {
                            self.finished(instance_id);
                        }
                        return Ok((instance, true));
                    }
                    Err(CheckpointError::Conflict {
                        expected, actual, ..
                    }) if attempts <= inner.config.max_conflict_retries => {
                        tracing::warn!(
                            instance_id = %instance_id,
                            attempt = attempts,
                            expected,
                            actual,
                            "stale checkpoint, reloading instance"
                        );
                    }
                    Err(CheckpointError::Conflict { .. }) => {
                        return Err(EngineError::ConflictRetriesExhausted {
                            instance_id,
                            attempts,
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Boxed [`Self::resume`] for re-entry from tasks spawned by the runner.
    fn resume_boxed(&self, instance_id: Uuid, trigger: Trigger) -> BoxedDrive {
        let runner = self.clone();
        Box::pin(async move { runner.resume(instance_id, trigger).await })
    }

    /// Carry out the side effects of a checkpointed drive.
    fn execute(&self, instance_id: Uuid, commands: Vec<Command>) {
        let inner = &self.inner;
        for command in commands {
            match command {
                Command::ArmTimer(timer) => inner.scheduler.arm(timer),
                Command::CancelTimer(timer_id) => {
                    inner.scheduler.cancel(timer_id);
                }
                Command::Subscribe { task_id } => inner.ingress.register(instance_id, task_id),
                Command::Unsubscribe { task_id } => {
                    inner.ingress.unregister(task_id);
                }
                Command::Publish(event) => {
                    let Some(publisher) = inner.capabilities.publisher() else {
                        tracing::warn!(instance_id = %instance_id, "no publisher for emitted event");
                        continue;
                    };
                    tokio::spawn(async move {
                        let event_id = event.id.clone();
                        if let Err(e) = publisher.publish_boxed(event).await {
                            tracing::warn!(event_id = event_id.as_str(), error = %e, "event publication failed");
                        }
                    });
                }
                Command::LaunchProcess {
                    task_id,
                    run,
                    request,
                    await_completion,
                } => self.launch(instance_id, task_id, run, request, await_completion),
                Command::CancelProcess { task_id } => {
                    if let Some((_, token)) = inner.processes.remove(&task_id) {
                        tracing::debug!(task_id = %task_id, "cancelling process");
                        token.cancel();
                    }
                }
            }
        }
    }

    fn launch(
        &self,
        instance_id: Uuid,
        task_id: Uuid,
        run: u32,
        request: ProcessRequest,
        await_completion: bool,
    ) {
        let kind = request.process.kind();
        let Some(host) = self.inner.capabilities.host(kind) else {
            tracing::warn!(task_id = %task_id, kind = %kind, "no runtime host for process");
            return;
        };
        let token = CancellationToken::new();
        self.inner.processes.insert(task_id, token.clone());
        tracing::debug!(instance_id = %instance_id, task_id = %task_id, kind = %kind, "launching process");

        let runner = self.clone();
        tokio::spawn(async move {
            let result = host.run_boxed(request, token).await;
            runner.inner.processes.remove(&task_id);
            if !await_completion {
                if let Err(e) = result {
                    tracing::warn!(task_id = %task_id, error = %e, "detached process failed");
                }
                return;
            }
            let exited = Trigger::ProcessExited {
                task_id,
                run,
                result,
            };
            if let Err(e) = runner.resume_boxed(instance_id, exited).await {
                tracing::warn!(instance_id = %instance_id, error = %e, "process exit delivery failed");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
