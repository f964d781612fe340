//! Task execution interpreter.
//!
//! The `Interpreter` advances one [`WorkflowInstance`] until no further
//! progress is possible: either the instance reached a terminal status or
//! every remaining task is suspended on something external.
//!
//! # Execution model
//!
//! A drive is a single-writer loop over an agenda of `Signal`s. Handlers
//! never call each other; they push follow-up signals instead, so nesting
//! depth in the task tree never turns into async recursion.
//!
//! `call` tasks run concurrently in a `JoinSet`, bounded by a semaphore of
//! `max_parallel_effects` permits. Their results are applied back through the
//! agenda, so the task tree is only ever mutated by the drive loop.
//!
//! Side effects that must survive a stale write (timers, process launches,
//! event publication, correlation registration) are returned as
//! [`Command`]s. The runner executes them only after the instance has been
//! checkpointed.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_types::config::EngineConfig;
use conduit_types::correlation::{CloudEvent, CorrelationContext};
use conduit_types::error::{InvalidTransition, TaskError};
use conduit_types::event::EngineEvent;
use conduit_types::instance::{
    DocumentRef, PendingTimer, TaskInstance, TaskStatus, TimerPurpose, WorkflowInstance,
    WorkflowStatus,
};
use conduit_types::reference::{ScopeKind, TaskReference};
use conduit_types::task::{
    CallTask, CatchClause, EmitTask, ErrorMatcher, FlowDirective, ForTask, ForkTask,
    InputTransform, OutputTransform, ProcessSpec, RaiseTask, RunTask, SwitchTask,
    TaskDefinition, TaskKind, TryTask, WorkflowDefinition,
};
use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinSet};
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::DocumentStore;

use super::capability::{CallRequest, Capabilities, ProcessOutput, ProcessRequest};
use super::checkpoint::CheckpointError;
use super::context::{ExpressionData, OutputLink, ScopeState};
use super::correlation::{listen_output, match_event, MatchOutcome};
use super::expression::{
    evaluate_condition, evaluate_expression, evaluate_template, ExpressionError,
};
use super::flow::{resolve_next, FlowTarget};
use super::retry::{RetryDecision, RetryEvaluator};
use super::scheduler::Scheduler;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Something that can wake a suspended instance.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// An inbound event offered to the instance's listen tasks.
    Event(CloudEvent),
    /// A timer armed by the instance came due.
    Timer(PendingTimer),
    /// A process launched for a `run` task finished.
    ProcessExited {
        task_id: Uuid,
        /// Task run the process was launched for.
        run: u32,
        result: Result<ProcessOutput, TaskError>,
    },
}

impl Trigger {
    pub fn label(&self) -> &'static str {
        match self {
            Trigger::Event(_) => "event",
            Trigger::Timer(_) => "timer",
            Trigger::ProcessExited { .. } => "process",
        }
    }
}

/// Side effect requested by a drive, executed after a successful checkpoint.
#[derive(Debug, Clone)]
pub enum Command {
    ArmTimer(PendingTimer),
    CancelTimer(Uuid),
    LaunchProcess {
        task_id: Uuid,
        run: u32,
        request: ProcessRequest,
        /// Report the exit back to the instance.
        await_completion: bool,
    },
    CancelProcess {
        task_id: Uuid,
    },
    Publish(CloudEvent),
    /// Route inbound events to the instance for this listen task.
    Subscribe {
        task_id: Uuid,
    },
    Unsubscribe {
        task_id: Uuid,
    },
}

/// Result of one drive.
#[derive(Debug, Default)]
pub struct DriveOutcome {
    pub commands: Vec<Command>,
    /// False when the trigger did not apply and the instance is untouched.
    pub changed: bool,
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

/// Drives workflow instances through their task trees.
///
/// Generic over `D: DocumentStore`, where task payloads live.
pub struct Interpreter<D: DocumentStore> {
    documents: Arc<D>,
    capabilities: Arc<Capabilities>,
    clock: Arc<dyn Scheduler>,
    events: EventBus,
    config: EngineConfig,
    /// Worker pool for concurrently executing `call` tasks.
    effects: Arc<Semaphore>,
}

impl<D: DocumentStore> Interpreter<D> {
    pub fn new(
        documents: Arc<D>,
        capabilities: Arc<Capabilities>,
        clock: Arc<dyn Scheduler>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        let effects = Arc::new(Semaphore::new(config.max_parallel_effects.max(1)));
        Self {
            documents,
            capabilities,
            clock,
            events,
            config,
            effects,
        }
    }

    pub fn documents(&self) -> &Arc<D> {
        &self.documents
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run a pending instance from its first task.
    pub async fn start(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        input: Value,
    ) -> Result<DriveOutcome, EngineError> {
        if instance.status != WorkflowStatus::Pending {
            return Err(EngineError::InvalidState {
                instance_id: instance.id,
                status: instance.status,
                operation: "start",
            });
        }
        let mut drive = Drive::new(self, definition, instance);
        drive.begin(input).await?;
        drive.run().await
    }

    /// Offer a trigger to a suspended instance and drive it onwards.
    ///
    /// A trigger that matches nothing (unrelated event, stale timer, exit of
    /// a superseded process) leaves the instance untouched.
    pub async fn apply(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        trigger: Trigger,
    ) -> Result<DriveOutcome, EngineError> {
        if instance.is_terminal() {
            tracing::debug!(
                instance_id = %instance.id,
                trigger = trigger.label(),
                "ignoring trigger for finished instance"
            );
            return Ok(DriveOutcome::default());
        }
        let mut drive = Drive::new(self, definition, instance);
        drive.accept(trigger).await?;
        if !drive.changed {
            return Ok(DriveOutcome::default());
        }
        drive.run().await
    }

    /// Cancel the instance and every operative task.
    pub async fn cancel(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
    ) -> Result<DriveOutcome, EngineError> {
        if instance.is_terminal() {
            return Ok(DriveOutcome::default());
        }
        let mut drive = Drive::new(self, definition, instance);
        drive.cancel_workflow()?;
        Ok(drive.finish())
    }
}

// ---------------------------------------------------------------------------
// Drive
// ---------------------------------------------------------------------------

/// Unit of work on the agenda.
enum Signal {
    /// Move a pending task to running and execute it.
    Start { task_id: Uuid, input: Value },
    /// A running task produced its raw output.
    Complete {
        task_id: Uuid,
        output: Value,
        /// Overrides the task's own `then`.
        directive: Option<FlowDirective>,
    },
    Fault { task_id: Uuid, error: TaskError },
    /// Run the next iteration of a `for` task.
    Iterate { for_id: Uuid, output: Option<Value> },
    /// A fork branch reached a terminal status.
    BranchEnd { fork_id: Uuid, branch_id: Uuid },
}

/// Why a task step stopped: a task-level error enters the fault path, an
/// engine error aborts the drive.
enum Failure {
    Task(TaskError),
    Engine(EngineError),
}

impl From<TaskError> for Failure {
    fn from(error: TaskError) -> Self {
        Failure::Task(error)
    }
}

impl From<EngineError> for Failure {
    fn from(error: EngineError) -> Self {
        Failure::Engine(error)
    }
}

impl From<ExpressionError> for Failure {
    fn from(error: ExpressionError) -> Self {
        Failure::Task(expression_error(error))
    }
}

fn expression_error(error: ExpressionError) -> TaskError {
    TaskError::expression("runtime expression failed").with_detail(error.to_string())
}

fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::try_milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
        .unwrap_or(chrono::Duration::MAX)
}

type EffectResult = (Uuid, u32, Result<Value, TaskError>);

/// Signals handled between cooperative yields to the runtime.
const YIELD_INTERVAL: usize = 64;

struct Drive<'a, D: DocumentStore> {
    interp: &'a Interpreter<D>,
    def: &'a WorkflowDefinition,
    instance: &'a mut WorkflowInstance,
    agenda: VecDeque<Signal>,
    effects: JoinSet<EffectResult>,
    in_flight: HashMap<Uuid, AbortHandle>,
    cache: HashMap<DocumentRef, Value>,
    commands: Vec<Command>,
    changed: bool,
    steps: usize,
}

impl<'a, D: DocumentStore> Drive<'a, D> {
    fn new(
        interp: &'a Interpreter<D>,
        def: &'a WorkflowDefinition,
        instance: &'a mut WorkflowInstance,
    ) -> Self {
        Self {
            interp,
            def,
            instance,
            agenda: VecDeque::new(),
            effects: JoinSet::new(),
            in_flight: HashMap::new(),
            cache: HashMap::new(),
            commands: Vec::new(),
            changed: false,
            steps: 0,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.interp.clock.now()
    }

    fn finish(self) -> DriveOutcome {
        DriveOutcome {
            commands: self.commands,
            changed: self.changed,
        }
    }

    /// Process the agenda and in-flight calls until the instance settles.
    async fn run(mut self) -> Result<DriveOutcome, EngineError> {
        loop {
            while let Some(signal) = self.agenda.pop_front() {
                if self.instance.is_terminal() {
                    self.agenda.clear();
                    break;
                }
                if !self.step().await? {
                    break;
                }
                self.handle(signal).await?;
            }
            if self.instance.is_terminal() || self.effects.is_empty() {
                break;
            }
            match self.effects.join_next().await {
                Some(Ok((task_id, run, result))) => self.effect_finished(task_id, run, result),
                Some(Err(e)) if e.is_cancelled() => {}
                Some(Err(e)) => {
                    return Err(EngineError::Internal(format!("call effect failed: {e}")));
                }
                None => break,
            }
        }
        self.effects.abort_all();
        self.settle()?;
        Ok(self.finish())
    }

    /// Count one signal against the drive budget, yielding periodically so
    /// other tasks on the runtime make progress. Returns false once the
    /// budget is spent and the instance has been faulted.
    async fn step(&mut self) -> Result<bool, EngineError> {
        self.steps += 1;
        let budget = self.interp.config.max_drive_steps.max(1);
        if self.steps > budget {
            self.agenda.clear();
            self.fail_workflow(
                TaskError::runtime("workflow exceeded its step budget without suspending")
                    .with_detail(format!("{budget} signals processed in one drive")),
                None,
            )?;
            return Ok(false);
        }
        if self.steps % YIELD_INTERVAL == 0 {
            tokio::task::yield_now().await;
        }
        Ok(true)
    }

    async fn handle(&mut self, signal: Signal) -> Result<(), EngineError> {
        match signal {
            Signal::Start { task_id, input } => self.on_start(task_id, input).await,
            Signal::Complete {
                task_id,
                output,
                directive,
            } => self.on_complete(task_id, output, directive).await,
            Signal::Fault { task_id, error } => self.on_fault(task_id, error).await,
            Signal::Iterate { for_id, output } => self.on_iterate(for_id, output).await,
            Signal::BranchEnd { fork_id, branch_id } => {
                self.on_branch_end(fork_id, branch_id).await
            }
        }
    }

    // -- instance lifecycle -------------------------------------------------

    async fn begin(&mut self, input: Value) -> Result<(), EngineError> {
        let now = self.now();
        self.instance.status = WorkflowStatus::Running;
        self.instance.started_at = Some(now);
        self.instance.begin_run(now);
        self.changed = true;
        tracing::info!(
            instance_id = %self.instance.id,
            workflow = %self.instance.definition,
            "workflow instance started"
        );
        self.interp.events.publish(EngineEvent::InstanceStarted {
            instance_id: self.instance.id,
            workflow: self.instance.definition.to_string(),
        });

        let context = self.put(json!({})).await?;
        self.instance.context = Some(context);

        let input = match &self.def.input {
            Some(transform) => match self.workflow_input(transform, input) {
                Ok(value) => value,
                Err(error) => {
                    self.instance.input = Some(self.put(Value::Null).await?);
                    return self.fail_workflow(error, None);
                }
            },
            None => input,
        };
        self.instance.input = Some(self.put(input.clone()).await?);

        match self.def.tasks.first() {
            Some(first) => {
                let task_id = self.spawn_task(TaskReference::root(0, &first.name), None);
                self.agenda.push_back(Signal::Start { task_id, input });
                Ok(())
            }
            None => self.complete_workflow(input).await,
        }
    }

    fn workflow_input(&self, transform: &InputTransform, input: Value) -> Result<Value, TaskError> {
        let capabilities = &self.interp.capabilities;
        let mut value = input;
        if let Some(from) = &transform.from {
            let data = ExpressionData::new(value.clone()).into_value();
            value = evaluate_template(capabilities.evaluator(), from, &data)
                .map_err(expression_error)?;
        }
        if let Some(schema) = &transform.schema {
            capabilities.validator().validate(&value, schema).map_err(|detail| {
                TaskError::validation("workflow input does not match its schema").with_detail(detail)
            })?;
        }
        Ok(value)
    }

    /// Mark a suspended instance running again. Idempotent within a drive.
    fn wake(&mut self, trigger: &str) {
        self.changed = true;
        if self.instance.status != WorkflowStatus::Suspended {
            return;
        }
        let now = self.now();
        self.instance.status = WorkflowStatus::Running;
        self.instance.status_reason = None;
        self.instance.begin_run(now);
        tracing::debug!(instance_id = %self.instance.id, trigger, "workflow instance resumed");
        self.interp.events.publish(EngineEvent::InstanceResumed {
            instance_id: self.instance.id,
            trigger: trigger.to_string(),
        });
    }

    /// Derive the instance status once the agenda is empty.
    fn settle(&mut self) -> Result<(), EngineError> {
        if self.instance.is_terminal() {
            return Ok(());
        }
        let suspended = self
            .instance
            .tasks
            .iter()
            .any(|t| t.status == TaskStatus::Suspended);
        if suspended {
            if self.instance.status != WorkflowStatus::Suspended {
                let now = self.now();
                self.instance.status = WorkflowStatus::Suspended;
                self.instance.status_reason = Some("waiting on external input".to_string());
                self.instance.end_run(now);
                self.changed = true;
                tracing::info!(instance_id = %self.instance.id, "workflow instance suspended");
                self.interp.events.publish(EngineEvent::InstanceSuspended {
                    instance_id: self.instance.id,
                });
            }
            return Ok(());
        }
        if self.instance.tasks.iter().any(TaskInstance::is_operative) {
            tracing::warn!(instance_id = %self.instance.id, "workflow instance stalled");
            return self.fail_workflow(TaskError::runtime("workflow stalled with no runnable task"), None);
        }
        Ok(())
    }

    async fn complete_workflow(&mut self, output: Value) -> Result<(), EngineError> {
        self.cancel_operative("workflow completed")?;
        let output = match &self.def.output {
            Some(transform) => {
                let (input_ref, context_ref) = (self.instance.input, self.instance.context);
                let input = self.load(input_ref).await?;
                let data = ExpressionData::new(input).context(self.load(context_ref).await?);
                match self.project(transform, output, data) {
                    Ok(value) => value,
                    Err(error) => return self.fail_workflow(error, None),
                }
            }
            None => output,
        };

        let now = self.now();
        self.instance.output = Some(self.put(output).await?);
        self.instance.status = WorkflowStatus::Completed;
        self.instance.status_reason = None;
        self.instance.ended_at = Some(now);
        self.instance.end_run(now);
        self.changed = true;

        let duration_ms = self
            .instance
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        tracing::info!(instance_id = %self.instance.id, duration_ms, "workflow instance completed");
        self.interp.events.publish(EngineEvent::InstanceCompleted {
            instance_id: self.instance.id,
            duration_ms,
        });
        Ok(())
    }

    fn fail_workflow(
        &mut self,
        error: TaskError,
        task: Option<TaskReference>,
    ) -> Result<(), EngineError> {
        self.cancel_operative("workflow faulted")?;
        let now = self.now();
        tracing::warn!(
            instance_id = %self.instance.id,
            task = task.as_ref().map(TaskReference::as_str),
            error = %error,
            "workflow instance faulted"
        );
        self.interp.events.publish(EngineEvent::InstanceFaulted {
            instance_id: self.instance.id,
            error: error.to_string(),
            task: task.as_ref().map(ToString::to_string),
        });
        self.instance.status = WorkflowStatus::Faulted;
        self.instance.status_reason = Some(error.summary());
        self.instance.error = Some(error);
        self.instance.faulted_task = task;
        self.instance.ended_at = Some(now);
        self.instance.end_run(now);
        self.changed = true;
        Ok(())
    }

    fn cancel_workflow(&mut self) -> Result<(), EngineError> {
        self.cancel_operative("workflow cancelled")?;
        let now = self.now();
        self.instance.status = WorkflowStatus::Cancelled;
        self.instance.status_reason = Some("cancelled".to_string());
        self.instance.ended_at = Some(now);
        self.instance.end_run(now);
        self.changed = true;
        tracing::info!(instance_id = %self.instance.id, "workflow instance cancelled");
        self.interp.events.publish(EngineEvent::InstanceCancelled {
            instance_id: self.instance.id,
        });
        Ok(())
    }

    // -- trigger intake ------------------------------------------------------

    async fn accept(&mut self, trigger: Trigger) -> Result<(), EngineError> {
        match trigger {
            Trigger::Event(event) => self.offer_event(&event),
            Trigger::Timer(timer) => self.timer_fired(timer).await,
            Trigger::ProcessExited {
                task_id,
                run,
                result,
            } => self.process_exited(task_id, run, result),
        }
    }

    fn offer_event(&mut self, event: &CloudEvent) -> Result<(), EngineError> {
        let interp = self.interp;
        let evaluator = interp.capabilities.evaluator();
        let candidates: Vec<(usize, Uuid)> = self
            .instance
            .correlations
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_active())
            .map(|(index, c)| (index, c.task_id))
            .collect();

        for (index, task_id) in candidates {
            let Some(task) = self.instance.task(task_id) else {
                continue;
            };
            if task.status != TaskStatus::Suspended {
                continue;
            }
            let reference = task.reference.clone();
            let TaskKind::Listen(listen) = &self.task_def(&reference)?.kind else {
                continue;
            };

            let outcome = match_event(&self.instance.correlations[index], event, listen, evaluator);
            let MatchOutcome::Matched { context, satisfied } = outcome else {
                continue;
            };
            self.wake("event");
            tracing::debug!(
                instance_id = %self.instance.id,
                task = reference.as_str(),
                event_id = event.id.as_str(),
                satisfied,
                "event correlated"
            );
            let output = satisfied.then(|| listen_output(&context, listen));
            self.instance.correlations[index] = context;
            if let Some(output) = output {
                self.set_status(task_id, TaskStatus::Running, None)?;
                self.agenda.push_back(Signal::Complete {
                    task_id,
                    output,
                    directive: None,
                });
            }
        }
        Ok(())
    }

    async fn timer_fired(&mut self, timer: PendingTimer) -> Result<(), EngineError> {
        let Some(position) = self.instance.timers.iter().position(|t| t.id == timer.id) else {
            tracing::debug!(timer_id = %timer.id, "ignoring stale timer");
            return Ok(());
        };
        self.instance.timers.remove(position);
        self.changed = true;

        let task_id = timer.task_id;
        let Some(task) = self.instance.task(task_id) else {
            return Ok(());
        };
        if task.status != TaskStatus::Suspended {
            return Ok(());
        }
        let input_ref = task.input;
        self.wake("timer");
        tracing::debug!(
            instance_id = %self.instance.id,
            task_id = %task_id,
            purpose = %timer.purpose,
            "timer fired"
        );

        match timer.purpose {
            TimerPurpose::WaitElapsed => {
                self.set_status(task_id, TaskStatus::Running, None)?;
                let output = self.load(input_ref).await?;
                self.agenda.push_back(Signal::Complete {
                    task_id,
                    output,
                    directive: None,
                });
            }
            TimerPurpose::ListenTimeout => {
                self.agenda.push_back(Signal::Fault {
                    task_id,
                    error: TaskError::timeout("listen timed out before a matching event arrived"),
                });
            }
            TimerPurpose::RunTimeout => {
                self.agenda.push_back(Signal::Fault {
                    task_id,
                    error: TaskError::timeout("process did not exit before the task timeout"),
                });
            }
            TimerPurpose::RetryDelay => {
                self.set_status(task_id, TaskStatus::Running, None)?;
                let input = self.load(input_ref).await?;
                self.restart_try(task_id, input)?;
            }
        }
        Ok(())
    }

    fn process_exited(
        &mut self,
        task_id: Uuid,
        run: u32,
        result: Result<ProcessOutput, TaskError>,
    ) -> Result<(), EngineError> {
        let Some(task) = self.instance.task(task_id) else {
            return Ok(());
        };
        if task.status != TaskStatus::Suspended || task.current_run() != run {
            tracing::debug!(task_id = %task_id, run, "ignoring exit of superseded process");
            return Ok(());
        }
        let reference = task.reference.clone();
        let TaskKind::Run(spec) = &self.task_def(&reference)?.kind else {
            return Ok(());
        };

        self.wake("process");
        self.set_status(task_id, TaskStatus::Running, None)?;
        let signal = match result {
            Ok(output) if output.succeeded() => Signal::Complete {
                task_id,
                output: output.project(spec.returns),
                directive: None,
            },
            Ok(output) => Signal::Fault {
                task_id,
                error: TaskError::runtime(format!("process exited with code {}", output.exit_code))
                    .with_detail(output.stderr.trim_end()),
            },
            Err(error) => Signal::Fault { task_id, error },
        };
        self.agenda.push_back(signal);
        Ok(())
    }

    fn effect_finished(&mut self, task_id: Uuid, run: u32, result: Result<Value, TaskError>) {
        self.in_flight.remove(&task_id);
        let current = self
            .instance
            .task(task_id)
            .is_some_and(|t| t.status == TaskStatus::Running && t.current_run() == run);
        if !current {
            tracing::debug!(task_id = %task_id, "discarding result of superseded call");
            return;
        }
        let signal = match result {
            Ok(output) => Signal::Complete {
                task_id,
                output,
                directive: None,
            },
            Err(error) => Signal::Fault { task_id, error },
        };
        self.agenda.push_back(signal);
    }

    // -- signal handlers -----------------------------------------------------

    async fn on_start(&mut self, task_id: Uuid, input: Value) -> Result<(), EngineError> {
        let task = self.task(task_id)?;
        if task.status != TaskStatus::Pending {
            return Ok(());
        }
        let reference = task.reference.clone();
        let definition = self.task_def(&reference)?;
        self.set_status(task_id, TaskStatus::Running, None)?;

        match self.enter(task_id, &reference, definition, input).await {
            Ok(()) => Ok(()),
            Err(Failure::Task(error)) => {
                self.fail(task_id, error);
                Ok(())
            }
            Err(Failure::Engine(e)) => Err(e),
        }
    }

    /// Input transform, `if` guard, then kind dispatch.
    async fn enter(
        &mut self,
        task_id: Uuid,
        reference: &TaskReference,
        task: &'a TaskDefinition,
        input: Value,
    ) -> Result<(), Failure> {
        let interp = self.interp;
        let input = match &task.input {
            Some(transform) => self.transform_input(task_id, transform, input).await?,
            None => input,
        };
        let input_ref = self.put(input.clone()).await?;
        self.task_mut(task_id)?.input = Some(input_ref);

        if let Some(condition) = &task.condition {
            let data = self.data(task_id, &input).await?.into_value();
            if !evaluate_condition(interp.capabilities.evaluator(), condition, &data)? {
                return Ok(self.skip(task_id, input).await?);
            }
        }

        tracing::debug!(
            instance_id = %self.instance.id,
            task = reference.as_str(),
            kind = task.kind.name(),
            "executing task"
        );

        match &task.kind {
            TaskKind::Do(spec) => {
                self.start_child(task_id, reference, ScopeKind::Do, &spec.tasks, input)
            }
            TaskKind::Try(spec) => {
                self.start_child(task_id, reference, ScopeKind::Try, &spec.tasks, input)
            }
            TaskKind::For(spec) => self.start_loop(task_id, spec, input).await,
            TaskKind::Fork(spec) => {
                self.start_fork(task_id, reference, spec, input);
                Ok(())
            }
            TaskKind::Switch(spec) => self.run_switch(task_id, spec, input).await,
            TaskKind::Set(spec) => {
                let data = self.data(task_id, &input).await?.into_value();
                let output = evaluate_template(
                    interp.capabilities.evaluator(),
                    &Value::Object(spec.set.clone()),
                    &data,
                )?;
                self.complete_now(task_id, output);
                Ok(())
            }
            TaskKind::Raise(spec) => self.run_raise(task_id, spec, &input).await,
            TaskKind::Emit(spec) => self.run_emit(task_id, spec, input).await,
            TaskKind::Call(spec) => self.run_call(task_id, reference, task, spec, &input).await,
            TaskKind::Run(spec) => self.run_process(task_id, reference, task, spec, input).await,
            TaskKind::Listen(_) => {
                self.instance.correlations.push(CorrelationContext::new(task_id));
                self.commands.push(Command::Subscribe { task_id });
                self.set_status(task_id, TaskStatus::Suspended, Some("awaiting event".into()))?;
                if let Some(secs) = task.timeout_secs {
                    self.arm(task_id, TimerPurpose::ListenTimeout, millis(secs.saturating_mul(1000)));
                }
                Ok(())
            }
            TaskKind::Wait(spec) => {
                self.arm(task_id, TimerPurpose::WaitElapsed, millis(spec.duration_ms));
                self.set_status(task_id, TaskStatus::Suspended, Some("waiting".into()))?;
                Ok(())
            }
        }
    }

    async fn on_complete(
        &mut self,
        task_id: Uuid,
        output: Value,
        directive: Option<FlowDirective>,
    ) -> Result<(), EngineError> {
        if self.task(task_id)?.status != TaskStatus::Running {
            return Ok(());
        }
        match self.finalize(task_id, output, directive).await {
            Ok(output) => self.advance(task_id, output).await,
            Err(Failure::Task(error)) => {
                self.fail(task_id, error);
                Ok(())
            }
            Err(Failure::Engine(e)) => Err(e),
        }
    }

    async fn on_fault(&mut self, task_id: Uuid, error: TaskError) -> Result<(), EngineError> {
        let task = self.task(task_id)?;
        let status = task.status;
        if !status.is_operative() {
            return Ok(());
        }
        let reference = task.reference.clone();
        let parent_id = task.parent_id;
        let error = error.with_instance(reference.as_str());

        tracing::debug!(
            instance_id = %self.instance.id,
            task = reference.as_str(),
            error = %error,
            "task faulted"
        );

        self.cancel_descendants(task_id)?;
        self.release(task_id, status);
        if status == TaskStatus::Pending {
            self.set_status(task_id, TaskStatus::Running, None)?;
        }
        self.task_mut(task_id)?.error = Some(error.clone());
        self.set_status(task_id, TaskStatus::Faulted, Some(error.summary()))?;

        let Some(parent_id) = parent_id else {
            // The innermost faulted task stamped its reference first.
            let origin = error
                .instance
                .as_deref()
                .and_then(|raw| TaskReference::parse(raw).ok())
                .filter(|origin| origin.is_within(&reference))
                .unwrap_or(reference);
            return self.fail_workflow(error, Some(origin));
        };
        let parent_ref = self.task(parent_id)?.reference.clone();
        if reference.position().0 == ScopeKind::Try {
            if let TaskKind::Try(spec) = &self.task_def(&parent_ref)?.kind {
                return self.catch(parent_id, spec, error).await;
            }
        }
        self.agenda.push_front(Signal::Fault {
            task_id: parent_id,
            error,
        });
        Ok(())
    }

    async fn on_iterate(&mut self, for_id: Uuid, output: Option<Value>) -> Result<(), EngineError> {
        let task = self.task(for_id)?;
        if task.status != TaskStatus::Running {
            return Ok(());
        }
        let reference = task.reference.clone();
        let (input_ref, context_ref) = (task.input, task.context);
        let TaskKind::For(spec) = &self.task_def(&reference)?.kind else {
            return Err(EngineError::Internal(format!("'{reference}' is not a for task")));
        };

        let mut state = self.load_scope(context_ref).await?;
        if let Some(output) = output {
            state.last_output = Some(self.push_output(state.last_output, output).await?);
            state.position += 1;
        }

        if state.position >= state.count {
            self.save_scope(for_id, &state).await?;
            let outputs = self.collect_outputs(state.last_output).await?;
            self.complete_now(for_id, Value::Array(outputs));
            return Ok(());
        }
        let limit = self.interp.config.max_for_iterations;
        if state.position >= limit {
            self.fail(
                for_id,
                TaskError::runtime(format!("for loop exceeded {limit} iterations")),
            );
            return Ok(());
        }

        let item = self.item_at(state.items, state.position).await?;
        state.vars.insert(spec.each.clone(), item);
        state.vars.insert(spec.at.clone(), json!(state.position));
        self.save_scope(for_id, &state).await?;

        let input = self.load(input_ref).await?;
        if let Some(condition) = &spec.condition {
            let data = self.data(for_id, &input).await?.into_value();
            match evaluate_condition(self.interp.capabilities.evaluator(), condition, &data) {
                Ok(true) => {}
                Ok(false) => {
                    let outputs = self.collect_outputs(state.last_output).await?;
                    self.complete_now(for_id, Value::Array(outputs));
                    return Ok(());
                }
                Err(e) => {
                    self.fail(for_id, expression_error(e));
                    return Ok(());
                }
            }
        }

        tracing::debug!(
            instance_id = %self.instance.id,
            task = reference.as_str(),
            iteration = state.position,
            "starting loop iteration"
        );
        match spec.tasks.first() {
            Some(first) => {
                let child = self.spawn_task(reference.child(ScopeKind::Do, 0, &first.name), Some(for_id));
                self.agenda.push_back(Signal::Start {
                    task_id: child,
                    input,
                });
            }
            None => self.agenda.push_front(Signal::Iterate {
                for_id,
                output: Some(input),
            }),
        }
        Ok(())
    }

    async fn on_branch_end(&mut self, fork_id: Uuid, branch_id: Uuid) -> Result<(), EngineError> {
        let fork = self.task(fork_id)?;
        if fork.status != TaskStatus::Running {
            return Ok(());
        }
        let reference = fork.reference.clone();
        let TaskKind::Fork(spec) = &self.task_def(&reference)?.kind else {
            return Err(EngineError::Internal(format!("'{reference}' is not a fork task")));
        };

        if spec.compete {
            let winner = self.task(branch_id)?;
            let (winner_ref, output_ref) = (winner.reference.clone(), winner.output);
            let output = self.load(output_ref).await?;
            tracing::debug!(
                instance_id = %self.instance.id,
                task = reference.as_str(),
                winner = winner_ref.as_str(),
                "fork competition decided"
            );
            self.cancel_descendants(fork_id)?;
            self.complete_now(fork_id, output);
            return Ok(());
        }

        let mut branches: Vec<(usize, TaskStatus, Option<DocumentRef>)> = self
            .instance
            .children(fork_id)
            .map(|t| (t.reference.position().1, t.status, t.output))
            .collect();
        if branches.iter().any(|(_, status, _)| status.is_operative()) {
            return Ok(());
        }
        branches.sort_by_key(|(index, _, _)| *index);
        let mut outputs = Vec::with_capacity(branches.len());
        for (_, _, output) in branches {
            outputs.push(self.load(output).await?);
        }
        self.complete_now(fork_id, Value::Array(outputs));
        Ok(())
    }

    // -- kind execution ------------------------------------------------------

    fn start_child(
        &mut self,
        parent_id: Uuid,
        parent: &TaskReference,
        scope: ScopeKind,
        tasks: &[TaskDefinition],
        input: Value,
    ) -> Result<(), Failure> {
        match tasks.first() {
            Some(first) => {
                let child = self.spawn_task(parent.child(scope, 0, &first.name), Some(parent_id));
                self.agenda.push_back(Signal::Start {
                    task_id: child,
                    input,
                });
            }
            None => self.complete_now(parent_id, input),
        }
        Ok(())
    }

    async fn start_loop(&mut self, for_id: Uuid, spec: &ForTask, input: Value) -> Result<(), Failure> {
        let data = self.data(for_id, &input).await?.into_value();
        let items = match evaluate_expression(self.interp.capabilities.evaluator(), &spec.source, &data)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(TaskError::validation("for.in must evaluate to an array")
                    .with_detail(format!("got {other}"))
                    .into());
            }
        };
        let count = items.len();
        let state = ScopeState {
            items: Some(self.put(Value::Array(items)).await?),
            count,
            ..ScopeState::default()
        };
        self.save_scope(for_id, &state).await?;
        self.agenda.push_front(Signal::Iterate {
            for_id,
            output: None,
        });
        Ok(())
    }

    fn start_fork(&mut self, fork_id: Uuid, reference: &TaskReference, spec: &ForkTask, input: Value) {
        // Every branch exists before any runs, so an early failure can cancel
        // branches that have not started yet.
        let branches: Vec<Uuid> = spec
            .branches
            .iter()
            .enumerate()
            .map(|(index, branch)| {
                self.spawn_task(reference.child(ScopeKind::Branches, index, &branch.name), Some(fork_id))
            })
            .collect();
        if branches.is_empty() {
            self.complete_now(fork_id, Value::Array(Vec::new()));
            return;
        }
        for task_id in branches {
            self.agenda.push_back(Signal::Start {
                task_id,
                input: input.clone(),
            });
        }
    }

    async fn run_switch(&mut self, task_id: Uuid, spec: &SwitchTask, input: Value) -> Result<(), Failure> {
        let interp = self.interp;
        let data = self.data(task_id, &input).await?.into_value();
        let mut chosen = None;
        for case in &spec.cases {
            if let Some(when) = &case.when {
                if evaluate_condition(interp.capabilities.evaluator(), when, &data)? {
                    chosen = Some(case);
                    break;
                }
            }
        }
        let chosen = chosen.or_else(|| spec.cases.iter().find(|c| c.when.is_none()));
        tracing::debug!(
            instance_id = %self.instance.id,
            task_id = %task_id,
            case = chosen.map(|c| c.name.as_str()),
            "switch evaluated"
        );
        let directive = chosen.map(|c| c.then.clone());
        self.agenda.push_front(Signal::Complete {
            task_id,
            output: input,
            directive,
        });
        Ok(())
    }

    async fn run_raise(&mut self, task_id: Uuid, spec: &RaiseTask, input: &Value) -> Result<(), Failure> {
        let template = serde_json::to_value(&spec.error)
            .map_err(|e| EngineError::Internal(format!("error template: {e}")))?;
        let data = self.data(task_id, input).await?.into_value();
        let value = evaluate_template(self.interp.capabilities.evaluator(), &template, &data)?;
        let error: TaskError = serde_json::from_value(value).map_err(|e| {
            TaskError::validation("raised error is not a valid error").with_detail(e.to_string())
        })?;
        Err(error.into())
    }

    async fn run_emit(&mut self, task_id: Uuid, spec: &EmitTask, input: Value) -> Result<(), Failure> {
        if self.interp.capabilities.publisher().is_none() {
            return Err(TaskError::configuration("no event publisher is configured").into());
        }
        let data = self.data(task_id, &input).await?.into_value();
        let value = evaluate_template(
            self.interp.capabilities.evaluator(),
            &Value::Object(spec.event.clone()),
            &data,
        )?;
        let mut event: CloudEvent = serde_json::from_value(value).map_err(|e| {
            TaskError::validation("emitted event is not a valid cloud event").with_detail(e.to_string())
        })?;
        if event.time.is_none() {
            event.time = Some(self.now());
        }
        tracing::debug!(
            instance_id = %self.instance.id,
            event_type = event.event_type.as_str(),
            "event emitted"
        );
        self.commands.push(Command::Publish(event));
        self.complete_now(task_id, input);
        Ok(())
    }

    async fn run_call(
        &mut self,
        task_id: Uuid,
        reference: &TaskReference,
        task: &TaskDefinition,
        spec: &CallTask,
        input: &Value,
    ) -> Result<(), Failure> {
        let caller = self.interp.capabilities.function(&spec.function).ok_or_else(|| {
            TaskError::configuration(format!("unknown function '{}'", spec.function))
        })?;
        let data = self.data(task_id, input).await?.into_value();
        let arguments = match evaluate_template(
            self.interp.capabilities.evaluator(),
            &Value::Object(spec.with.clone()),
            &data,
        )? {
            Value::Object(arguments) => arguments,
            _ => Map::new(),
        };

        let request = CallRequest {
            instance_id: self.instance.id,
            task_id,
            reference: reference.clone(),
            function: spec.function.clone(),
            arguments,
        };
        let run = self.task(task_id)?.current_run();
        let timeout = Duration::from_secs(
            task.timeout_secs
                .unwrap_or(self.interp.config.default_call_timeout_secs),
        );
        let permits = Arc::clone(&self.interp.effects);
        let function = spec.function.clone();

        let handle = self.effects.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return (task_id, run, Err(TaskError::runtime("call worker pool is closed")));
            };
            let call = AssertUnwindSafe(caller.call_boxed(request)).catch_unwind();
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(TaskError::runtime(format!("function '{function}' panicked"))),
                Err(_) => Err(TaskError::timeout(format!(
                    "function '{function}' did not answer within {}s",
                    timeout.as_secs()
                ))),
            };
            (task_id, run, result)
        });
        self.in_flight.insert(task_id, handle);
        Ok(())
    }

    async fn run_process(
        &mut self,
        task_id: Uuid,
        reference: &TaskReference,
        task: &TaskDefinition,
        spec: &RunTask,
        input: Value,
    ) -> Result<(), Failure> {
        let kind = spec.process.kind();
        if self.interp.capabilities.host(kind).is_none() {
            return Err(TaskError::configuration(format!(
                "no runtime host registered for {kind} processes"
            ))
            .into());
        }
        let template = serde_json::to_value(&spec.process)
            .map_err(|e| EngineError::Internal(format!("process template: {e}")))?;
        let data = self.data(task_id, &input).await?.into_value();
        let value = evaluate_template(self.interp.capabilities.evaluator(), &template, &data)?;
        let process: ProcessSpec = serde_json::from_value(value).map_err(|e| {
            TaskError::validation("process definition is invalid after evaluation")
                .with_detail(e.to_string())
        })?;

        let run = self.task(task_id)?.current_run();
        self.commands.push(Command::LaunchProcess {
            task_id,
            run,
            request: ProcessRequest {
                instance_id: self.instance.id,
                task_id,
                reference: reference.clone(),
                process,
            },
            await_completion: spec.await_completion,
        });

        if spec.await_completion {
            self.set_status(task_id, TaskStatus::Suspended, Some("awaiting process exit".into()))?;
            if let Some(secs) = task.timeout_secs {
                self.arm(task_id, TimerPurpose::RunTimeout, millis(secs.saturating_mul(1000)));
            }
        } else {
            self.complete_now(task_id, input);
        }
        Ok(())
    }

    // -- error handling ------------------------------------------------------

    /// A child of the try body faulted: match the catch clause, then retry,
    /// recover or re-raise.
    async fn catch(&mut self, try_id: Uuid, spec: &'a TryTask, error: TaskError) -> Result<(), EngineError> {
        let interp = self.interp;
        let catch = &spec.catch;
        let input_ref = self.task(try_id)?.input;
        let input = self.load(input_ref).await?;

        if !self.catch_matches(try_id, catch, &error, &input).await? {
            self.agenda.push_front(Signal::Fault {
                task_id: try_id,
                error,
            });
            return Ok(());
        }

        if let Some(policy_ref) = &catch.retry {
            let def = self.def;
            let Some(policy) = def.retry_policy(policy_ref) else {
                self.fail(
                    try_id,
                    TaskError::configuration(format!("unknown retry policy {policy_ref:?}")),
                );
                return Ok(());
            };
            let now = self.now();
            let decision = RetryEvaluator::should_retry(
                policy,
                &error,
                &self.task(try_id)?.retries,
                now,
                interp.capabilities.evaluator(),
            );
            match decision {
                RetryDecision::Retry { attempt, delay } => {
                    let try_task = self.task_mut(try_id)?;
                    RetryEvaluator::record(&mut try_task.retries, &error, now);
                    try_task.begin_run(now);
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    tracing::info!(
                        instance_id = %self.instance.id,
                        task_id = %try_id,
                        attempt,
                        delay_ms,
                        error = %error,
                        "retrying task body"
                    );
                    interp.events.publish(EngineEvent::RetryScheduled {
                        instance_id: self.instance.id,
                        task_id: try_id,
                        attempt,
                        delay_ms,
                    });
                    if delay.is_zero() {
                        self.restart_try(try_id, input)?;
                    } else {
                        self.set_status(
                            try_id,
                            TaskStatus::Suspended,
                            Some(format!("retry {attempt} scheduled")),
                        )?;
                        self.arm(try_id, TimerPurpose::RetryDelay, millis(delay_ms));
                    }
                    return Ok(());
                }
                RetryDecision::GiveUp(reason) => {
                    tracing::debug!(task_id = %try_id, ?reason, "not retrying");
                    if catch.tasks.is_none() {
                        self.agenda.push_front(Signal::Fault {
                            task_id: try_id,
                            error,
                        });
                        return Ok(());
                    }
                }
            }
        }

        match catch.tasks.as_deref() {
            Some([first, ..]) => {
                let binding = serde_json::to_value(&error)
                    .map_err(|e| EngineError::Internal(format!("caught error: {e}")))?;
                let context = self.task(try_id)?.context;
                let mut state = self.load_scope(context).await?;
                state.vars.insert(catch.binding().to_string(), binding);
                self.save_scope(try_id, &state).await?;

                let reference = self.task(try_id)?.reference.clone();
                let child = self.spawn_task(reference.child(ScopeKind::Catch, 0, &first.name), Some(try_id));
                self.agenda.push_back(Signal::Start {
                    task_id: child,
                    input,
                });
            }
            _ => {
                tracing::debug!(task_id = %try_id, error = %error, "caught error swallowed");
                self.complete_now(try_id, input);
            }
        }
        Ok(())
    }

    async fn catch_matches(
        &mut self,
        try_id: Uuid,
        catch: &CatchClause,
        error: &TaskError,
        input: &Value,
    ) -> Result<bool, EngineError> {
        if let Some(filter) = &catch.errors {
            if !error_matches(&filter.with, error) {
                return Ok(false);
            }
        }
        if catch.when.is_none() && catch.except_when.is_none() {
            return Ok(true);
        }

        let error_value = serde_json::to_value(error)
            .map_err(|e| EngineError::Internal(format!("caught error: {e}")))?;
        let data = self
            .data(try_id, input)
            .await?
            .var(catch.binding(), error_value)
            .into_value();
        let evaluator = self.interp.capabilities.evaluator();
        let guard = |expression: &str| {
            evaluate_condition(evaluator, expression, &data).unwrap_or_else(|e| {
                tracing::warn!(task_id = %try_id, error = %e, "catch guard failed");
                false
            })
        };
        if let Some(when) = &catch.when {
            if !guard(when) {
                return Ok(false);
            }
        }
        if let Some(except_when) = &catch.except_when {
            if guard(except_when) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Start the try body again as a new run.
    fn restart_try(&mut self, try_id: Uuid, input: Value) -> Result<(), EngineError> {
        let reference = self.task(try_id)?.reference.clone();
        let TaskKind::Try(spec) = &self.task_def(&reference)?.kind else {
            return Err(EngineError::Internal(format!("'{reference}' is not a try task")));
        };
        match spec.tasks.first() {
            Some(first) => {
                let child = self.spawn_task(reference.child(ScopeKind::Try, 0, &first.name), Some(try_id));
                self.agenda.push_back(Signal::Start {
                    task_id: child,
                    input,
                });
            }
            None => self.complete_now(try_id, input),
        }
        Ok(())
    }

    // -- completion and flow -------------------------------------------------

    fn complete_now(&mut self, task_id: Uuid, output: Value) {
        self.agenda.push_front(Signal::Complete {
            task_id,
            output,
            directive: None,
        });
    }

    fn fail(&mut self, task_id: Uuid, error: TaskError) {
        self.agenda.push_front(Signal::Fault { task_id, error });
    }

    async fn skip(&mut self, task_id: Uuid, input: Value) -> Result<(), EngineError> {
        let output = self.put(input.clone()).await?;
        let task = self.task_mut(task_id)?;
        task.output = Some(output);
        task.next = Some(FlowDirective::Continue);
        self.set_status(task_id, TaskStatus::Skipped, Some("condition not met".into()))?;
        self.advance(task_id, input).await
    }

    /// Apply output and export transforms and mark the task completed.
    async fn finalize(
        &mut self,
        task_id: Uuid,
        raw: Value,
        directive: Option<FlowDirective>,
    ) -> Result<Value, Failure> {
        let (reference, input_ref) = {
            let task = self.task(task_id)?;
            (task.reference.clone(), task.input)
        };
        let task = self.task_def(&reference)?;
        let input = self.load(input_ref).await?;

        let output = match &task.output {
            Some(transform) => {
                let data = self.data(task_id, &input).await?;
                self.project(transform, raw, data)?
            }
            None => raw,
        };
        if let Some(export) = &task.export {
            let data = self.data(task_id, &input).await?;
            let context = self.project(export, output.clone(), data)?;
            self.instance.context = Some(self.put(context).await?);
        }

        let output_ref = self.put(output.clone()).await?;
        let record = self.task_mut(task_id)?;
        record.output = Some(output_ref);
        record.next = Some(directive.unwrap_or_else(|| task.directive()));
        self.release(task_id, TaskStatus::Running);
        self.set_status(task_id, TaskStatus::Completed, None)?;
        Ok(output)
    }

    /// Evaluate an `as` projection against `output`, then check its schema.
    fn project(
        &self,
        transform: &OutputTransform,
        output: Value,
        data: ExpressionData,
    ) -> Result<Value, TaskError> {
        let capabilities = &self.interp.capabilities;
        let value = match &transform.projection {
            Some(projection) => {
                let data = data.output(output).into_value();
                evaluate_template(capabilities.evaluator(), projection, &data)
                    .map_err(expression_error)?
            }
            None => output,
        };
        if let Some(schema) = &transform.schema {
            capabilities.validator().validate(&value, schema).map_err(|detail| {
                TaskError::validation("output does not match its schema").with_detail(detail)
            })?;
        }
        Ok(value)
    }

    /// Resolve where control goes after `task_id` finished and get it there.
    async fn advance(&mut self, task_id: Uuid, mut output: Value) -> Result<(), EngineError> {
        let (reference, directive) = {
            let task = self.task(task_id)?;
            (task.reference.clone(), task.next.clone().unwrap_or_default())
        };
        let resolution = match resolve_next(self.def, &reference, &directive) {
            Ok(resolution) => resolution,
            Err(e) => {
                let error = TaskError::configuration("flow directive cannot be resolved")
                    .with_detail(e.to_string())
                    .with_instance(reference.as_str());
                return self.fail_workflow(error, Some(reference));
            }
        };
        tracing::debug!(
            instance_id = %self.instance.id,
            task = reference.as_str(),
            directive = %directive,
            target = ?resolution.target,
            "flow resolved"
        );

        let mut cursor = task_id;
        for owner in &resolution.exited {
            let owner_id = self.ancestor(cursor, owner)?;
            let raw = match self.task_def(owner)?.kind {
                TaskKind::For(_) => self.break_loop(owner_id, output).await?,
                _ => output,
            };
            match self.finalize(owner_id, raw, None).await {
                Ok(value) => output = value,
                Err(Failure::Task(error)) => {
                    self.fail(owner_id, error);
                    return Ok(());
                }
                Err(Failure::Engine(e)) => return Err(e),
            }
            cursor = owner_id;
        }

        match resolution.target {
            FlowTarget::Task(next) => {
                let parent_id = match next.owner() {
                    Some(owner) => Some(self.ancestor(cursor, &owner)?),
                    None => None,
                };
                let next_id = self.spawn_task(next, parent_id);
                self.agenda.push_back(Signal::Start {
                    task_id: next_id,
                    input: output,
                });
            }
            FlowTarget::IterationEnd(owner) => {
                let for_id = self.ancestor(cursor, &owner)?;
                self.agenda.push_front(Signal::Iterate {
                    for_id,
                    output: Some(output),
                });
            }
            FlowTarget::BranchEnd(owner) => {
                let fork_id = self.ancestor(cursor, &owner)?;
                let branch_id = self.branch_of(cursor, fork_id)?;
                self.agenda.push_front(Signal::BranchEnd { fork_id, branch_id });
            }
            FlowTarget::WorkflowEnd => self.complete_workflow(output).await?,
        }
        Ok(())
    }

    /// Record the final iteration output of a loop left through `exit`.
    async fn break_loop(&mut self, for_id: Uuid, output: Value) -> Result<Value, EngineError> {
        let context = self.task(for_id)?.context;
        let mut state = self.load_scope(context).await?;
        state.last_output = Some(self.push_output(state.last_output, output).await?);
        state.position += 1;
        self.save_scope(for_id, &state).await?;
        Ok(Value::Array(self.collect_outputs(state.last_output).await?))
    }

    // -- task tree -----------------------------------------------------------

    fn spawn_task(&mut self, reference: TaskReference, parent_id: Option<Uuid>) -> Uuid {
        let task = TaskInstance::new(reference, parent_id, self.now());
        let task_id = task.id;
        self.interp.events.publish(EngineEvent::TaskStatusChanged {
            instance_id: self.instance.id,
            task_id,
            reference: task.reference.to_string(),
            status: TaskStatus::Pending,
        });
        self.instance.tasks.push(task);
        self.changed = true;
        task_id
    }

    fn set_status(
        &mut self,
        task_id: Uuid,
        next: TaskStatus,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let now = self.now();
        let instance_id = self.instance.id;
        let task = self
            .instance
            .task_mut(task_id)
            .ok_or(EngineError::TaskNotFound(task_id))?;
        task.transition(next, reason, now)
            .map_err(|source| EngineError::InvalidTransition {
                reference: task.reference.clone(),
                source,
            })?;
        tracing::debug!(
            instance_id = %instance_id,
            task = task.reference.as_str(),
            status = %next,
            "task status changed"
        );
        self.interp.events.publish(EngineEvent::TaskStatusChanged {
            instance_id,
            task_id,
            reference: task.reference.to_string(),
            status: next,
        });
        self.changed = true;
        Ok(())
    }

    /// Drop timers, correlations, in-flight calls and processes owned by a task.
    fn release(&mut self, task_id: Uuid, prior: TaskStatus) {
        if let Some(handle) = self.in_flight.remove(&task_id) {
            handle.abort();
        }

        let (released, kept): (Vec<PendingTimer>, Vec<PendingTimer>) = self
            .instance
            .timers
            .drain(..)
            .partition(|t| t.task_id == task_id);
        self.instance.timers = kept;
        for timer in released {
            self.commands.push(Command::CancelTimer(timer.id));
        }

        let before = self.instance.correlations.len();
        self.instance.correlations.retain(|c| c.task_id != task_id);
        if self.instance.correlations.len() != before {
            self.commands.push(Command::Unsubscribe { task_id });
        }

        if prior == TaskStatus::Suspended {
            let awaiting_process = self
                .instance
                .task(task_id)
                .and_then(|t| self.def.resolve(&t.reference))
                .is_some_and(|t| matches!(t.kind, TaskKind::Run(_)));
            if awaiting_process {
                self.commands.push(Command::CancelProcess { task_id });
            }
        }
    }

    fn cancel_task(&mut self, task_id: Uuid, reason: &str) -> Result<(), EngineError> {
        let status = self.task(task_id)?.status;
        self.release(task_id, status);
        self.set_status(task_id, TaskStatus::Cancelled, Some(reason.to_string()))
    }

    /// Cancel every operative task below `root`, deepest first.
    fn cancel_descendants(&mut self, root: Uuid) -> Result<(), EngineError> {
        let mut doomed: Vec<(Uuid, usize)> = self
            .instance
            .tasks
            .iter()
            .filter(|t| t.is_operative() && t.id != root && self.descends_from(t.id, root))
            .map(|t| (t.id, t.reference.depth()))
            .collect();
        doomed.sort_by(|a, b| b.1.cmp(&a.1));
        for (task_id, _) in doomed {
            self.cancel_task(task_id, "cancelled by enclosing task")?;
        }
        Ok(())
    }

    fn cancel_operative(&mut self, reason: &str) -> Result<(), EngineError> {
        let mut doomed: Vec<(Uuid, usize)> = self
            .instance
            .tasks
            .iter()
            .filter(|t| t.is_operative())
            .map(|t| (t.id, t.reference.depth()))
            .collect();
        doomed.sort_by(|a, b| b.1.cmp(&a.1));
        for (task_id, _) in doomed {
            self.cancel_task(task_id, reason)?;
        }
        Ok(())
    }

    fn descends_from(&self, task_id: Uuid, ancestor: Uuid) -> bool {
        let mut cursor = self.instance.task(task_id).and_then(|t| t.parent_id);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.instance.task(id).and_then(|t| t.parent_id);
        }
        false
    }

    /// The nearest strict ancestor of `from` executing `reference`.
    fn ancestor(&self, from: Uuid, reference: &TaskReference) -> Result<Uuid, EngineError> {
        let mut cursor = self.task(from)?.parent_id;
        while let Some(id) = cursor {
            let task = self.task(id)?;
            if &task.reference == reference {
                return Ok(id);
            }
            cursor = task.parent_id;
        }
        Err(EngineError::Internal(format!(
            "no instance of '{reference}' encloses task {from}"
        )))
    }

    /// The child of `fork_id` that `from` belongs to.
    fn branch_of(&self, from: Uuid, fork_id: Uuid) -> Result<Uuid, EngineError> {
        let mut cursor = from;
        loop {
            match self.task(cursor)?.parent_id {
                Some(parent) if parent == fork_id => return Ok(cursor),
                Some(parent) => cursor = parent,
                None => {
                    return Err(EngineError::Internal(format!(
                        "task {from} is not inside fork {fork_id}"
                    )));
                }
            }
        }
    }

    fn task(&self, task_id: Uuid) -> Result<&TaskInstance, EngineError> {
        self.instance
            .task(task_id)
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    fn task_mut(&mut self, task_id: Uuid) -> Result<&mut TaskInstance, EngineError> {
        self.instance
            .task_mut(task_id)
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    fn task_def(&self, reference: &TaskReference) -> Result<&'a TaskDefinition, EngineError> {
        let def = self.def;
        def.resolve(reference)
            .ok_or_else(|| EngineError::UnknownTask(reference.clone()))
    }

    fn arm(&mut self, task_id: Uuid, purpose: TimerPurpose, after: chrono::Duration) {
        let deadline = self
            .now()
            .checked_add_signed(after)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let timer = PendingTimer {
            id: Uuid::now_v7(),
            instance_id: self.instance.id,
            task_id,
            purpose,
            deadline,
        };
        self.instance.timers.push(timer.clone());
        self.commands.push(Command::ArmTimer(timer));
    }

    // -- documents and expression data --------------------------------------

    async fn put(&mut self, value: Value) -> Result<DocumentRef, EngineError> {
        let reference = self
            .interp
            .documents
            .put(&value)
            .await
            .map_err(|e| EngineError::Document(e.to_string()))?;
        self.cache.insert(reference, value);
        Ok(reference)
    }

    async fn load(&mut self, reference: Option<DocumentRef>) -> Result<Value, EngineError> {
        let Some(reference) = reference else {
            return Ok(Value::Null);
        };
        if let Some(value) = self.cache.get(&reference) {
            return Ok(value.clone());
        }
        let value = self
            .interp
            .documents
            .get(&reference)
            .await
            .map_err(|e| EngineError::Document(e.to_string()))?;
        self.cache.insert(reference, value.clone());
        Ok(value)
    }

    async fn load_scope(&mut self, reference: Option<DocumentRef>) -> Result<ScopeState, EngineError> {
        let value = self.load(reference).await?;
        ScopeState::from_value(value)
            .map_err(|e| EngineError::Internal(format!("corrupt scope document: {e}")))
    }

    async fn save_scope(&mut self, task_id: Uuid, state: &ScopeState) -> Result<(), EngineError> {
        let reference = self.put(state.to_value()).await?;
        self.task_mut(task_id)?.context = Some(reference);
        Ok(())
    }

    /// Element `index` of a loop's sequence document.
    async fn item_at(&mut self, items: Option<DocumentRef>, index: usize) -> Result<Value, EngineError> {
        let Some(items) = items else {
            return Err(EngineError::Internal("for scope has no sequence".to_string()));
        };
        if !self.cache.contains_key(&items) {
            self.load(Some(items)).await?;
        }
        self.cache
            .get(&items)
            .and_then(|sequence| sequence.get(index))
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("for sequence has no item {index}")))
    }

    /// Append an iteration output to a loop's output chain.
    async fn push_output(
        &mut self,
        previous: Option<DocumentRef>,
        output: Value,
    ) -> Result<DocumentRef, EngineError> {
        let link = serde_json::to_value(OutputLink { output, previous })
            .map_err(|e| EngineError::Internal(format!("loop output: {e}")))?;
        self.put(link).await
    }

    /// Iteration outputs in iteration order.
    async fn collect_outputs(&mut self, last: Option<DocumentRef>) -> Result<Vec<Value>, EngineError> {
        let mut outputs = Vec::new();
        let mut cursor = last;
        while let Some(reference) = cursor {
            let link: OutputLink = serde_json::from_value(self.load(Some(reference)).await?)
                .map_err(|e| EngineError::Internal(format!("corrupt loop output: {e}")))?;
            outputs.push(link.output);
            cursor = link.previous;
        }
        outputs.reverse();
        Ok(outputs)
    }

    async fn transform_input(
        &mut self,
        task_id: Uuid,
        transform: &InputTransform,
        input: Value,
    ) -> Result<Value, Failure> {
        let mut value = input;
        if let Some(from) = &transform.from {
            let data = self.data(task_id, &value).await?.into_value();
            value = evaluate_template(self.interp.capabilities.evaluator(), from, &data)?;
        }
        if let Some(schema) = &transform.schema {
            self.interp
                .capabilities
                .validator()
                .validate(&value, schema)
                .map_err(|detail| {
                    TaskError::validation("task input does not match its schema").with_detail(detail)
                })?;
        }
        Ok(value)
    }

    /// Expression data for `task_id`: reserved keys plus the variables of
    /// every enclosing scope, inner scopes shadowing outer ones.
    async fn data(&mut self, task_id: Uuid, input: &Value) -> Result<ExpressionData, EngineError> {
        let mut scopes = Vec::new();
        let mut cursor = Some(task_id);
        while let Some(id) = cursor {
            let task = self.task(id)?;
            if let Some(context) = task.context {
                scopes.push(context);
            }
            cursor = task.parent_id;
        }
        let (name, reference) = {
            let task = self.task(task_id)?;
            (task.name.clone(), task.reference.to_string())
        };
        let (context_ref, input_ref) = (self.instance.context, self.instance.input);
        let context = self.load(context_ref).await?;
        let workflow_input = self.load(input_ref).await?;

        let mut data = ExpressionData::new(input.clone())
            .context(context)
            .workflow(self.instance.id, &self.def.document.name, workflow_input)
            .task(&name, &reference);
        for scope in scopes.into_iter().rev() {
            let state = self.load_scope(Some(scope)).await?;
            data = data.vars(&state.vars);
        }
        Ok(data)
    }
}

/// Unset matcher fields accept any value.
fn error_matches(matcher: &ErrorMatcher, error: &TaskError) -> bool {
    let status_ok = match &matcher.status {
        None => true,
        Some(Value::String(s)) => s == &error.status,
        Some(Value::Number(n)) => n.to_string() == error.status,
        Some(_) => false,
    };
    status_ok
        && matcher
            .error_type
            .as_ref()
            .is_none_or(|t| t == &error.error_type)
        && matcher
            .title
            .as_ref()
            .is_none_or(|t| error.title.as_ref() == Some(t))
        && matcher
            .instance
            .as_ref()
            .is_none_or(|i| error.instance.as_deref().is_some_and(|e| e.starts_with(i.as_str())))
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Failures of the engine itself, as opposed to errors raised inside tasks.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("document store error: {0}")]
    Document(String),

    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("definition store error: {0}")]
    DefinitionStore(String),

    #[error("task reference '{0}' is not part of the workflow definition")]
    UnknownTask(TaskReference),

    #[error("task {0} not found in instance")]
    TaskNotFound(Uuid),

    #[error("invalid transition of '{reference}': {source}")]
    InvalidTransition {
        reference: TaskReference,
        #[source]
        source: InvalidTransition,
    },

    #[error("cannot {operation} instance {instance_id} while it is {status}")]
    InvalidState {
        instance_id: Uuid,
        status: WorkflowStatus,
        operation: &'static str,
    },

    #[error("instance {instance_id} kept conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { instance_id: Uuid, attempts: u32 },

    #[error("internal engine error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use conduit_types::error::ErrorKind;
    use conduit_types::task::ProcessKind;

    use crate::event::bus::drain_for;
    use crate::workflow::capability::{EventPublisher, FnCaller, RuntimeHost};
    use crate::workflow::scheduler::ManualScheduler;
    use crate::workflow::testing::{workflow, MemoryDocuments};
    use tokio_util::sync::CancellationToken;

    struct Harness {
        interp: Interpreter<MemoryDocuments>,
        bus: EventBus,
    }

    fn harness(capabilities: Capabilities) -> Harness {
        harness_with(capabilities, EngineConfig::default())
    }

    fn harness_with(capabilities: Capabilities, config: EngineConfig) -> Harness {
        let bus = EventBus::new(1024);
        let interp = Interpreter::new(
            Arc::new(MemoryDocuments::default()),
            Arc::new(capabilities),
            Arc::new(ManualScheduler::default()),
            bus.clone(),
            config,
        );
        Harness { interp, bus }
    }

    impl Harness {
        fn instance(&self, def: &WorkflowDefinition) -> WorkflowInstance {
            WorkflowInstance::new(def.definition_ref(), Utc::now())
        }

        async fn doc(&self, reference: Option<DocumentRef>) -> Value {
            self.interp.documents().get(&reference.unwrap()).await.unwrap()
        }

        async fn output(&self, instance: &WorkflowInstance) -> Value {
            self.doc(instance.output).await
        }
    }

    fn by_name<'i>(instance: &'i WorkflowInstance, name: &str) -> Vec<&'i TaskInstance> {
        instance.tasks.iter().filter(|t| t.name == name).collect()
    }

    struct NullPublisher;

    impl EventPublisher for NullPublisher {
        async fn publish(&self, _event: CloudEvent) -> Result<(), TaskError> {
            Ok(())
        }
    }

    struct IdleHost;

    impl RuntimeHost for IdleHost {
        async fn run(
            &self,
            _request: ProcessRequest,
            _cancel: CancellationToken,
        ) -> Result<ProcessOutput, TaskError> {
            Err(TaskError::runtime("not used by interpreter tests"))
        }
    }

    // -- sequencing ----------------------------------------------------------

    #[tokio::test]
    async fn test_sequence_runs_in_declaration_order() {
        let def = workflow(
            r#"
do:
  - name: a
    type: set
    set:
      step: a
  - name: b
    type: set
    set:
      step: b
      seen: "${ input.step }"
  - name: c
    type: set
    set:
      step: c
      seen: "${ input.seen }"
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        let outcome = h.interp.start(&def, &mut wf, json!({})).await.unwrap();

        assert!(outcome.changed);
        assert_eq!(wf.status, WorkflowStatus::Completed);
        let names: Vec<&str> = wf.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(wf.tasks.iter().all(|t| t.status == TaskStatus::Completed));
        assert_eq!(h.output(&wf).await, json!({"step": "c", "seen": "a"}));
    }

    #[tokio::test]
    async fn test_nested_do_bubbles_to_parent_continuation() {
        let def = workflow(
            r#"
do:
  - name: outer
    type: do
    do:
      - name: inner
        type: set
        set:
          value: 1
  - name: after
    type: set
    set:
      value: "${ input.value + 1 }"
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Completed);
        let inner = by_name(&wf, "inner")[0];
        let outer = by_name(&wf, "outer")[0];
        assert_eq!(inner.parent_id, Some(outer.id));
        assert_eq!(outer.status, TaskStatus::Completed);
        assert_eq!(h.output(&wf).await["value"].as_f64(), Some(2.0));
    }

    #[tokio::test]
    async fn test_switch_picks_first_true_case() {
        let def = workflow(
            r#"
do:
  - name: route
    type: switch
    cases:
      - name: never
        when: "input.n > 100"
        then: first
      - name: middle
        when: "input.n > 1"
        then: second
      - name: also
        when: "input.n > 0"
        then: third
  - name: first
    type: set
    set:
      picked: first
    then: end
  - name: second
    type: set
    set:
      picked: second
    then: end
  - name: third
    type: set
    set:
      picked: third
    then: end
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({"n": 5})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(h.output(&wf).await, json!({"picked": "second"}));
        assert!(by_name(&wf, "first").is_empty());
        assert!(by_name(&wf, "third").is_empty());
        assert_eq!(
            by_name(&wf, "route")[0].next,
            Some(FlowDirective::Goto("second".into()))
        );
    }

    #[tokio::test]
    async fn test_false_guard_skips_task_and_continues() {
        let def = workflow(
            r#"
do:
  - name: maybe
    type: set
    if: "input.enabled"
    set:
      touched: true
  - name: after
    type: set
    set:
      done: true
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({"enabled": false})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(by_name(&wf, "maybe")[0].status, TaskStatus::Skipped);
        assert_eq!(h.output(&wf).await, json!({"done": true}));
    }

    #[tokio::test]
    async fn test_for_loop_collects_iteration_outputs() {
        let def = workflow(
            r#"
do:
  - name: double
    type: for
    each: n
    in: "input.values"
    do:
      - name: times-two
        type: set
        set:
          value: "${ n * 2 }"
          at: "${ index }"
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({"values": [1, 2, 3]})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Completed);
        let output = h.output(&wf).await;
        let values: Vec<f64> = output
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["value"].as_f64().unwrap())
            .collect();
        assert_eq!(values, vec![2.0, 4.0, 6.0]);
        assert_eq!(by_name(&wf, "times-two").len(), 3);
    }

    #[tokio::test]
    async fn test_export_updates_workflow_context() {
        let def = workflow(
            r#"
do:
  - name: remember
    type: set
    set:
      token: abc
    export:
      as:
        token: "${ output.token }"
  - name: use-it
    type: set
    set:
      token: "${ context.token }"
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({})).await.unwrap();

        assert_eq!(h.output(&wf).await, json!({"token": "abc"}));
        assert_eq!(h.doc(wf.context).await, json!({"token": "abc"}));
    }

    // -- faults, catch and retry --------------------------------------------

    #[tokio::test]
    async fn test_uncaught_raise_faults_workflow_with_origin() {
        let def = workflow(
            r#"
do:
  - name: wrapper
    type: do
    do:
      - name: boom
        type: raise
        error:
          type: https://example.com/errors/boom
          status: 418
          title: "${ input.why }"
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({"why": "teapot"})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Faulted);
        let error = wf.error.as_ref().unwrap();
        assert_eq!(error.title.as_deref(), Some("teapot"));
        assert_eq!(error.status, "418");
        assert_eq!(error.instance.as_deref(), Some("/do/0/wrapper/do/0/boom"));
        assert_eq!(
            wf.faulted_task.as_ref().unwrap().as_str(),
            "/do/0/wrapper/do/0/boom"
        );
        assert_eq!(wf.status_reason.as_deref(), Some("teapot"));
        assert!(wf.tasks.iter().all(|t| t.status == TaskStatus::Faulted));
    }

    #[tokio::test]
    async fn test_retry_limit_records_exactly_count_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let caps = Capabilities::new().with_function(
            "flaky",
            FnCaller(move |_req: CallRequest| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(TaskError::communication("upstream unavailable").with_status(503))
            }),
        );
        let def = workflow(
            r#"
do:
  - name: guarded
    type: try
    try:
      - name: fetch
        type: call
        function: flaky
    catch:
      errors:
        with:
          status: 503
      retry:
        delay_ms: 0
        limit:
          attempt:
            count: 3
"#,
        );
        let h = harness(caps);
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Faulted);
        let guarded = by_name(&wf, "guarded")[0];
        assert_eq!(guarded.status, TaskStatus::Faulted);
        assert_eq!(guarded.retries.len(), 3);
        assert_eq!(
            guarded.retries.iter().map(|r| r.number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(guarded.runs.len(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(by_name(&wf, "fetch").len(), 4);
        assert!(wf.error.as_ref().unwrap().is_kind(ErrorKind::Communication));
    }

    #[tokio::test]
    async fn test_retry_recovers_when_body_eventually_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let caps = Capabilities::new().with_function(
            "second-time-lucky",
            FnCaller(move |_req: CallRequest| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TaskError::communication("first call fails"))
                } else {
                    Ok(json!({"ok": true}))
                }
            }),
        );
        let def = workflow(
            r#"
do:
  - name: guarded
    type: try
    try:
      - name: fetch
        type: call
        function: second-time-lucky
    catch:
      retry:
        limit:
          attempt:
            count: 5
"#,
        );
        let h = harness(caps);
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(by_name(&wf, "guarded")[0].retries.len(), 1);
        assert_eq!(h.output(&wf).await, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_retry_delay_suspends_until_timer_fires() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let caps = Capabilities::new().with_function(
            "flaky",
            FnCaller(move |_req: CallRequest| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TaskError::communication("first call fails"))
                } else {
                    Ok(json!("done"))
                }
            }),
        );
        let def = workflow(
            r#"
do:
  - name: guarded
    type: try
    try:
      - name: fetch
        type: call
        function: flaky
    catch:
      retry:
        delay_ms: 500
        backoff: constant
        limit:
          attempt:
            count: 2
"#,
        );
        let h = harness(caps);
        let mut wf = h.instance(&def);
        let outcome = h.interp.start(&def, &mut wf, json!({})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Suspended);
        assert_eq!(by_name(&wf, "guarded")[0].status, TaskStatus::Suspended);
        let timer = match outcome.commands.as_slice() {
            [Command::ArmTimer(t)] => t.clone(),
            other => panic!("unexpected commands {other:?}"),
        };
        assert_eq!(timer.purpose, TimerPurpose::RetryDelay);

        h.interp.apply(&def, &mut wf, Trigger::Timer(timer)).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(wf.runs.len(), 2);
        assert_eq!(h.output(&wf).await, json!("done"));
    }

    #[tokio::test]
    async fn test_catch_recovery_sees_bound_error() {
        let def = workflow(
            r#"
do:
  - name: guarded
    type: try
    try:
      - name: boom
        type: raise
        error:
          type: https://example.com/errors/declined
          status: 402
          title: card declined
    catch:
      as: failure
      do:
        - name: compensate
          type: set
          set:
            reason: "${ failure.title }"
  - name: after
    type: set
    set:
      reason: "${ input.reason }"
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(h.output(&wf).await, json!({"reason": "card declined"}));
        assert_eq!(by_name(&wf, "boom")[0].status, TaskStatus::Faulted);
        assert_eq!(by_name(&wf, "guarded")[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_unmatched_catch_filter_propagates() {
        let def = workflow(
            r#"
do:
  - name: guarded
    type: try
    try:
      - name: boom
        type: raise
        error:
          type: https://example.com/errors/other
          status: 500
    catch:
      errors:
        with:
          type: https://example.com/errors/expected
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Faulted);
        assert_eq!(by_name(&wf, "guarded")[0].status, TaskStatus::Faulted);
    }

    #[tokio::test]
    async fn test_catch_without_body_or_retry_swallows_error() {
        let def = workflow(
            r#"
do:
  - name: guarded
    type: try
    try:
      - name: boom
        type: raise
        error:
          type: https://example.com/errors/ignored
          status: 400
    catch: {}
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({"kept": 1})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(h.output(&wf).await, json!({"kept": 1}));
    }

    // -- fork ----------------------------------------------------------------

    #[tokio::test]
    async fn test_fork_failure_cancels_remaining_branches() {
        let def = workflow(
            r#"
do:
  - name: fan-out
    type: fork
    branches:
      - name: slow-left
        type: wait
        duration_ms: 60000
      - name: slow-right
        type: wait
        duration_ms: 60000
      - name: broken
        type: raise
        error:
          type: https://example.com/errors/broken
          status: 500
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        let outcome = h.interp.start(&def, &mut wf, json!({})).await.unwrap();

        assert_eq!(by_name(&wf, "fan-out")[0].status, TaskStatus::Faulted);
        assert_eq!(by_name(&wf, "broken")[0].status, TaskStatus::Faulted);
        assert_eq!(by_name(&wf, "slow-left")[0].status, TaskStatus::Cancelled);
        assert_eq!(by_name(&wf, "slow-right")[0].status, TaskStatus::Cancelled);
        assert_eq!(wf.status, WorkflowStatus::Faulted);
        assert!(wf.timers.is_empty());
        let cancelled = outcome
            .commands
            .iter()
            .filter(|c| matches!(c, Command::CancelTimer(_)))
            .count();
        assert_eq!(cancelled, 2);
    }

    #[tokio::test]
    async fn test_fork_joins_branch_outputs_in_declaration_order() {
        let caps = Capabilities::new()
            .with_function("left", FnCaller(|_r: CallRequest| Ok::<_, TaskError>(json!("L"))))
            .with_function("right", FnCaller(|_r: CallRequest| Ok::<_, TaskError>(json!("R"))));
        let def = workflow(
            r#"
do:
  - name: fan-out
    type: fork
    branches:
      - name: a
        type: call
        function: left
      - name: b
        type: call
        function: right
"#,
        );
        let h = harness(caps);
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(h.output(&wf).await, json!(["L", "R"]));
    }

    #[tokio::test]
    async fn test_competing_fork_takes_first_finisher() {
        let def = workflow(
            r#"
do:
  - name: race
    type: fork
    compete: true
    branches:
      - name: never
        type: wait
        duration_ms: 60000
      - name: quick
        type: set
        set:
          winner: quick
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(by_name(&wf, "never")[0].status, TaskStatus::Cancelled);
        assert_eq!(h.output(&wf).await, json!({"winner": "quick"}));
    }

    // -- suspension ----------------------------------------------------------

    #[tokio::test]
    async fn test_listen_round_trip_status_sequence() {
        let def = workflow(
            r#"
do:
  - name: await-payment
    type: listen
    to:
      one:
        with:
          type: payment.received
"#,
        );
        let h = harness(Capabilities::new());
        let mut events = h.bus.subscribe();
        let mut wf = h.instance(&def);
        let outcome = h.interp.start(&def, &mut wf, json!({})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Suspended);
        assert!(matches!(outcome.commands.as_slice(), [Command::Subscribe { .. }]));

        let unrelated = CloudEvent::new("shop", "order.created", json!({}));
        let ignored = h.interp.apply(&def, &mut wf, Trigger::Event(unrelated)).await.unwrap();
        assert!(!ignored.changed);
        assert_eq!(wf.status, WorkflowStatus::Suspended);

        let paid = CloudEvent::new("shop", "payment.received", json!({"amount": 12}));
        let outcome = h.interp.apply(&def, &mut wf, Trigger::Event(paid)).await.unwrap();
        assert!(outcome
            .commands
            .iter()
            .any(|c| matches!(c, Command::Unsubscribe { .. })));
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(h.output(&wf).await["data"]["amount"], json!(12));
        assert!(wf.correlations.is_empty());

        let statuses: Vec<TaskStatus> = drain_for(&mut events, wf.id)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::TaskStatusChanged { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::Suspended,
                TaskStatus::Running,
                TaskStatus::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_listen_timeout_faults_task() {
        let def = workflow(
            r#"
do:
  - name: await-reply
    type: listen
    timeout_secs: 30
    to:
      any: []
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({})).await.unwrap();
        let timer = wf.timers[0].clone();
        assert_eq!(timer.purpose, TimerPurpose::ListenTimeout);

        let outcome = h.interp.apply(&def, &mut wf, Trigger::Timer(timer)).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Faulted);
        assert!(wf.error.as_ref().unwrap().is_kind(ErrorKind::Timeout));
        assert!(outcome
            .commands
            .iter()
            .any(|c| matches!(c, Command::Unsubscribe { .. })));
    }

    #[tokio::test]
    async fn test_wait_completes_on_timer_and_ignores_stale_timer() {
        let def = workflow(
            r#"
do:
  - name: pause
    type: wait
    duration_ms: 1500
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({"x": 1})).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Suspended);

        let timer = wf.timers[0].clone();
        let stale = PendingTimer {
            id: Uuid::now_v7(),
            ..timer.clone()
        };
        let ignored = h.interp.apply(&def, &mut wf, Trigger::Timer(stale)).await.unwrap();
        assert!(!ignored.changed);

        h.interp.apply(&def, &mut wf, Trigger::Timer(timer)).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(wf.runs.len(), 2);
        assert_eq!(h.output(&wf).await, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_run_waits_for_process_exit() {
        let caps = Capabilities::new().with_host(ProcessKind::Shell, IdleHost);
        let def = workflow(
            r#"
do:
  - name: build
    type: run
    process:
      shell:
        command: "${ input.cmd }"
"#,
        );
        let h = harness(caps);
        let mut wf = h.instance(&def);
        let outcome = h.interp.start(&def, &mut wf, json!({"cmd": "make"})).await.unwrap();

        let (task_id, run, request) = match outcome.commands.as_slice() {
            [Command::LaunchProcess {
                task_id,
                run,
                request,
                await_completion: true,
            }] => (*task_id, *run, request.clone()),
            other => panic!("unexpected commands {other:?}"),
        };
        assert!(matches!(&request.process, ProcessSpec::Shell(s) if s.command == "make"));
        assert_eq!(wf.status, WorkflowStatus::Suspended);

        let exited = Trigger::ProcessExited {
            task_id,
            run,
            result: Ok(ProcessOutput {
                exit_code: 0,
                stdout: "built\n".into(),
                stderr: String::new(),
            }),
        };
        h.interp.apply(&def, &mut wf, exited).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(h.output(&wf).await, json!("built"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_runtime_error() {
        let caps = Capabilities::new().with_host(ProcessKind::Shell, IdleHost);
        let def = workflow(
            r#"
do:
  - name: build
    type: run
    process:
      shell:
        command: "false"
"#,
        );
        let h = harness(caps);
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({})).await.unwrap();
        let task_id = wf.tasks[0].id;

        let exited = Trigger::ProcessExited {
            task_id,
            run: 1,
            result: Ok(ProcessOutput {
                exit_code: 2,
                stdout: String::new(),
                stderr: "no rule".into(),
            }),
        };
        h.interp.apply(&def, &mut wf, exited).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Faulted);
        let error = wf.error.as_ref().unwrap();
        assert!(error.is_kind(ErrorKind::Runtime));
        assert_eq!(error.detail.as_deref(), Some("no rule"));
    }

    #[tokio::test]
    async fn test_missing_capabilities_are_configuration_errors() {
        let def = workflow(
            r#"
do:
  - name: announce
    type: emit
    event:
      source: test
      type: test.done
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({})).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Faulted);
        assert!(wf.error.as_ref().unwrap().is_kind(ErrorKind::Configuration));

        let h = harness(Capabilities::new().with_publisher(NullPublisher));
        let mut wf = h.instance(&def);
        let outcome = h.interp.start(&def, &mut wf, json!({})).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert!(matches!(
            outcome.commands.as_slice(),
            [Command::Publish(e)] if e.event_type == "test.done"
        ));
    }

    #[tokio::test]
    async fn test_cancel_releases_suspended_tasks() {
        let def = workflow(
            r#"
do:
  - name: pause
    type: wait
    duration_ms: 60000
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({})).await.unwrap();

        let outcome = h.interp.cancel(&def, &mut wf).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Cancelled);
        assert_eq!(wf.tasks[0].status, TaskStatus::Cancelled);
        assert!(matches!(outcome.commands.as_slice(), [Command::CancelTimer(_)]));

        let again = h.interp.cancel(&def, &mut wf).await.unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let def = workflow("do:\n  - name: a\n    type: set\n    set: {}\n");
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({})).await.unwrap();
        let err = h.interp.start(&def, &mut wf, json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { operation: "start", .. }));
    }

    #[tokio::test]
    async fn test_goto_cycle_exhausts_step_budget() {
        let def = workflow(
            r#"
do:
  - name: ping
    type: set
    set: {}
    then: pong
  - name: pong
    type: set
    set: {}
    then: ping
"#,
        );
        let config = EngineConfig {
            max_drive_steps: 50,
            ..EngineConfig::default()
        };
        let h = harness_with(Capabilities::new(), config);
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Faulted);
        let error = wf.error.as_ref().unwrap();
        assert!(error.is_kind(ErrorKind::Runtime));
        assert!(error.title.as_deref().unwrap().contains("step budget"));
        assert!(by_name(&wf, "ping").len() > 1);
    }

    #[tokio::test]
    async fn test_run_timeout_cancels_process_and_is_catchable() {
        let caps = Capabilities::new().with_host(ProcessKind::Shell, IdleHost);
        let def = workflow(
            r#"
do:
  - name: guarded
    type: try
    try:
      - name: build
        type: run
        timeout_secs: 5
        process:
          shell:
            command: make
    catch:
      as: failure
      do:
        - name: fallback
          type: set
          set:
            reason: "${ failure.title }"
"#,
        );
        let h = harness(caps);
        let mut wf = h.instance(&def);
        let outcome = h.interp.start(&def, &mut wf, json!({})).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Suspended);
        assert!(outcome
            .commands
            .iter()
            .any(|c| matches!(c, Command::LaunchProcess { await_completion: true, .. })));
        let timer = outcome
            .commands
            .iter()
            .find_map(|c| match c {
                Command::ArmTimer(t) if t.purpose == TimerPurpose::RunTimeout => Some(t.clone()),
                _ => None,
            })
            .unwrap();

        let build_id = by_name(&wf, "build")[0].id;
        let outcome = h.interp.apply(&def, &mut wf, Trigger::Timer(timer)).await.unwrap();
        assert!(outcome
            .commands
            .iter()
            .any(|c| matches!(c, Command::CancelProcess { task_id } if *task_id == build_id)));

        let build = by_name(&wf, "build")[0];
        assert_eq!(build.status, TaskStatus::Faulted);
        assert!(build.error.as_ref().unwrap().is_kind(ErrorKind::Timeout));
        assert_eq!(by_name(&wf, "guarded")[0].status, TaskStatus::Completed);
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(
            h.output(&wf).await,
            json!({"reason": "process did not exit before the task timeout"})
        );

        // The process reporting in late changes nothing.
        let late = Trigger::ProcessExited {
            task_id: build_id,
            run: 1,
            result: Ok(ProcessOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }),
        };
        let ignored = h.interp.apply(&def, &mut wf, late).await.unwrap();
        assert!(!ignored.changed);
    }

    #[tokio::test]
    async fn test_for_while_condition_stops_iterating() {
        let def = workflow(
            r#"
do:
  - name: first-two
    type: for
    each: n
    in: "input.values"
    while: "index < 2"
    do:
      - name: keep
        type: set
        set:
          value: "${ n }"
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({"values": [1, 2, 3, 4]})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Completed);
        let output = h.output(&wf).await;
        let values: Vec<f64> = output
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["value"].as_f64().unwrap())
            .collect();
        assert_eq!(values, vec![1.0, 2.0]);
        assert_eq!(by_name(&wf, "keep").len(), 2);
    }

    #[tokio::test]
    async fn test_for_outputs_survive_suspension() {
        let def = workflow(
            r#"
do:
  - name: slow
    type: for
    each: n
    in: "input.values"
    do:
      - name: pause
        type: wait
        duration_ms: 10
      - name: record
        type: set
        set:
          value: "${ n }"
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({"values": [7, 8, 9]})).await.unwrap();

        for _ in 0..3 {
            assert_eq!(wf.status, WorkflowStatus::Suspended);
            let timer = wf.timers[0].clone();
            h.interp.apply(&def, &mut wf, Trigger::Timer(timer)).await.unwrap();
        }

        assert_eq!(wf.status, WorkflowStatus::Completed);
        let output = h.output(&wf).await;
        let values: Vec<f64> = output
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["value"].as_f64().unwrap())
            .collect();
        assert_eq!(values, vec![7.0, 8.0, 9.0]);

        // The loop scope keeps only references, never the sequence or outputs.
        let scope = h.doc(by_name(&wf, "slow")[0].context).await;
        assert_eq!(scope["count"], json!(3));
        assert!(!scope["items"].is_array());
        assert!(scope.get("outputs").is_none());
    }

    #[tokio::test]
    async fn test_exit_from_nested_do_follows_owner_then() {
        let def = workflow(
            r#"
do:
  - name: outer
    type: do
    then: finish
    do:
      - name: mark
        type: set
        set:
          step: first
        then: exit
      - name: skipped
        type: set
        set:
          step: second
  - name: never
    type: set
    set:
      step: never
  - name: finish
    type: set
    set:
      from: "${ input.step }"
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({})).await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(h.output(&wf).await, json!({"from": "first"}));
        assert_eq!(by_name(&wf, "outer")[0].status, TaskStatus::Completed);
        assert!(by_name(&wf, "skipped").is_empty());
        assert!(by_name(&wf, "never").is_empty());
    }

    #[tokio::test]
    async fn test_listen_all_completes_after_every_filter_matched() {
        let def = workflow(
            r#"
do:
  - name: gather
    type: listen
    to:
      all:
        - with:
            type: order.packed
        - with:
            type: order.labelled
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({})).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Suspended);

        let labelled = CloudEvent::new("shop", "order.labelled", json!({"label": "L1"}));
        let outcome = h
            .interp
            .apply(&def, &mut wf, Trigger::Event(labelled.clone()))
            .await
            .unwrap();
        assert!(outcome.changed);
        assert_eq!(wf.status, WorkflowStatus::Suspended);

        let repeat = h.interp.apply(&def, &mut wf, Trigger::Event(labelled)).await.unwrap();
        assert!(!repeat.changed);
        assert_eq!(wf.status, WorkflowStatus::Suspended);

        let packed = CloudEvent::new("shop", "order.packed", json!({"box": 3}));
        let outcome = h.interp.apply(&def, &mut wf, Trigger::Event(packed)).await.unwrap();
        assert!(outcome
            .commands
            .iter()
            .any(|c| matches!(c, Command::Unsubscribe { .. })));
        assert_eq!(wf.status, WorkflowStatus::Completed);

        let output = h.output(&wf).await;
        assert_eq!(output[0]["type"], json!("order.packed"));
        assert_eq!(output[1]["type"], json!("order.labelled"));
        assert_eq!(output[1]["data"]["label"], json!("L1"));
    }

    #[tokio::test]
    async fn test_corrupt_loop_scope_is_internal_error() {
        let def = workflow(
            r#"
do:
  - name: slow
    type: for
    each: n
    in: "input.values"
    do:
      - name: pause
        type: wait
        duration_ms: 10
"#,
        );
        let h = harness(Capabilities::new());
        let mut wf = h.instance(&def);
        h.interp.start(&def, &mut wf, json!({"values": [1, 2]})).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Suspended);

        let garbage = h.interp.documents().put(&json!({"position": "two"})).await.unwrap();
        let slow = wf.tasks.iter_mut().find(|t| t.name == "slow").unwrap();
        slow.context = Some(garbage);

        let timer = wf.timers[0].clone();
        let err = h.interp.apply(&def, &mut wf, Trigger::Timer(timer)).await.unwrap_err();
        assert!(matches!(err, EngineError::Internal(msg) if msg.contains("corrupt scope document")));
    }
}
