//! Runtime instance model: workflow instances, task instances, runs and timers.
//!
//! A [`WorkflowInstance`] owns the executed task tree as a flat list of
//! [`TaskInstance`]s linked by `parent_id`. Payloads (input, context,
//! output) are stored out of line and referenced through [`DocumentRef`]s.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::correlation::CorrelationContext;
use crate::error::{InvalidTransition, TaskError};
use crate::reference::TaskReference;
use crate::retry::RetryAttempt;
use crate::task::{DefinitionRef, FlowDirective};

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Suspended,
    Faulted,
    Cancelled,
    Completed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Faulted | WorkflowStatus::Cancelled | WorkflowStatus::Completed
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Suspended => "suspended",
            WorkflowStatus::Faulted => "faulted",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a task instance.
///
/// ```text
/// pending -> running -> { faulted | skipped | suspended | cancelled | completed }
/// suspended -> { running | cancelled | faulted }
/// pending -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Faulted,
    Skipped,
    Suspended,
    Cancelled,
    Completed,
}

impl TaskStatus {
    /// Pending, running or suspended.
    pub fn is_operative(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Suspended
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_operative()
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Faulted)
                | (Running, Skipped)
                | (Running, Suspended)
                | (Running, Cancelled)
                | (Running, Completed)
                | (Suspended, Running)
                | (Suspended, Cancelled)
                | (Suspended, Faulted)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Faulted => "faulted",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Suspended => "suspended",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Supporting records
// ---------------------------------------------------------------------------

/// Opaque handle to a payload held by the document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentRef(pub Uuid);

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry into (or re-entry after suspension of) a workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// One execution of a task; retried bodies add a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRun {
    /// 1-based.
    pub number: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TaskStatus>,
}

/// Why a timer was armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerPurpose {
    WaitElapsed,
    ListenTimeout,
    RunTimeout,
    RetryDelay,
}

impl fmt::Display for TimerPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimerPurpose::WaitElapsed => "wait_elapsed",
            TimerPurpose::ListenTimeout => "listen_timeout",
            TimerPurpose::RunTimeout => "run_timeout",
            TimerPurpose::RetryDelay => "retry_delay",
        };
        f.write_str(s)
    }
}

/// A timer armed on behalf of a task. Persisted so it can be re-armed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTimer {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub task_id: Uuid,
    pub purpose: TimerPurpose,
    pub deadline: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// TaskInstance
// ---------------------------------------------------------------------------

/// Runtime record of one executed task node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: Uuid,
    pub name: String,
    /// Pointer to the definition node this instance executes.
    pub reference: TaskReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub is_extension: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub runs: Vec<TaskRun>,
    #[serde(default)]
    pub retries: Vec<RetryAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<DocumentRef>,
    /// Scope bindings and bookkeeping visible to descendants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<DocumentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<DocumentRef>,
    /// Directive resolved on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<FlowDirective>,
}

impl TaskInstance {
    pub fn new(reference: TaskReference, parent_id: Option<Uuid>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: reference.name().to_string(),
            reference,
            parent_id,
            is_extension: false,
            created_at: now,
            started_at: None,
            ended_at: None,
            status: TaskStatus::Pending,
            status_reason: None,
            runs: Vec::new(),
            retries: Vec::new(),
            error: None,
            input: None,
            context: None,
            output: None,
            next: None,
        }
    }

    pub fn is_operative(&self) -> bool {
        self.status.is_operative()
    }

    /// Move to `next`, validating the edge and maintaining timestamps and
    /// the current run.
    pub fn transition(
        &mut self,
        next: TaskStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        if self.status == TaskStatus::Pending && next == TaskStatus::Running {
            self.started_at = Some(now);
            self.begin_run(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
            if let Some(run) = self.runs.last_mut().filter(|r| r.ended_at.is_none()) {
                run.ended_at = Some(now);
                run.outcome = Some(next);
            }
        }

        self.status = next;
        self.status_reason = reason;
        Ok(())
    }

    /// Close the current run and open the next one (retry re-entry).
    pub fn begin_run(&mut self, now: DateTime<Utc>) -> u32 {
        if let Some(run) = self.runs.last_mut().filter(|r| r.ended_at.is_none()) {
            run.ended_at = Some(now);
            run.outcome = Some(TaskStatus::Faulted);
        }
        let number = self.runs.len() as u32 + 1;
        self.runs.push(TaskRun {
            number,
            started_at: now,
            ended_at: None,
            outcome: None,
        });
        number
    }

    /// Number of the run currently in progress (0 before the first run).
    pub fn current_run(&self) -> u32 {
        self.runs.last().map(|r| r.number).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// WorkflowInstance
// ---------------------------------------------------------------------------

/// One execution of one workflow definition version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition: DefinitionRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<DocumentRef>,
    /// Workflow-level context updated by `export`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<DocumentRef>,
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub runs: Vec<WorkflowRun>,
    #[serde(default)]
    pub tasks: Vec<TaskInstance>,
    #[serde(default)]
    pub correlations: Vec<CorrelationContext>,
    #[serde(default)]
    pub timers: Vec<PendingTimer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Reference of the task whose uncaught error faulted the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faulted_task: Option<TaskReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<DocumentRef>,
    /// Optimistic-concurrency version, bumped by the store on every write.
    #[serde(default)]
    pub version: u64,
}

impl WorkflowInstance {
    pub fn new(definition: DefinitionRef, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            definition,
            input: None,
            context: None,
            status: WorkflowStatus::Pending,
            status_reason: None,
            created_at: now,
            started_at: None,
            ended_at: None,
            runs: Vec::new(),
            tasks: Vec::new(),
            correlations: Vec::new(),
            timers: Vec::new(),
            error: None,
            faulted_task: None,
            output: None,
            version: 0,
        }
    }

    pub fn task(&self, id: Uuid) -> Option<&TaskInstance> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: Uuid) -> Option<&mut TaskInstance> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Direct children of a task, in creation order.
    pub fn children(&self, parent_id: Uuid) -> impl Iterator<Item = &TaskInstance> {
        self.tasks.iter().filter(move |t| t.parent_id == Some(parent_id))
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn correlation(&self, task_id: Uuid) -> Option<&CorrelationContext> {
        self.correlations.iter().find(|c| c.task_id == task_id)
    }

    /// Close the current run, if one is open.
    pub fn end_run(&mut self, now: DateTime<Utc>) {
        if let Some(run) = self.runs.last_mut().filter(|r| r.ended_at.is_none()) {
            run.ended_at = Some(now);
        }
    }

    /// Open a new run unless one is already open.
    pub fn begin_run(&mut self, now: DateTime<Utc>) {
        if self.runs.last().is_none_or(|r| r.ended_at.is_some()) {
            self.runs.push(WorkflowRun {
                started_at: now,
                ended_at: None,
            });
        }
    }
}
