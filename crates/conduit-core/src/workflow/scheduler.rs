//! Timer scheduling and the engine clock.
//!
//! The interpreter never sleeps. It records a [`PendingTimer`] on the
//! instance and asks a [`Scheduler`] to arm it; when the deadline passes
//! the scheduler hands the timer back to the runner, which resumes the
//! instance with it.
//!
//! - [`TokioScheduler`] fires timers in real time over an mpsc channel.
//! - [`ManualScheduler`] is a virtual clock for tests: time only moves on
//!   [`ManualScheduler::advance`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use conduit_types::instance::PendingTimer;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Clock plus timer arming.
pub trait Scheduler: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Arm a timer. Arming an already armed id replaces it.
    fn arm(&self, timer: PendingTimer);

    /// Disarm a timer. Returns false if it was not armed.
    fn cancel(&self, timer_id: Uuid) -> bool;
}

// ---------------------------------------------------------------------------
// TokioScheduler
// ---------------------------------------------------------------------------

/// Real-time scheduler backed by `tokio::time::sleep`.
pub struct TokioScheduler {
    fired: mpsc::UnboundedSender<PendingTimer>,
    armed: Arc<DashMap<Uuid, CancellationToken>>,
}

impl TokioScheduler {
    /// Create the scheduler and the receiver fired timers are delivered on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PendingTimer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                fired: tx,
                armed: Arc::new(DashMap::new()),
            },
            rx,
        )
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn arm(&self, timer: PendingTimer) {
        let token = CancellationToken::new();
        if let Some(previous) = self.armed.insert(timer.id, token.clone()) {
            previous.cancel();
        }

        let wait = (timer.deadline - Utc::now()).to_std().unwrap_or_default();
        let fired = self.fired.clone();
        let armed = Arc::clone(&self.armed);
        tracing::debug!(
            timer_id = %timer.id,
            task_id = %timer.task_id,
            purpose = %timer.purpose,
            wait_ms = wait.as_millis() as u64,
            "timer armed"
        );

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    armed.remove(&timer.id);
                    if fired.send(timer).is_err() {
                        tracing::warn!("timer fired after the scheduler receiver closed");
                    }
                }
            }
        });
    }

    fn cancel(&self, timer_id: Uuid) -> bool {
        match self.armed.remove(&timer_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// ManualScheduler
// ---------------------------------------------------------------------------

struct ManualState {
    now: DateTime<Utc>,
    armed: BTreeMap<Uuid, PendingTimer>,
}

/// Virtual-clock scheduler. Nothing fires until the clock is advanced.
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: start,
                armed: BTreeMap::new(),
            }),
        }
    }

    /// Move the clock forward and return the timers that came due, in
    /// deadline order. Returned timers are disarmed.
    pub fn advance(&self, by: chrono::Duration) -> Vec<PendingTimer> {
        let mut state = self.lock();
        state.now += by;
        let now = state.now;
        let due: Vec<Uuid> = state
            .armed
            .values()
            .filter(|t| t.deadline <= now)
            .map(|t| t.id)
            .collect();
        let mut fired: Vec<PendingTimer> = due
            .iter()
            .filter_map(|id| state.armed.remove(id))
            .collect();
        fired.sort_by_key(|t| t.deadline);
        fired
    }

    pub fn armed(&self) -> Vec<PendingTimer> {
        self.lock().armed.values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        // A poisoned clock is still a valid clock.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    fn arm(&self, timer: PendingTimer) {
        self.lock().armed.insert(timer.id, timer);
    }

    fn cancel(&self, timer_id: Uuid) -> bool {
        self.lock().armed.remove(&timer_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_types::instance::TimerPurpose;

    fn timer(deadline: DateTime<Utc>) -> PendingTimer {
        PendingTimer {
            id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            task_id: Uuid::now_v7(),
            purpose: TimerPurpose::WaitElapsed,
            deadline,
        }
    }

    #[test]
    fn test_manual_fires_only_due_timers_in_order() {
        let start = Utc::now();
        let clock = ManualScheduler::new(start);
        let late = timer(start + chrono::Duration::seconds(10));
        let early = timer(start + chrono::Duration::seconds(2));
        clock.arm(late.clone());
        clock.arm(early.clone());

        assert!(clock.advance(chrono::Duration::seconds(1)).is_empty());
        let fired = clock.advance(chrono::Duration::seconds(20));
        assert_eq!(fired, vec![early, late]);
        assert!(clock.armed().is_empty());
        assert_eq!(clock.now(), start + chrono::Duration::seconds(21));
    }

    #[test]
    fn test_manual_cancel_disarms() {
        let clock = ManualScheduler::default();
        let t = timer(clock.now());
        clock.arm(t.clone());
        assert!(clock.cancel(t.id));
        assert!(!clock.cancel(t.id));
        assert!(clock.advance(chrono::Duration::seconds(1)).is_empty());
    }

    #[tokio::test]
    async fn test_tokio_scheduler_delivers_elapsed_timer() {
        let (scheduler, mut rx) = TokioScheduler::new();
        let t = timer(Utc::now() + chrono::Duration::milliseconds(10));
        scheduler.arm(t.clone());
        let fired = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired.id, t.id);
    }

    #[tokio::test]
    async fn test_tokio_scheduler_cancel_prevents_delivery() {
        let (scheduler, mut rx) = TokioScheduler::new();
        let t = timer(Utc::now() + chrono::Duration::milliseconds(50));
        scheduler.arm(t.clone());
        assert!(scheduler.cancel(t.id));
        let res = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await;
        assert!(res.is_err());
    }
}
