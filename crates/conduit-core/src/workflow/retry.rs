//! Retry decisions for errors caught by a `try` task.
//!
//! Stateless: all inputs (policy, error, attempt history, clock) are passed
//! in, and the caller records the resulting [`RetryAttempt`] itself.

use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_types::error::TaskError;
use conduit_types::retry::{Backoff, Jitter, RetryAttempt, RetryPolicy};
use rand::Rng;
use serde_json::json;

use super::expression::{evaluate_condition, ExpressionEvaluator};

// ---------------------------------------------------------------------------
// RetryDecision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GiveUpReason {
    /// `when` did not hold.
    NotEligible,
    /// `except_when` held.
    Excluded,
    AttemptsExhausted,
    DurationExhausted,
    /// A guard expression could not be evaluated.
    GuardFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enter the task body after `delay`. `attempt` is 1-based.
    Retry { attempt: u32, delay: Duration },
    GiveUp(GiveUpReason),
}

// ---------------------------------------------------------------------------
// RetryEvaluator
// ---------------------------------------------------------------------------

pub struct RetryEvaluator;

impl RetryEvaluator {
    /// Decide whether `error` should be retried under `policy`, given the
    /// retries already recorded for the task.
    pub fn should_retry(
        policy: &RetryPolicy,
        error: &TaskError,
        history: &[RetryAttempt],
        now: DateTime<Utc>,
        evaluator: &dyn ExpressionEvaluator,
    ) -> RetryDecision {
        Self::should_retry_with_rng(policy, error, history, now, evaluator, &mut rand::thread_rng())
    }

    /// [`Self::should_retry`] with an explicit jitter source.
    pub fn should_retry_with_rng<R: Rng + ?Sized>(
        policy: &RetryPolicy,
        error: &TaskError,
        history: &[RetryAttempt],
        now: DateTime<Utc>,
        evaluator: &dyn ExpressionEvaluator,
        rng: &mut R,
    ) -> RetryDecision {
        let data = json!({ "error": error });

        if let Some(when) = &policy.when {
            match evaluate_condition(evaluator, when, &data) {
                Ok(true) => {}
                Ok(false) => return RetryDecision::GiveUp(GiveUpReason::NotEligible),
                Err(e) => return RetryDecision::GiveUp(GiveUpReason::GuardFailed(e.to_string())),
            }
        }
        if let Some(except_when) = &policy.except_when {
            match evaluate_condition(evaluator, except_when, &data) {
                Ok(false) => {}
                Ok(true) => return RetryDecision::GiveUp(GiveUpReason::Excluded),
                Err(e) => return RetryDecision::GiveUp(GiveUpReason::GuardFailed(e.to_string())),
            }
        }

        if let Some(count) = policy.limit.attempt.count {
            if history.len() as u64 >= u64::from(count) {
                return RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted);
            }
        }
        if let (Some(limit_ms), Some(first)) = (policy.limit.duration_ms, history.first()) {
            let elapsed = (now - first.time).num_milliseconds().max(0) as u64;
            if elapsed >= limit_ms {
                return RetryDecision::GiveUp(GiveUpReason::DurationExhausted);
            }
        }

        let attempt = history.len() as u32 + 1;
        let mut delay = Self::backoff_delay(policy, attempt);
        if let Some(jitter) = &policy.jitter {
            delay = Self::apply_jitter(delay, jitter, rng);
        }
        RetryDecision::Retry { attempt, delay }
    }

    /// Delay before retry `attempt` (1-based), without jitter.
    pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let n = u64::from(attempt.max(1));
        let millis = match policy.backoff {
            Backoff::Constant => policy.delay_ms,
            Backoff::Linear => policy.delay_ms.saturating_mul(n),
            Backoff::Exponential => {
                let factor = 1u64.checked_shl((n - 1) as u32).unwrap_or(u64::MAX);
                policy.delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(millis)
    }

    /// Add a uniform offset from `jitter`, flooring the result at zero.
    fn apply_jitter<R: Rng + ?Sized>(delay: Duration, jitter: &Jitter, rng: &mut R) -> Duration {
        let (low, high) = if jitter.from_ms <= jitter.to_ms {
            (jitter.from_ms, jitter.to_ms)
        } else {
            (jitter.to_ms, jitter.from_ms)
        };
        let offset = rng.gen_range(low..=high);
        let base = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        Duration::from_millis(base.saturating_add(offset).max(0) as u64)
    }

    /// Append the attempt for a decision to retry. Returns its number.
    pub fn record(history: &mut Vec<RetryAttempt>, cause: &TaskError, now: DateTime<Utc>) -> u32 {
        let number = history.len() as u32 + 1;
        history.push(RetryAttempt {
            number,
            time: now,
            cause: cause.clone(),
        });
        number
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
