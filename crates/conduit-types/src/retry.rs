//! Retry policy configuration attached to `catch` clauses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Shape of the delay growth between successive retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Every retry waits the base delay.
    #[default]
    Constant,
    /// Retry `n` waits `n * delay`.
    Linear,
    /// Retry `n` waits `delay * 2^(n-1)`.
    Exponential,
}

/// Uniform random offset added to each computed delay, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jitter {
    pub from_ms: i64,
    pub to_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptLimit {
    /// Maximum number of retries (initial execution excluded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryLimit {
    #[serde(default)]
    pub attempt: AttemptLimit,
    /// Maximum wall-clock time since the first retry was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// How a caught error is retried.
///
/// ```yaml
/// retry:
///   when: "error.status == '503'"
///   delay_ms: 200
///   backoff: exponential
///   limit:
///     attempt:
///       count: 3
///   jitter:
///     from_ms: 0
///     to_ms: 50
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Guard that must hold (against `{ error }`) for a retry to happen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Guard that prevents a retry when it holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_when: Option<String>,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub limit: RetryLimit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<Jitter>,
}

/// Inline policy or the name of one declared under the workflow's `use.retries`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryPolicyRef {
    Named(String),
    Inline(RetryPolicy),
}

/// One recorded decision to retry. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based retry number.
    pub number: u32,
    pub time: DateTime<Utc>,
    pub cause: TaskError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults_when_fields_omitted() {
        let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.backoff, Backoff::Constant);
        assert_eq!(policy.delay_ms, 0);
        assert!(policy.limit.attempt.count.is_none());
        assert!(policy.jitter.is_none());
    }

    #[test]
    fn test_policy_parses_from_yaml() {
        let yaml = r#"
when: "error.status == '503'"
delay_ms: 250
backoff: exponential
limit:
  attempt:
    count: 5
  duration_ms: 60000
jitter:
  from_ms: -20
  to_ms: 20
"#;
        let policy: RetryPolicy = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(policy.backoff, Backoff::Exponential);
        assert_eq!(policy.limit.attempt.count, Some(5));
        assert_eq!(policy.limit.duration_ms, Some(60_000));
        assert_eq!(policy.jitter, Some(Jitter { from_ms: -20, to_ms: 20 }));
    }

    #[test]
    fn test_policy_ref_accepts_name_or_inline() {
        let named: RetryPolicyRef = serde_json::from_str("\"default\"").unwrap();
        assert_eq!(named, RetryPolicyRef::Named("default".into()));

        let inline: RetryPolicyRef = serde_json::from_str(r#"{"delay_ms": 10}"#).unwrap();
        assert!(matches!(inline, RetryPolicyRef::Inline(p) if p.delay_ms == 10));
    }
}
