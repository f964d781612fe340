use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::instance::TaskStatus;

const ERROR_TYPE_BASE: &str = "https://serverlessworkflow.io/spec/1.0.0/errors";

// ---------------------------------------------------------------------------
// TaskError (the user-visible error entity)
// ---------------------------------------------------------------------------

/// Taxonomy of errors raised inside tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Validation,
    Expression,
    Authentication,
    Communication,
    Timeout,
    Runtime,
    Correlation,
}

impl ErrorKind {
    /// Type URI carried by errors of this kind.
    pub fn type_uri(self) -> String {
        let segment = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Validation => "validation",
            ErrorKind::Expression => "expression",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Communication => "communication",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Correlation => "correlation",
        };
        format!("{ERROR_TYPE_BASE}/{segment}")
    }

    fn default_status(self) -> u16 {
        match self {
            ErrorKind::Configuration | ErrorKind::Validation | ErrorKind::Expression => 400,
            ErrorKind::Authentication => 401,
            ErrorKind::Timeout => 408,
            ErrorKind::Correlation => 409,
            ErrorKind::Communication | ErrorKind::Runtime => 500,
        }
    }
}

/// An error raised by, or recorded against, a task.
///
/// Serves as the terminal error of task and workflow instances and as the
/// match target of `catch` filters. String fields of a `raise` template may
/// hold runtime expressions that are evaluated when the task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Error type URI.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Numeric-like status code, kept as a string.
    #[serde(deserialize_with = "status_from_string_or_number")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Reference of the task the error originated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, title: impl Into<String>) -> Self {
        Self {
            error_type: kind.type_uri(),
            status: kind.default_status().to_string(),
            title: Some(title.into()),
            detail: None,
            instance: None,
        }
    }

    pub fn configuration(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, title)
    }

    pub fn validation(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, title)
    }

    pub fn expression(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Expression, title)
    }

    pub fn authentication(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, title)
    }

    pub fn communication(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Communication, title)
    }

    pub fn timeout(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, title)
    }

    pub fn runtime(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, title)
    }

    pub fn correlation(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Correlation, title)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status.to_string();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Set the originating task reference unless one is already recorded.
    pub fn with_instance(mut self, reference: impl Into<String>) -> Self {
        if self.instance.is_none() {
            self.instance = Some(reference.into());
        }
        self
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.error_type == kind.type_uri()
    }

    /// Short human-readable summary used as a status reason.
    pub fn summary(&self) -> String {
        self.title
            .clone()
            .or_else(|| self.detail.clone())
            .unwrap_or_else(|| self.error_type.clone())
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {}, type {})", self.summary(), self.status, self.error_type)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {}

fn status_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Status {
        Text(String),
        Number(u64),
    }

    Ok(match Status::deserialize(deserializer)? {
        Status::Text(s) => s,
        Status::Number(n) => n.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Engine-side errors
// ---------------------------------------------------------------------------

/// Errors from instance, document and definition stores.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("entity not found")]
    NotFound,

    #[error("stale write: expected version {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },

    #[error("storage error: {0}")]
    Storage(String),
}

/// A task reference string that does not follow the reference grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("invalid task reference '{0}'")]
    Invalid(String),
}

/// A status change that the task state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid task transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_constructors_set_type_and_status() {
        let err = TaskError::timeout("listen timed out").with_instance("/do/0/wait-for-payment");
        assert!(err.is_kind(ErrorKind::Timeout));
        assert!(!err.is_kind(ErrorKind::Runtime));
        assert_eq!(err.status, "408");
        assert_eq!(err.error_type, "https://serverlessworkflow.io/spec/1.0.0/errors/timeout");
        assert_eq!(err.instance.as_deref(), Some("/do/0/wait-for-payment"));
    }

    #[test]
    fn test_with_instance_keeps_origin() {
        let err = TaskError::runtime("boom")
            .with_instance("/do/0/inner")
            .with_instance("/do/0");
        assert_eq!(err.instance.as_deref(), Some("/do/0/inner"));
    }

    #[test]
    fn test_status_accepts_numbers_and_strings() {
        let from_number: TaskError = serde_json::from_str(
            r#"{"type": "https://example.com/errors/payment", "status": 402, "title": "declined"}"#,
        )
        .unwrap();
        assert_eq!(from_number.status, "402");

        let from_text: TaskError =
            serde_yaml_ng::from_str("type: https://example.com/x\nstatus: '503'\n").unwrap();
        assert_eq!(from_text.status, "503");
        assert!(from_text.title.is_none());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = TaskError::communication("upstream failed").with_detail("connection reset");
        let text = err.to_string();
        assert!(text.contains("upstream failed"));
        assert!(text.contains("connection reset"));
        assert!(text.contains("500"));
    }

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Conflict { expected: 3, actual: 5 };
        assert_eq!(err.to_string(), "stale write: expected version 3, found 5");
        assert_eq!(RepositoryError::NotFound.to_string(), "entity not found");
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = InvalidTransition {
            from: TaskStatus::Completed,
            to: TaskStatus::Running,
        };
        assert_eq!(err.to_string(), "invalid task transition from completed to running");
    }
}
