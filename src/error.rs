//! Error Types
//!
//! Errors raised by the scheduler, tracker and report writers, plus the
//! classification of failed invocation attempts.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, BenchError>;

/// Errors surfaced by the benchmark core.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Non-zero exit that is likely to succeed on retry.
    #[error("transient execution failure (exit code {exit_code:?}): {message}")]
    TransientExecution {
        exit_code: Option<i32>,
        message: String,
    },

    /// Invocation exceeded its time budget.
    #[error("invocation timed out after {0:.2?}")]
    Timeout(std::time::Duration),

    /// Invalid scheduling or resource parameters.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal invariant violated (e.g. double dispatch of a task).
    #[error("fatal scheduling error: {0}")]
    FatalScheduling(String),

    /// The external program could not be started.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Task was cancelled before or during execution.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl BenchError {
    /// Whether the scheduler should retry the attempt that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientExecution { .. } | Self::Timeout(_))
    }
}

/// Exit code conventionally used for "temporary failure, try again".
pub const EX_TEMPFAIL: i32 = 75;

/// Stderr fragments that mark a non-zero exit as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "temporarily unavailable",
    "too many open files",
    "out of memory",
    "cannot allocate memory",
    "resource exhausted",
    "rate limit",
    "503 service unavailable",
];

/// Classification of a finished, unsuccessful attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Ordinary non-zero exit
    Exit,
    /// Non-zero exit caused by something environmental
    Transient,
    /// Killed after exceeding the timeout
    Timeout,
    /// Program could not be launched
    Spawn,
    /// Cancelled by pool shutdown
    Cancelled,
    /// Internal scheduling invariant violated
    Fatal,
    /// Refused at submission (invalid task)
    Rejected,
}

impl FailureKind {
    /// Classifies a non-zero exit using its code and captured stderr.
    pub fn classify_exit(exit_code: Option<i32>, stderr: &str) -> Self {
        if exit_code == Some(EX_TEMPFAIL) {
            return Self::Transient;
        }

        let lowered = stderr.to_lowercase();
        if TRANSIENT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            Self::Transient
        } else {
            Self::Exit
        }
    }

    /// Only timeouts and transient exits are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Exit => "exit",
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Spawn => "spawn",
            Self::Cancelled => "cancelled",
            Self::Fatal => "fatal",
            Self::Rejected => "rejected",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_classify_plain_exit() {
        assert_eq!(FailureKind::classify_exit(Some(1), "bad input"), FailureKind::Exit);
        assert_eq!(FailureKind::classify_exit(None, ""), FailureKind::Exit);
    }

    #[test]
    fn test_classify_tempfail_code() {
        assert_eq!(
            FailureKind::classify_exit(Some(EX_TEMPFAIL), ""),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_classify_transient_stderr() {
        let kind = FailureKind::classify_exit(Some(2), "error: Connection refused (os error 111)");
        assert_eq!(kind, FailureKind::Transient);
        assert!(kind.is_retryable());
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(FailureKind::Timeout.is_retryable());
        assert!(!FailureKind::Exit.is_retryable());
        assert!(!FailureKind::Spawn.is_retryable());
        assert!(!FailureKind::Cancelled.is_retryable());
        assert!(!FailureKind::Fatal.is_retryable());
        assert!(!FailureKind::Rejected.is_retryable());
    }

    #[test]
    fn test_error_retryable() {
        assert!(BenchError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!BenchError::Configuration("x".into()).is_retryable());
        assert!(!BenchError::FatalScheduling("double dispatch".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = BenchError::Configuration("max_concurrent_tasks must be > 0".into());
        assert_eq!(
            err.to_string(),
            "configuration error: max_concurrent_tasks must be > 0"
        );
        assert_eq!(FailureKind::Timeout.to_string(), "timeout");
    }
}
