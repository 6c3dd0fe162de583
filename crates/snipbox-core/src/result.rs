//! Execution results delivered back to the documentation pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Terminal status of one snippet submission
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ExecutionStatus {
    /// Snippet ran to completion
    Success,
    /// Rejected by static validation; never retried
    SecurityViolation,
    /// Wall-clock timeout; the worker was hard-killed
    Timeout,
    /// The snippet raised an error at runtime
    RuntimeError,
    /// Memory ceiling exceeded; the worker was hard-killed
    ResourceExceeded,
}

impl ExecutionStatus {
    /// Whether this status represents a successful run
    #[inline]
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Stable name used in metrics and logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::SecurityViolation => "security_violation",
            Self::Timeout => "timeout",
            Self::RuntimeError => "runtime_error",
            Self::ResourceExceeded => "resource_exceeded",
        }
    }

    /// All statuses, in metric-reporting order
    #[must_use]
    pub fn all() -> [ExecutionStatus; 5] {
        [
            Self::Success,
            Self::SecurityViolation,
            Self::Timeout,
            Self::RuntimeError,
            Self::ResourceExceeded,
        ]
    }
}

/// The outcome of one snippet submission
///
/// Immutable once produced. The result cache owns stored results; callers
/// receive them behind an `Arc` and must not assume exclusive access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Terminal status
    pub status: ExecutionStatus,
    /// Captured standard output
    pub stdout: Vec<u8>,
    /// Captured standard error, plus runtime error text where applicable
    pub stderr: Vec<u8>,
    /// Textual form of the snippet's trailing expression value, if any
    pub return_summary: Option<String>,
    /// Wall-clock execution time
    pub duration: Duration,
    /// Peak resident memory observed for the worker
    pub peak_memory_bytes: u64,
    /// When the result was produced
    pub computed_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Build a successful result
    #[must_use]
    pub fn success(
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        return_summary: Option<String>,
        duration: Duration,
        peak_memory_bytes: u64,
    ) -> Self {
        Self {
            status: ExecutionStatus::Success,
            stdout,
            stderr,
            return_summary,
            duration,
            peak_memory_bytes,
            computed_at: Utc::now(),
        }
    }

    /// Build a failure result carrying a diagnostic message on stderr
    #[must_use]
    pub fn failure(status: ExecutionStatus, message: impl Into<String>, duration: Duration) -> Self {
        Self {
            status,
            stdout: Vec::new(),
            stderr: message.into().into_bytes(),
            return_summary: None,
            duration,
            peak_memory_bytes: 0,
            computed_at: Utc::now(),
        }
    }

    /// Standard output as lossy UTF-8
    #[inline]
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error as lossy UTF-8
    #[inline]
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}
