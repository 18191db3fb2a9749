//! Error types for pg_shuttle.
//!
//! All errors that can occur within the tool are represented by
//! [`ShuttleError`]. Errors are propagated via `Result<T, ShuttleError>`
//! throughout the codebase and rendered once at the CLI boundary.
//!
//! # Error Classification
//!
//! Errors are classified into kinds that determine retry behavior:
//! - **Transient** — connection resets, deadlocks, lock/serialization
//!   failures. Retried with backoff up to `max-attempts`.
//! - **Data** — constraint violations while applying decoded changes.
//!   Fails the offending transaction; retried once, then fatal.
//! - **Planning** — missing source objects, permission denied. Fatal.
//! - **Tool** — non-zero exit from pg_dump/pg_restore. Fatal unless the
//!   skip-db-properties policy masks it.
//! - **Protocol** — unparseable logical-decoding output. Fatal, with the
//!   offending LSN logged.
//!
//! # Retry Policy
//!
//! The [`RetryPolicy`] struct encapsulates exponential backoff with jitter
//! for transient errors. Supervisors use it to decide whether and when a
//! failed task attempt is requeued.

use std::fmt;

/// Primary error type for pg_shuttle.
#[derive(Debug, thiserror::Error)]
pub enum ShuttleError {
    // ── Transient errors — retry with backoff ────────────────────────────
    /// A database connection failed or was lost mid-operation.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server reported a retryable condition (deadlock, lock timeout,
    /// serialization failure, admin shutdown).
    #[error("transient server error ({code}): {message}")]
    TransientServer { code: String, message: String },

    // ── Data errors — fail the transaction, retry once ───────────────────
    /// A decoded transaction violated a target-side constraint.
    #[error("apply failed at {lsn}: {message}")]
    Apply { lsn: String, message: String },

    // ── Planning errors — immediately fatal ──────────────────────────────
    /// A source object named by the plan does not exist.
    #[error("source object not found: {0}")]
    SourceMissing(String),

    /// The source or target refused an operation for lack of privilege.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The work plan is internally inconsistent.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    // ── Tool errors — external dump/restore failed ───────────────────────
    /// pg_dump or pg_restore exited non-zero.
    #[error("{tool} failed with exit code {code}: {stderr}")]
    Tool {
        tool: String,
        code: i32,
        stderr: String,
    },

    /// pg_dump or pg_restore could not be spawned at all.
    #[error("failed to run {tool}: {source}")]
    ToolSpawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    // ── Protocol errors — unparseable plugin output ──────────────────────
    /// A logical-decoding message could not be parsed.
    #[error("unparseable {plugin} message at {lsn}: {detail}")]
    Decode {
        plugin: String,
        lsn: String,
        detail: String,
    },

    // ── Configuration and state errors ───────────────────────────────────
    /// Invalid command-line option, URI, or filter manifest.
    #[error("configuration error: {0}")]
    Config(String),

    /// The progress catalog refused an operation.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// A non-retryable server error outside the classes above.
    #[error("server error ({code}): {message}")]
    Server { code: String, message: String },

    /// CDC sentinel or slot state is missing or inconsistent.
    #[error("stream state error: {0}")]
    StreamState(String),

    /// The run was cancelled by the operator.
    #[error("cancelled")]
    Cancelled,

    /// Filesystem failure under the working directory.
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Classification of an error for retry decisions and the final summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Data,
    Planning,
    Tool,
    Protocol,
    Config,
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "TRANSIENT"),
            ErrorKind::Data => write!(f, "DATA"),
            ErrorKind::Planning => write!(f, "PLANNING"),
            ErrorKind::Tool => write!(f, "TOOL"),
            ErrorKind::Protocol => write!(f, "PROTOCOL"),
            ErrorKind::Config => write!(f, "CONFIG"),
            ErrorKind::Fatal => write!(f, "FATAL"),
        }
    }
}

/// SQLSTATE codes the supervisors treat as retryable.
///
/// Class 08 (connection), 40001/40P01 (serialization/deadlock), 55P03
/// (lock not available), 57P01..57P03 (admin shutdown / crash recovery).
const TRANSIENT_SQLSTATES: &[&str] = &[
    "08000", "08001", "08003", "08004", "08006", "40001", "40P01", "55P03", "57P01", "57P02",
    "57P03",
];

impl ShuttleError {
    /// Classify the error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShuttleError::Connection(_) | ShuttleError::TransientServer { .. } => {
                ErrorKind::Transient
            }
            ShuttleError::Apply { .. } => ErrorKind::Data,
            ShuttleError::SourceMissing(_)
            | ShuttleError::PermissionDenied(_)
            | ShuttleError::InvalidPlan(_) => ErrorKind::Planning,
            ShuttleError::Tool { .. } | ShuttleError::ToolSpawn { .. } => ErrorKind::Tool,
            ShuttleError::Decode { .. } => ErrorKind::Protocol,
            ShuttleError::Config(_) => ErrorKind::Config,
            ShuttleError::Catalog(_)
            | ShuttleError::Server { .. }
            | ShuttleError::StreamState(_)
            | ShuttleError::Cancelled
            | ShuttleError::Io { .. } => ErrorKind::Fatal,
        }
    }

    /// Whether a supervisor may requeue the failed task.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Map a driver error onto the taxonomy above.
    ///
    /// Errors that carry a SQLSTATE are classified by code; errors without
    /// one (socket-level failures, closed connections) are `Connection`.
    pub fn from_db(err: tokio_postgres::Error) -> Self {
        if let Some(db) = err.as_db_error() {
            let code = db.code().code();
            let message = db.message().to_string();
            if TRANSIENT_SQLSTATES.contains(&code) {
                return ShuttleError::TransientServer {
                    code: code.to_string(),
                    message,
                };
            }
            if code == "42501" {
                return ShuttleError::PermissionDenied(message);
            }
            if code == "42P01" || code == "42704" {
                return ShuttleError::SourceMissing(message);
            }
            // Integrity violations (class 23) surface as Data errors; the
            // applier attaches the commit LSN before logging.
            if code.starts_with("23") {
                return ShuttleError::Apply {
                    lsn: "0/0".to_string(),
                    message: format!("{code}: {message}"),
                };
            }
            return ShuttleError::Server {
                code: code.to_string(),
                message,
            };
        }
        ShuttleError::Connection(err.to_string())
    }

    /// Attach an LSN to a `Data` error raised during apply.
    pub fn at_lsn(self, lsn: &str) -> Self {
        match self {
            ShuttleError::Apply { message, .. } => ShuttleError::Apply {
                lsn: lsn.to_string(),
                message,
            },
            other => other,
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        ShuttleError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<rusqlite::Error> for ShuttleError {
    fn from(e: rusqlite::Error) -> Self {
        ShuttleError::Catalog(e.to_string())
    }
}

impl From<tokio_postgres::Error> for ShuttleError {
    fn from(e: tokio_postgres::Error) -> Self {
        ShuttleError::from_db(e)
    }
}

pub type Result<T> = std::result::Result<T, ShuttleError>;

// ── Retry Policy ───────────────────────────────────────────────────────────

/// Retry policy with exponential backoff for transient errors.
///
/// Used by the copy/index/apply supervisors to decide whether a failed task
/// attempt should be requeued, deferred, or given up on.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay in milliseconds (doubled each attempt).
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for backoff).
    pub max_delay_ms: u64,
    /// Maximum number of attempts before marking the task failed.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay in milliseconds for the given attempt number (0-based).
    ///
    /// Exponential: `base_delay * 2^attempt`, capped at `max_delay`, with
    /// deterministic ±25% jitter based on attempt parity.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = delay.min(self.max_delay_ms);

        if attempt.is_multiple_of(2) {
            capped.saturating_mul(3) / 4
        } else {
            capped.saturating_mul(5) / 4
        }
    }

    /// Whether the given attempt count (number of failures so far) is
    /// within the retry limit.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection_lost() -> ShuttleError {
        ShuttleError::Connection("connection closed".into())
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(connection_lost().kind(), ErrorKind::Transient);
        assert_eq!(
            ShuttleError::Apply {
                lsn: "0/1".into(),
                message: "duplicate key".into()
            }
            .kind(),
            ErrorKind::Data
        );
        assert_eq!(
            ShuttleError::SourceMissing("public.t".into()).kind(),
            ErrorKind::Planning
        );
        assert_eq!(
            ShuttleError::Tool {
                tool: "pg_restore".into(),
                code: 1,
                stderr: "boom".into()
            }
            .kind(),
            ErrorKind::Tool
        );
        assert_eq!(
            ShuttleError::Decode {
                plugin: "wal2json".into(),
                lsn: "0/2".into(),
                detail: "bad json".into()
            }
            .kind(),
            ErrorKind::Protocol
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(connection_lost().is_retryable());
        assert!(
            ShuttleError::TransientServer {
                code: "40P01".into(),
                message: "deadlock detected".into()
            }
            .is_retryable()
        );
        assert!(!ShuttleError::PermissionDenied("nope".into()).is_retryable());
        assert!(!ShuttleError::Cancelled.is_retryable());
        assert!(
            !ShuttleError::Server {
                code: "0A000".into(),
                message: "not supported".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_at_lsn_only_rewrites_apply_errors() {
        let e = ShuttleError::Apply {
            lsn: "0/0".into(),
            message: "x".into(),
        }
        .at_lsn("1/2A");
        match e {
            ShuttleError::Apply { lsn, .. } => assert_eq!(lsn, "1/2A"),
            other => panic!("unexpected: {other:?}"),
        }

        let e = ShuttleError::Cancelled.at_lsn("1/2A");
        assert!(matches!(e, ShuttleError::Cancelled));
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            max_attempts: 5,
        };

        // Attempt 0: 1000 * 2^0 = 1000, -25% = 750
        assert_eq!(policy.backoff_ms(0), 750);
        // Attempt 1: 1000 * 2^1 = 2000, +25% = 2500
        assert_eq!(policy.backoff_ms(1), 2500);
        // Attempt 2: 1000 * 2^2 = 4000, -25% = 3000
        assert_eq!(policy.backoff_ms(2), 3000);
        // Attempt 3: 1000 * 2^3 = 8000, capped 8000, +25% = 10000
        assert_eq!(policy.backoff_ms(3), 10_000);
        // Attempt 4: capped at 10000, -25% = 7500
        assert_eq!(policy.backoff_ms(4), 7500);
    }

    #[test]
    fn test_retry_policy_should_retry() {
        let policy = RetryPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            max_attempts: 3,
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }
}
