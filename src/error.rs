//! Error types for keyed-queue operations.
//!
//! Defines the error types for each subsystem:
//! - Task bodies (`TaskError`), classified into terminal and transient failures
//! - Scheduler lifecycle and submission (`SchedulerError`)
//! - Configuration loading and validation (`ConfigError`)

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Errors reported synchronously by the scheduler itself.
///
/// Task outcomes never surface here: a pushed task reports success or failure
/// only through logs, statistics and metrics.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler is shutting down or its governing token was cancelled.
    #[error("Scheduler is closed and no longer accepts tasks")]
    Closed,

    /// `shutdown` was called more than once.
    #[error("Scheduler is already shut down")]
    AlreadyShutDown,

    /// Draining did not finish in time.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// The scheduler was constructed outside of a tokio runtime.
    #[error("No tokio runtime available to spawn workers")]
    NoRuntime,

    /// The supplied configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// How the retry policy treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying cannot fix the failure; drop the task.
    Terminal,
    /// Possibly recoverable; retry until the budget runs out.
    Transient,
    /// The body panicked. Dropped like a terminal error but logged apart.
    Panic,
}

/// Error returned by a task body.
///
/// The terminal variants mirror the categories a storage layer reports for
/// requests that can never succeed as issued; everything else is transient.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("invalid client argument: {0}")]
    InvalidArgument(String),

    #[error("BadValue: {0}")]
    BadValue(String),

    #[error("IndexNotFound: {0}")]
    IndexNotFound(String),

    #[error("FailedToParse: {0}")]
    FailedToParse(String),

    #[error("TypeMismatch: {0}")]
    TypeMismatch(String),

    #[error("IllegalOperation: {0}")]
    IllegalOperation(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("bad server: {0}")]
    BadServer(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// A server error code with no dedicated category.
    #[error("server error (code {code}): {message}")]
    Server { code: i32, message: String },

    /// The body panicked; the payload is the panic message.
    #[error("task panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    /// Maps a numeric server error code onto a category.
    ///
    /// Codes without a dedicated category become [`TaskError::Server`], which
    /// is retried.
    pub fn from_server_code(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            2 => Self::BadValue(message),
            9 => Self::FailedToParse(message),
            14 => Self::TypeMismatch(message),
            20 => Self::IllegalOperation(message),
            27 => Self::IndexNotFound(message),
            26 | 47 => Self::NotFound(message),
            11000 | 11001 | 12582 => Self::Duplicate(message),
            6 | 7 | 89 | 202 | 9001 => Self::Network(message),
            50 | 262 => Self::Timeout(message),
            // step-downs, elections and shutdowns in progress
            91 | 189 | 10107 | 11600 | 11602 | 13435 | 13436 => Self::BadServer(message),
            _ => Self::Server { code, message },
        }
    }

    /// Returns the retry classification for this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            TaskError::NotFound(_)
            | TaskError::Duplicate(_)
            | TaskError::InvalidArgument(_)
            | TaskError::BadValue(_)
            | TaskError::IndexNotFound(_)
            | TaskError::FailedToParse(_)
            | TaskError::TypeMismatch(_)
            | TaskError::IllegalOperation(_) => ErrorClass::Terminal,
            TaskError::Panicked(_) => ErrorClass::Panic,
            TaskError::Network(_)
            | TaskError::Timeout(_)
            | TaskError::BadServer(_)
            | TaskError::Internal(_)
            | TaskError::Server { .. }
            | TaskError::Other(_) => ErrorClass::Transient,
        }
    }

    /// Returns true if retrying this error is futile.
    pub fn is_terminal(&self) -> bool {
        self.class() != ErrorClass::Transient
    }

    /// Short label used in log messages and metric labels.
    pub fn category(&self) -> &'static str {
        match self {
            TaskError::NotFound(_) => "not_found",
            TaskError::Duplicate(_) => "duplicate",
            TaskError::InvalidArgument(_)
            | TaskError::BadValue(_)
            | TaskError::IndexNotFound(_)
            | TaskError::FailedToParse(_)
            | TaskError::TypeMismatch(_)
            | TaskError::IllegalOperation(_) => "invalid_argument",
            TaskError::Network(_) => "network",
            TaskError::Timeout(_) => "timeout",
            TaskError::BadServer(_) => "bad_server",
            TaskError::Internal(_) => "internal",
            TaskError::Server { .. } => "server",
            TaskError::Panicked(_) => "panic",
            TaskError::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_categories() {
        let terminal = [
            TaskError::NotFound("doc".into()),
            TaskError::Duplicate("id".into()),
            TaskError::InvalidArgument("filter".into()),
            TaskError::BadValue("x".into()),
            TaskError::IndexNotFound("idx".into()),
            TaskError::FailedToParse("$foo".into()),
            TaskError::TypeMismatch("$inc".into()),
            TaskError::IllegalOperation("txn".into()),
        ];

        for err in &terminal {
            assert_eq!(err.class(), ErrorClass::Terminal, "{err}");
            assert!(err.is_terminal());
        }
    }

    #[test]
    fn test_transient_categories() {
        let transient = [
            TaskError::Network("reset".into()),
            TaskError::Timeout("deadline".into()),
            TaskError::BadServer("stepdown".into()),
            TaskError::Internal("oops".into()),
            TaskError::Server {
                code: 4242,
                message: "unknown".into(),
            },
            TaskError::Other(anyhow::anyhow!("pool exhausted")),
        ];

        for err in &transient {
            assert_eq!(err.class(), ErrorClass::Transient, "{err}");
            assert!(!err.is_terminal());
        }
    }

    #[test]
    fn test_panic_is_not_transient() {
        let err = TaskError::Panicked("boom".into());
        assert_eq!(err.class(), ErrorClass::Panic);
        assert!(err.is_terminal());
        assert_eq!(err.category(), "panic");
    }

    #[test]
    fn test_from_server_code() {
        assert!(matches!(
            TaskError::from_server_code(11000, "E11000 duplicate key"),
            TaskError::Duplicate(_)
        ));
        assert!(matches!(
            TaskError::from_server_code(2, "bad"),
            TaskError::BadValue(_)
        ));
        assert!(matches!(
            TaskError::from_server_code(27, "index"),
            TaskError::IndexNotFound(_)
        ));
        assert!(matches!(
            TaskError::from_server_code(189, "stepped down"),
            TaskError::BadServer(_)
        ));
        assert!(matches!(
            TaskError::from_server_code(89, "network timeout"),
            TaskError::Network(_)
        ));
        assert!(matches!(
            TaskError::from_server_code(50, "max time"),
            TaskError::Timeout(_)
        ));

        let unknown = TaskError::from_server_code(31337, "mystery");
        assert!(matches!(unknown, TaskError::Server { code: 31337, .. }));
        assert_eq!(unknown.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_error_display() {
        let err = TaskError::Server {
            code: 7,
            message: "host".into(),
        };
        assert!(err.to_string().contains("code 7"));

        let err = SchedulerError::ShutdownTimeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30"));

        let err = SchedulerError::Closed;
        assert!(err.to_string().contains("closed"));
    }
}
