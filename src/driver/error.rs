//! Error type for driver calls.
//!
//! Every native call either succeeds or yields a [`DriverError`] carrying the
//! name of the operation and the native status code. The adapter never
//! retries; recovery policy belongs to the acquisition worker.

use thiserror::Error;

/// Result type alias for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Errors raised by a [`DaqDriver`](super::DaqDriver) backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// The native library reported a failure status.
    #[error("{operation} failed with status {status}: {message}")]
    Status {
        /// Driver call that failed (e.g. `start_task`)
        operation: &'static str,
        /// Native status code
        status: i32,
        /// Human-readable description
        message: String,
    },

    /// The native library or one of its symbols could not be loaded.
    #[error("Failed to load driver library '{library}': {message}")]
    LibraryLoad {
        /// Library path or symbol that failed to resolve
        library: String,
        /// Loader message
        message: String,
    },

    /// A task-scoped call was issued without a live task.
    #[error("{operation} called without a live task")]
    NoTask {
        /// Driver call that required a task
        operation: &'static str,
    },

    /// An argument could not be passed across the native boundary.
    #[error("Invalid argument for {operation}: {message}")]
    InvalidArgument {
        /// Driver call that rejected the argument
        operation: &'static str,
        /// What was wrong with it
        message: String,
    },
}

impl DriverError {
    /// Build a status error for `operation`.
    pub fn status(operation: &'static str, status: i32, message: impl Into<String>) -> Self {
        Self::Status {
            operation,
            status,
            message: message.into(),
        }
    }

    /// Name of the operation that failed, when known.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            Self::Status { operation, .. }
            | Self::NoTask { operation }
            | Self::InvalidArgument { operation, .. } => Some(*operation),
            Self::LibraryLoad { .. } => None,
        }
    }

    /// Native status code, when the failure came from the library itself.
    pub fn status_code(&self) -> Option<i32> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
