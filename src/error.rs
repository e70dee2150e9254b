//! Custom error types for the server.
//!
//! `DaqError` is the application-level error. Driver failures have their own
//! type ([`DriverError`]) because they are contained inside the acquisition
//! worker; they only reach `DaqError` when the backend cannot be opened at
//! startup.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: figment failed to parse or merge a configuration source.
//! - **`Configuration`**: a value parsed but is semantically wrong (caught by
//!   `ServerConfig::validate`).
//! - **`Validation`**: a client request was rejected. Maps to HTTP 400 and
//!   never changes acquisition state.
//! - **`Driver`**: the hardware backend could not be opened.
//! - **`UnknownChannel`**: a data request named a channel that is not
//!   configured. Maps to HTTP 404.
//! - **`Io`** and **`Server`**: socket and HTTP server failures.

use thiserror::Error;

use crate::driver::DriverError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// A rejected client parameter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {field}: {reason}")]
pub struct ValidationError {
    /// Parameter name as sent by the client
    pub field: &'static str,
    /// Why the value was rejected
    pub reason: String,
}

impl ValidationError {
    /// Create a validation error for `field`.
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Application error.
#[derive(Error, Debug)]
pub enum DaqError {
    /// A configuration source could not be read or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A configuration value is out of range.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A client request parameter was rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The hardware backend could not be opened.
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// The requested channel is not configured.
    #[error("Unknown channel {0}")]
    UnknownChannel(usize),

    /// Socket or thread spawn failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The HTTP server stopped with an error.
    #[error("HTTP server error: {0}")]
    Server(#[from] hyper::Error),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// HTTP status code for an error returned to a client.
    pub fn status_code(&self) -> u16 {
        match self {
            DaqError::Validation(_) => 400,
            DaqError::UnknownChannel(_) => 404,
            _ => 500,
        }
    }
}
