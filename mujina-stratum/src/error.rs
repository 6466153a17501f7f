//! Common error types for mujina-stratum.
//!
//! Module-level errors (Stratum, hash thread, validation) keep their own
//! enums. This module provides the crate-wide [`Error`] those collapse into
//! at the daemon boundary, plus [`ErrorKind`], the recovery class each
//! failure belongs to.

use strum::Display;
use thiserror::Error;

/// Recovery class of a failure.
///
/// Each class is handled at the boundary nearest its origin: the session
/// reconnects on connection and protocol faults, a worker is isolated on
/// device faults, and validation failures are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ErrorKind {
    Connection,
    Protocol,
    Device,
    Validation,
    Config,
}

/// Main error type for mujina-stratum operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stream-level failure talking to the pool
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed or unexpected pool message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Hardware initialization or communication failure
    #[error("Device error: {0}")]
    Device(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Connection(_) => ErrorKind::Connection,
            Error::Serial(_) | Error::Device(_) => ErrorKind::Device,
            Error::Config(_) => ErrorKind::Config,
            Error::Protocol(_) => ErrorKind::Protocol,
        }
    }
}

impl From<crate::stratum_v1::StratumError> for Error {
    fn from(err: crate::stratum_v1::StratumError) -> Self {
        match err.kind() {
            ErrorKind::Connection => Error::Connection(err.to_string()),
            ErrorKind::Config => Error::Config(err.to_string()),
            _ => Error::Protocol(err.to_string()),
        }
    }
}

impl From<crate::hash_thread::HashThreadError> for Error {
    fn from(err: crate::hash_thread::HashThreadError) -> Self {
        Error::Device(err.to_string())
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
