//! Error types for Stratum v1 protocol.

use thiserror::Error;

use crate::error::ErrorKind;

/// Stratum protocol errors.
#[derive(Error, Debug)]
pub enum StratumError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid message format received from pool
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Pool refused our credentials. Fatal to the session, not retried in place.
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    /// Unexpected response (wrong ID, missing fields, etc.)
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Connection lost
    #[error("Connection lost")]
    Disconnected,

    /// Pool sent `client.reconnect`
    #[error("Pool requested reconnect")]
    ReconnectRequested,

    /// Timeout waiting for response
    #[error("Timeout waiting for response")]
    Timeout,
}

impl StratumError {
    /// Recovery class of this error.
    ///
    /// Connection errors are stream-level faults. Protocol errors mean the
    /// pool said something we cannot work with. Both end the session and
    /// lead to a reconnect; only the log level differs.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StratumError::Io(_)
            | StratumError::ConnectionFailed(_)
            | StratumError::Disconnected
            | StratumError::ReconnectRequested
            | StratumError::Timeout => ErrorKind::Connection,
            StratumError::InvalidUrl(_) => ErrorKind::Config,
            StratumError::Json(_)
            | StratumError::InvalidMessage(_)
            | StratumError::SubscriptionFailed(_)
            | StratumError::AuthorizationFailed(_)
            | StratumError::UnexpectedResponse(_) => ErrorKind::Protocol,
        }
    }
}

/// Convenient Result type for Stratum operations.
pub type StratumResult<T> = Result<T, StratumError>;
