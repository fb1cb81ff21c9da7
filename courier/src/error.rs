//! Error types for queue operations.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type MqResult<T> = Result<T, MqError>;

/// Errors raised by clients, transports and the server lifecycle.
#[derive(Error, Debug)]
pub enum MqError {
    /// The server was disposed; it can no longer be started or stopped.
    #[error("MqServer has been disposed")]
    ObjectDisposed,

    /// A blocking get did not receive a message in time.
    #[error("Timed out after {0:?} waiting for a message on '{1}'")]
    Timeout(Duration, String),

    /// Could not reach or (re)connect to the broker.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The broker rejected or failed an operation.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Message body could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid endpoint or settings.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl MqError {
    /// Whether the error is a broker-level failure (as opposed to a message-level one).
    ///
    /// Workers back off and retry the connection for these.
    pub fn is_transport_error(&self) -> bool {
        matches!(self, MqError::Connection(_) | MqError::Transport(_))
    }
}

impl From<lapin::Error> for MqError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
                MqError::Connection(err.to_string())
            }
            _ => MqError::Transport(err.to_string()),
        }
    }
}

impl From<url::ParseError> for MqError {
    fn from(err: url::ParseError) -> Self {
        MqError::Configuration(format!("invalid broker url: {}", err))
    }
}
