//! Error types for the AMI client

use thiserror::Error;

/// AMI client error type.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AmiError {
    /// Socket-level failure (dial, read, write).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply within the allotted time.
    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The session is not online (or the client is disabled).
    #[error("Not connected to Asterisk")]
    NotConnected,

    /// The server closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Login was rejected.
    #[error("Authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// Malformed or unexpected data on the wire.
    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    /// A field name or value that cannot be put on the wire.
    #[error("Invalid header: {header}")]
    InvalidHeader { header: String },

    /// The server answered an action with `Response: Error`.
    #[error("Action failed: {message}")]
    ActionFailed { message: String },

    /// Another request with the same `ActionID` is still pending.
    #[error("ActionID already pending: {action_id}")]
    DuplicateActionId { action_id: String },

    /// Invalid configuration value.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl AmiError {
    /// Create a protocol error with a message.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError {
            message: message.into(),
        }
    }

    /// Create an authentication failure with a reason.
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::AuthFailed {
            reason: reason.into(),
        }
    }

    /// Create a configuration error with a message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Result type for AMI operations.
pub type AmiResult<T> = Result<T, AmiError>;
