//! Error types for the AMI client

use crate::message::AmiMessage;

/// Errors produced by the codec, the request API and the connection.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AmiError {
    /// Socket-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TCP connect did not complete in time.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The connection closed before the operation could complete.
    #[error("connection closed")]
    ConnectionClosed,

    /// No socket is currently installed.
    #[error("not connected")]
    NotConnected,

    /// A buffered line grew past the limit without a CRLF.
    #[error("line exceeds {limit} bytes without a separator")]
    LineTooLong { limit: usize },

    /// The action has no `Action` field; nothing was sent.
    #[error("an action must contain an Action")]
    MissingAction,

    /// A field value cannot be expressed on the wire.
    #[error("unsupported value for header {header}: {kind}")]
    UnsupportedValue { header: String, kind: &'static str },

    /// A header name or value would break line framing.
    #[error("invalid field {header}: {reason}")]
    InvalidField { header: String, reason: &'static str },

    /// The manager answered with a non-`Success` response.
    #[error("{message}")]
    ActionFailed {
        message: String,
        response: Box<AmiMessage>,
    },

    /// The terminal `OriginateResponse` reported a failure.
    #[error("Origination Failed: {reason}")]
    OriginateFailed {
        reason: String,
        response: Box<AmiMessage>,
    },

    /// Login was rejected by the manager.
    #[error("login failed: {0}")]
    LoginFailed(String),

    /// Notifications were dropped because the consumer fell behind.
    #[error("notification queue full, notifications dropped")]
    QueueFull,
}

impl AmiError {
    /// Raw manager message attached to a protocol-level failure.
    pub fn response(&self) -> Option<&AmiMessage> {
        match self {
            AmiError::ActionFailed { response, .. } | AmiError::OriginateFailed { response, .. } => {
                Some(response)
            }
            _ => None,
        }
    }

    /// Whether this error came from the transport rather than the manager.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AmiError::Io(_)
                | AmiError::Timeout { .. }
                | AmiError::ConnectionClosed
                | AmiError::NotConnected
                | AmiError::LineTooLong { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type AmiResult<T> = Result<T, AmiError>;
