//! Error types for frugal-core.

use thiserror::Error;

/// Main error type for all runtime operations.
#[derive(Debug, Error)]
pub enum FrugalError {
    /// I/O error from an underlying backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (handshake only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Base64 body could not be decoded (HTTP transport).
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Malformed header block, bad version, length mismatch, missing field.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame, request or response exceeded a configured bound.
    #[error("Message size error: {0}")]
    MessageSize(String),

    /// Transport (or its backend) is not open/connected.
    #[error("Transport not open: {0}")]
    NotOpen(String),

    /// Transport is already open.
    #[error("Transport already open: {0}")]
    AlreadyOpen(String),

    /// A bounded wait (handshake, request) exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The context's op id still has a live registry entry.
    #[error("Context already registered (op id {0})")]
    ContextAlreadyRegistered(u64),

    /// Backend exchange failed (bad status, publish failure, bad response).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The pending call was interrupted because its registry closed.
    #[error("Call interrupted: registry closed")]
    Interrupted,

    /// Error raised by a service handler.
    #[error("Application error: {0}")]
    Application(String),
}

impl FrugalError {
    /// Whether a retry interceptor may retry after this error.
    ///
    /// Interrupts and lifecycle/programming errors abort retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FrugalError::Interrupted
                | FrugalError::NotOpen(_)
                | FrugalError::AlreadyOpen(_)
                | FrugalError::ContextAlreadyRegistered(_)
                | FrugalError::MessageSize(_)
        )
    }
}

/// Result type alias using FrugalError.
pub type Result<T> = std::result::Result<T, FrugalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FrugalError::Timeout("x".into()).is_retryable());
        assert!(FrugalError::Application("boom".into()).is_retryable());
        assert!(FrugalError::Transport("503".into()).is_retryable());
        assert!(!FrugalError::Interrupted.is_retryable());
        assert!(!FrugalError::ContextAlreadyRegistered(7).is_retryable());
        assert!(!FrugalError::NotOpen("closed".into()).is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = FrugalError::ContextAlreadyRegistered(42);
        assert_eq!(err.to_string(), "Context already registered (op id 42)");

        let err = FrugalError::Protocol("unsupported header version 1".into());
        assert!(err.to_string().contains("unsupported header version"));
    }
}
