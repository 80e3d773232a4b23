//! Crate-wide error types for multiplexer client operations.
//!
//! Provides structured error reporting with automatic conversion from
//! underlying I/O and framing errors.

use std::io;
use thiserror::Error;

/// Error produced while decoding a wire frame header or contents.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The CRC recorded in the header does not match the contents.
    #[error("frame corrupted: expected crc {expected}, got {actual}")]
    Corrupted { expected: i32, actual: i32 },

    /// The declared content length exceeds the configured ceiling.
    #[error("frame too long: {length} bytes exceeds limit of {limit}")]
    TooLong { length: u32, limit: u32 },
}

/// Comprehensive error type for multiplexer client operations.
#[derive(Debug, Error)]
pub enum MultiplexerError {
    /// The underlying transport was closed, locally or by the peer.
    #[error("connection closed")]
    TransportClosed,

    /// A frame failed to decode.
    #[error("framing error: {0}")]
    Framing(#[from] FrameError),

    /// An operation did not complete within its deadline.
    #[error("operation timed out")]
    Timeout,

    /// A message could not be delivered to its destination.
    #[error("delivery failed: {0}")]
    DeliveryFailure(String),

    /// A backend reported an application-level error for a query.
    #[error("backend error: {0:?}")]
    BackendError(Vec<u8>),

    /// The manager has been closed and can no longer accept work.
    #[error("connections manager is closed")]
    Closed,

    /// I/O error surfaced from the reactor or a blocking call site.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for multiplexer operations.
pub type MultiplexerResult<T> = Result<T, MultiplexerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_carries_payload() {
        let err = MultiplexerError::BackendError(b"boom".to_vec());
        assert!(err.to_string().contains("backend error"));
    }

    #[test]
    fn framing_error_converts() {
        let fe = FrameError::TooLong { length: 100, limit: 10 };
        let err: MultiplexerError = fe.into();
        assert!(matches!(err, MultiplexerError::Framing(_)));
    }
}
