//! Session and correlation error types.

use gantry_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by a [`Session`](crate::Session).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("outbound queue is full")]
    QueueFull,

    #[error("session is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// Returns whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::QueueFull)
    }
}

/// Errors delivered to a request waiting on a correlated response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    #[error("request timed out")]
    Timeout,

    #[error("opaque id {0} already has a waiter")]
    IdInUse(u32),

    #[error("no free opaque id")]
    Exhausted,

    #[error("request cancelled")]
    Cancelled,

    #[error("timer wheel is stopped")]
    WheelStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(SessionError::QueueFull.is_retryable());
        assert!(!SessionError::Closed.is_retryable());
        let io = SessionError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(!io.is_retryable());
    }

    #[test]
    fn test_error_display() {
        assert!(CorrelationError::IdInUse(7).to_string().contains('7'));
        assert_eq!(SessionError::QueueFull.to_string(), "outbound queue is full");
        let err: SessionError = ProtocolError::FrameTooLarge { size: 9, max: 8 }.into();
        assert!(err.to_string().contains("protocol error"));
    }
}
