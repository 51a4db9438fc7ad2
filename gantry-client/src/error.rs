//! Client error types.

use gantry_protocol::ProtocolError;
use gantry_session::{CorrelationError, SessionError};
use std::net::SocketAddr;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("request failed: {0}")]
    Correlation(#[from] CorrelationError),

    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("invalid pong: {0}")]
    InvalidPong(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::ConnectTimeout(_) => true,
            ClientError::Session(e) => matches!(e, SessionError::QueueFull | SessionError::Closed),
            ClientError::Correlation(e) => matches!(e, CorrelationError::Timeout | CorrelationError::Exhausted),
            _ => false,
        }
    }
}
