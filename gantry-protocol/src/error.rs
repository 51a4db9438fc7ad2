//! Protocol error types.

use thiserror::Error;

/// Errors raised by the buffer, the framing codec and the marshal hooks.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("buffer underflow: need {needed} bytes, {remaining} remaining")]
    Underflow { needed: usize, remaining: usize },

    #[error("varint overflows 64 bits")]
    VarintOverflow,

    #[error("invalid UTF-8 in buffer")]
    InvalidUtf8,

    #[error("invalid cursor positions: read {read}, write {write}")]
    InvalidCursor { read: usize, write: usize },

    #[error("unsupported length field width: {0} bytes")]
    UnsupportedWidth(usize),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("frame too small: {size} bytes (min {min})")]
    FrameTooSmall { size: u64, min: u64 },

    #[error("header too large: {size} bytes (max {max})")]
    HeaderTooLarge { size: u64, max: u64 },

    #[error("header too small: {size} bytes (min {min})")]
    HeaderTooSmall { size: u64, min: u64 },

    #[error("length {value} does not fit in a {width}-byte field")]
    LengthOverflow { value: u64, width: usize },

    #[error("marshal error: {0}")]
    Marshal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether the error means the peer closed the stream.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }

    /// Returns whether the error means the connection is gone.
    pub fn is_disconnect(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self,
            ProtocolError::Io(e) if matches!(
                e.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
            )
        )
    }

    /// Returns whether the error came from a malformed length field.
    ///
    /// After one of these the stream position can no longer be trusted.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooLarge { .. }
                | ProtocolError::FrameTooSmall { .. }
                | ProtocolError::HeaderTooLarge { .. }
                | ProtocolError::HeaderTooSmall { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("50"));

        let err = ProtocolError::Underflow {
            needed: 4,
            remaining: 1,
        };
        assert!(err.to_string().contains("underflow"));

        let err = ProtocolError::LengthOverflow {
            value: 300,
            width: 1,
        };
        assert!(err.to_string().contains("300"));

        let err = ProtocolError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn test_error_classification() {
        let eof = ProtocolError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(eof.is_eof());
        assert!(eof.is_disconnect());
        assert!(!eof.is_framing());

        let reset = ProtocolError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(reset.is_disconnect());
        assert!(!reset.is_eof());

        let framing = ProtocolError::HeaderTooSmall { size: 2, min: 8 };
        assert!(framing.is_framing());
        assert!(!framing.is_eof());
        assert!(!framing.is_disconnect());
    }
}
