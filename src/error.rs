use thiserror::Error;
use std::io;

/// Error type for media stream operations
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// A caller-supplied argument or configuration value is not acceptable
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Inbound packet does not conform to the expected wire format
    #[error("Invalid packet format: {0}")]
    InvalidPacket(String),

    /// Buffer too small for the requested parse or build
    #[error("Buffer too small: need {required} but have {available}")]
    BufferTooSmall {
        required: usize,
        available: usize,
    },

    /// Frame exceeds the maximum payload the selected formatter can carry
    #[error("Payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooBig {
        size: usize,
        limit: usize,
    },

    /// Socket-level send failure
    #[error("Send failed: {0}")]
    SendError(String),

    /// Socket-level receive failure
    #[error("Receive failed: {0}")]
    RecvError(String),

    /// Resource allocation failure (queues, worker spawn)
    #[error("Allocation failed: {0}")]
    MemoryError(String),

    /// A bounded wait elapsed without the expected event
    #[error("Timed out: {0}")]
    Timeout(String),

    /// ZRTP message authentication failed
    #[error("Authentication failure: {0}")]
    AuthFailure(String),

    /// Operation attempted before the stream was initialized
    #[error("Not ready")]
    NotReady,

    /// Unclassified failure, typically surfaced from a dead worker
    #[error("{0}")]
    Generic(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Generic(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let invalid = Error::InvalidValue("zero-length frame".to_string());
        assert_eq!(invalid.to_string(), "Invalid value: zero-length frame");

        let buffer_err = Error::BufferTooSmall { required: 12, available: 4 };
        assert_eq!(buffer_err.to_string(), "Buffer too small: need 12 but have 4");

        let too_big = Error::PayloadTooBig { size: 2000, limit: 1500 };
        assert!(too_big.to_string().contains("2000"));

        let io_err = Error::from(io::Error::new(io::ErrorKind::NotFound, "no route"));
        assert!(io_err.to_string().contains("no route"));
    }
}
