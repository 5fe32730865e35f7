//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame header declared a payload size outside `(0, MAX_PAYLOAD_SIZE]`
    #[error("Invalid payload size: {size} bytes (must be 1..={max})")]
    InvalidPayloadSize { size: u32, max: usize },

    /// Payload handed to a frame or a USB buffer does not fit
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Inbound frame carried no command header byte
    #[error("Empty command: frame payload has no header byte")]
    EmptyCommand,

    /// Non-transient I/O error on the stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::InvalidPayloadSize { size: 0, max: 512 };
        let msg = format!("{}", err);
        assert!(msg.contains("Invalid payload size"));
        assert!(msg.contains("1..=512"));
    }

    #[test]
    fn test_payload_too_large_error() {
        let err = ProtocolError::PayloadTooLarge { size: 600, max: 512 };
        let msg = format!("{}", err);
        assert!(msg.contains("Payload too large"));
        assert!(msg.contains("600"));
    }
}
