//! Protocol error types.

use thiserror::Error;

/// Errors that can occur when decoding or encoding vendor model frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame is too short to be valid.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Expected minimum length.
        expected: usize,
        /// Actual length received.
        actual: usize,
    },

    /// Payload exceeds the protocol limit.
    #[error("payload too long: maximum {max} bytes, got {actual}")]
    PayloadTooLong {
        /// Maximum allowed length.
        max: usize,
        /// Actual length.
        actual: usize,
    },

    /// Opcode bytes do not name a vendor model opcode.
    #[error("unknown opcode: {0:02X?}")]
    UnknownOpcode([u8; 3]),

    /// Get kind tag is not one of the known kinds.
    #[error("unknown get kind: 0x{0:02X}")]
    UnknownGetKind(u8),

    /// Unknown host bridge command code.
    #[error("unknown host command: 0x{0:02X}")]
    UnknownHostCommand(u8),

    /// Invalid data in frame.
    #[error("invalid frame data: {0}")]
    InvalidData(String),
}

impl ProtocolError {
    /// Create an invalid data error.
    pub fn invalid_data(message: impl Into<String>) -> Self {
        ProtocolError::InvalidData(message.into())
    }

    /// Check a buffer holds at least `expected` bytes.
    pub fn ensure_len(data: &[u8], expected: usize) -> Result<(), ProtocolError> {
        if data.len() < expected {
            return Err(ProtocolError::FrameTooShort {
                expected,
                actual: data.len(),
            });
        }
        Ok(())
    }
}
