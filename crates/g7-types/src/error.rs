//! Error types for protocol decoding and calibration state in g7-types.

use thiserror::Error;

use crate::algorithm::AlgorithmState;

/// Errors that can occur when decoding G7 protocol messages.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in g7-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The buffer is shorter than the fixed minimum for its message type.
    #[error("Insufficient bytes: message requires {expected} bytes, got {actual}")]
    InsufficientBytes {
        /// Minimum number of bytes for the message.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },

    /// The buffer starts with a different opcode than the one being decoded.
    #[error("Unexpected opcode: expected 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedOpcode {
        /// Opcode of the message being decoded.
        expected: u8,
        /// Opcode found in the buffer.
        actual: u8,
    },

    /// The opcode is not one this codec knows how to decode.
    #[error("Unknown opcode: 0x{0:02X}")]
    UnknownOpcode(u8),

    /// A field carried a value outside its valid range.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl ParseError {
    /// Create an invalid value error.
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::InvalidValue(message.into())
    }
}

/// Result type alias using g7-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// Raised by callers that need a trustworthy glucose value before proceeding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CalibrationError {
    /// The sensor reported a state in which glucose values are not reliable.
    #[error("Glucose data is unavailable: {}", .0.description())]
    UnreliableState(AlgorithmState),
}

impl CalibrationError {
    /// Human-readable reason derived from the offending state.
    pub fn failure_reason(&self) -> String {
        match self {
            Self::UnreliableState(state) => state.description(),
        }
    }

    /// The state that caused the error.
    pub fn state(&self) -> AlgorithmState {
        match self {
            Self::UnreliableState(state) => *state,
        }
    }
}
