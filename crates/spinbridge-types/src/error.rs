//! Error types for payload decoding in spinbridge-types.

use thiserror::Error;

/// Errors that can occur when decoding a GATT notification payload.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in spinbridge-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The payload is shorter than its flags say it should be.
    #[error("Insufficient bytes: requires {expected} bytes, got {actual}")]
    InsufficientBytes {
        /// Minimum length implied by the flags byte(s).
        expected: usize,
        /// Length actually received.
        actual: usize,
    },
}

impl ParseError {
    /// Shorthand for an [`InsufficientBytes`](ParseError::InsufficientBytes) error.
    pub fn insufficient(expected: usize, actual: usize) -> Self {
        Self::InsufficientBytes { expected, actual }
    }
}

/// Result type alias using spinbridge-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
