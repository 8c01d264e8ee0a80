//! Error types for spinbridge-core.
//!
//! Errors fall into the same buckets the bridge recovers from:
//!
//! | Error | Handling |
//! |-------|----------|
//! | [`Error::AdapterUnavailable`] | Fatal at startup, adapter recovery while running |
//! | [`Error::HostCommand`] | Step reported as failed, retried after the recovery delay |
//! | [`Error::ConnectionFailed`], [`Error::Timeout`], [`Error::Bluetooth`] | Device goes to `Disconnected`, reconnect timer armed |
//! | [`Error::CharacteristicNotFound`] | Characteristic skipped, remaining ones still subscribed |
//! | [`Error::Decode`] | Notification dropped, snapshot left unchanged |

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while driving the bridge.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// No usable host radio.
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(AdapterUnavailableReason),

    /// An external host command could not be run.
    #[error("Host command '{program}' failed: {reason}")]
    HostCommand {
        /// The program that was invoked.
        program: String,
        /// What went wrong.
        reason: String,
    },

    /// Connecting to a peripheral failed.
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed {
        /// Address of the peripheral.
        address: String,
        /// Platform-provided reason.
        reason: String,
    },

    /// A subscribed characteristic is not exposed by the peripheral.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
    },

    /// A notification payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] spinbridge_types::ParseError),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Why no host radio could be used.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AdapterUnavailableReason {
    /// The OS Bluetooth service is not active and could not be started.
    ServiceInactive { service: String },
    /// No radio matched the vendor signature and none reported up.
    NoAdapter,
    /// The resolved radio stayed down after the bring-up command.
    AdapterDown { index: u32 },
    /// The platform stack has no adapter bound at this index.
    NotBound { index: u32 },
}

impl std::fmt::Display for AdapterUnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServiceInactive { service } => {
                write!(f, "service '{}' is not active", service)
            }
            Self::NoAdapter => write!(f, "no Bluetooth adapter found"),
            Self::AdapterDown { index } => write!(f, "hci{} is down", index),
            Self::NotBound { index } => write!(f, "hci{} is not known to the BLE stack", index),
        }
    }
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a host command error.
    pub fn host_command(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HostCommand {
            program: program.into(),
            reason: reason.into(),
        }
    }

    /// Create a connection failure.
    pub fn connection_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>) -> Self {
        Self::CharacteristicNotFound { uuid: uuid.into() }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Result type alias using spinbridge-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::timeout("connect", Duration::from_secs(15));
        assert!(err.to_string().contains("connect"));
        assert!(err.to_string().contains("15s"));

        let err = Error::host_command("hciconfig", "not found");
        assert_eq!(
            err.to_string(),
            "Host command 'hciconfig' failed: not found"
        );

        let err = Error::connection_failed("b827eb950b90", "le-connection-abort-by-local");
        assert!(err.to_string().contains("b827eb950b90"));
    }

    #[test]
    fn test_adapter_unavailable_display() {
        let err = Error::AdapterUnavailable(AdapterUnavailableReason::ServiceInactive {
            service: "bluetooth".into(),
        });
        assert_eq!(
            err.to_string(),
            "Bluetooth adapter unavailable: service 'bluetooth' is not active"
        );

        let err = Error::AdapterUnavailable(AdapterUnavailableReason::AdapterDown { index: 1 });
        assert!(err.to_string().contains("hci1 is down"));
    }

    #[test]
    fn test_from_parse_error() {
        let err: Error = spinbridge_types::ParseError::insufficient(4, 2).into();
        assert!(matches!(err, Error::Decode(_)));
        assert!(err.to_string().contains("requires 4 bytes"));
    }
}
