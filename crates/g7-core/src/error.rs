//! Error types for g7-core.
//!
//! Decode failures on incoming payloads are not surfaced through this type:
//! the session layer drops the payload and logs it. [`Error`] covers
//! transport, configuration and persistence failures, plus the typed
//! calibration error for callers that need a reliable glucose value.
//!
//! | Error Type | Reported to | Recovery |
//! |------------|-------------|----------|
//! | [`Error::ConnectionFailed`] | connection delegate | delayed rescan when stay-connected |
//! | [`Error::Disconnected`] | connection delegate | delayed rescan when stay-connected |
//! | [`Error::NotConnected`] | caller | wait for the next connection |
//! | [`Error::ManagerClosed`] | caller | recreate the manager |
//! | [`Error::Config`] | caller | fix configuration and restart |

use thiserror::Error;

/// Errors that can occur while managing a sensor connection.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Transport-level failure not originating from btleplug.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No Bluetooth adapter is available.
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    /// Operation attempted while not connected to a sensor.
    #[error("Not connected to sensor")]
    NotConnected,

    /// Connection attempt failed.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The peripheral that failed to connect.
        device_id: Option<String>,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// The link dropped unexpectedly.
    #[error("Disconnected: {reason}")]
    Disconnected {
        /// The peripheral that disconnected.
        device_id: Option<String>,
        /// Why the link dropped.
        reason: DisconnectReason,
    },

    /// Required BLE characteristic not found on the peripheral.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// The connection manager task has stopped.
    #[error("Connection manager is no longer running")]
    ManagerClosed,

    /// Failed to decode a payload.
    #[error(transparent)]
    Parse(#[from] g7_types::ParseError),

    /// The latest reading is not reliable.
    #[error(transparent)]
    Calibration(#[from] g7_types::CalibrationError),

    /// The configuration failed to load or validate.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize persisted state.
    #[error("Persistence error: {0}")]
    Persistence(#[from] serde_json::Error),
}

/// Structured reasons for connection failures.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// The peripheral is no longer known to the platform.
    PeripheralUnavailable,
    /// Connection attempt timed out in the platform stack.
    Timeout,
    /// Service discovery or notification setup failed.
    ConfigurationFailed(String),
    /// Generic BLE error.
    BleError(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeripheralUnavailable => write!(f, "peripheral unavailable"),
            Self::Timeout => write!(f, "connection timed out"),
            Self::ConfigurationFailed(msg) => write!(f, "configuration failed: {}", msg),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
        }
    }
}

/// Reason for a dropped link.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// The sensor closed the link. G7 sensors do this after every exchange.
    PeripheralDisconnected,
    /// This side cancelled the connection.
    UserRequested,
    /// Supervision timeout or out of range.
    LinkLost,
    /// Platform BLE error.
    BleError(String),
}

impl DisconnectReason {
    /// Benign disconnects are not reported as errors.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::PeripheralDisconnected | Self::UserRequested)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeripheralDisconnected => write!(f, "peripheral disconnected"),
            Self::UserRequested => write!(f, "user requested"),
            Self::LinkLost => write!(f, "link lost"),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
        }
    }
}

impl Error {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>, service_count: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.into(),
            service_count,
        }
    }

    /// Create a connection failure with structured reason.
    pub fn connection_failed(device_id: Option<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed { device_id, reason }
    }

    /// Create an unexpected disconnect error.
    pub fn disconnected(device_id: Option<String>, reason: DisconnectReason) -> Self {
        Self::Disconnected { device_id, reason }
    }
}

/// Result type alias using g7-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::NotConnected.to_string(), "Not connected to sensor");

        let err = Error::characteristic_not_found("f8083534", 3);
        assert!(err.to_string().contains("f8083534"));
        assert!(err.to_string().contains("3 services"));

        let err = Error::connection_failed(
            Some("DXCM12".to_string()),
            ConnectionFailureReason::Timeout,
        );
        assert_eq!(err.to_string(), "Connection failed: connection timed out");

        let err = Error::disconnected(None, DisconnectReason::LinkLost);
        assert_eq!(err.to_string(), "Disconnected: link lost");
    }

    #[test]
    fn test_benign_disconnects() {
        assert!(DisconnectReason::PeripheralDisconnected.is_benign());
        assert!(DisconnectReason::UserRequested.is_benign());
        assert!(!DisconnectReason::LinkLost.is_benign());
        assert!(!DisconnectReason::BleError("x".into()).is_benign());
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: Error = g7_types::ParseError::UnknownOpcode(0x10).into();
        assert!(matches!(err, Error::Parse(_)));
        assert_eq!(err.to_string(), "Unknown opcode: 0x10");
    }

    #[test]
    fn test_calibration_error_conversion() {
        let state = g7_types::AlgorithmState::from(2);
        let err: Error = state.ensure_reliable().unwrap_err().into();
        assert!(err.to_string().contains("warming up"));
    }

    #[test]
    fn test_btleplug_error_conversion() {
        let err: Error = btleplug::Error::DeviceNotFound.into();
        assert!(matches!(err, Error::Bluetooth(_)));
    }
}
