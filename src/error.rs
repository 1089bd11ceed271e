use thiserror::Error;

/// Errors that can occur when working with fitness equipment
#[derive(Error, Debug)]
pub enum ErgError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Radio is powered off, unsupported or not authorized
    #[error("Bluetooth adapter unavailable: {reason}")]
    AdapterUnavailable {
        /// Adapter state that prevented the operation
        reason: String,
    },

    /// Scan or connect exceeded its bound
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// A required channel is absent after service discovery
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Command issued with no bound device
    #[error("Device not ready: {reason}")]
    NotReady {
        /// Reason why device is not ready
        reason: String,
    },

    /// Device acknowledged a command with a non-success result
    #[error("Command 0x{opcode:02X} rejected with result 0x{result:02X}")]
    CommandRejected {
        /// Echoed request opcode
        opcode: u8,
        /// Result code reported by the device
        result: u8,
    },

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// Message parsing failed
    #[error("Failed to parse message: {0}")]
    ParseError(String),

    /// The controller actor has shut down
    #[error("Controller has shut down")]
    ControllerClosed,
}

/// Result type for ergolink operations
pub type Result<T> = std::result::Result<T, ErgError>;

impl ErgError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::ProtocolMismatch(_)
                | Self::AdapterUnavailable { .. }
        )
    }

    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::NotReady { .. }
                | Self::CommandRejected { .. }
                | Self::InvalidParameters(_)
        )
    }

    pub(crate) fn not_ready(reason: impl Into<String>) -> Self {
        Self::NotReady {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = ErgError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_recoverable());

        let timeout_error = ErgError::Timeout { timeout_ms: 20_000 };
        assert!(!timeout_error.is_connection_error());
        assert!(timeout_error.is_recoverable());

        let mismatch = ErgError::ProtocolMismatch("no control point".to_string());
        assert!(mismatch.is_connection_error());
        assert!(!mismatch.is_recoverable());

        assert!(!ErgError::ControllerClosed.is_recoverable());
    }

    #[test]
    fn test_command_rejected_display_is_hex() {
        let error = ErgError::CommandRejected {
            opcode: 0x05,
            result: 0x03,
        };
        assert_eq!(
            error.to_string(),
            "Command 0x05 rejected with result 0x03"
        );
    }

    #[test]
    fn test_error_display() {
        let error = ErgError::not_ready("no control device bound");
        let error_string = format!("{error}");
        assert!(error_string.contains("Device not ready"));
        assert!(error_string.contains("no control device bound"));
    }
}
