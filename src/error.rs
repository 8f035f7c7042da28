use thiserror::Error;

/// Errors that can occur when working with Ergomotion beds
#[derive(Error, Debug)]
pub enum ErgoError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found during scanning
    #[error("Ergomotion bed not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// Link operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Protocol error (missing service, characteristic, malformed UUID)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Command name not present in the command table
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Attribute name not supported by the bed
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),

    /// Target value does not fit the attribute it was written to
    #[error("Invalid target for {attribute}: {reason}")]
    InvalidTarget {
        /// Attribute name
        attribute: String,
        /// Why the value was rejected
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for Ergomotion operations
pub type Result<T> = std::result::Result<T, ErgoError>;

impl ErgoError {
    /// Check if this error is a transient link failure
    ///
    /// Transient failures are logged and retried on the session's cooldown
    /// cadence; they never reach callers of the attribute surface.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound
                | Self::Timeout { .. }
                | Self::Io(_)
        )
    }

    /// Check if this error is a programming contract violation
    #[must_use]
    pub const fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownCommand(_) | Self::UnknownAttribute(_) | Self::InvalidTarget { .. }
        )
    }

    pub(crate) fn invalid_target(attribute: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            attribute: attribute.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = ErgoError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_transient());
        assert!(!connection_error.is_contract_violation());

        let timeout_error = ErgoError::Timeout { timeout_ms: 5000 };
        assert!(timeout_error.is_transient());

        let unknown = ErgoError::UnknownCommand("wiggle".to_string());
        assert!(!unknown.is_transient());
        assert!(unknown.is_contract_violation());

        let protocol = ErgoError::Protocol("service missing".to_string());
        assert!(!protocol.is_transient());
        assert!(!protocol.is_contract_violation());
    }

    #[test]
    fn test_error_display() {
        let error = ErgoError::invalid_target("led", "expected on/off");
        let error_string = format!("{error}");
        assert!(error_string.contains("Invalid target for led"));
        assert!(error_string.contains("expected on/off"));
    }
}
