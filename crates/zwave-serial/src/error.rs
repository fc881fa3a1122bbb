//! Error types for controller driver operations
//!
//! This module provides error handling for the driver: transport failures,
//! frame-level protocol errors, job and intent outcomes, registry lookups,
//! and configuration problems.

use thiserror::Error;

/// Main error type for driver operations
#[derive(Error, Debug)]
pub enum DriverError {
    // ===== Transport Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// Serial read error
    #[error("Serial read error: {0}")]
    ReadError(String),

    /// Serial write error
    #[error("Serial write error: {0}")]
    WriteError(String),

    /// Transport is not open
    #[error("Transport disconnected")]
    Disconnected,

    // ===== Protocol Errors =====
    /// Inbound frame failed checksum validation
    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum {
        /// Checksum computed over the received bytes
        expected: u8,
        /// Checksum byte carried by the frame
        actual: u8,
    },

    /// Malformed length or control byte
    #[error("Framing error: {0}")]
    Framing(String),

    /// Payload does not fit in a single frame
    #[error("Payload too large: {size} bytes exceeds frame maximum of {max} bytes")]
    PayloadTooLarge {
        /// Actual payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    // ===== Job / Intent Errors =====
    /// Job was dropped after exhausting its transmissions
    #[error("Retry limit exhausted after {attempts} attempts for function 0x{function:02X}")]
    RetryExhausted {
        /// Function identifier of the dropped job
        function: u8,
        /// Transmissions made
        attempts: u32,
    },

    /// Intent deadline passed before a matching response arrived
    #[error("Intent expired for node {node_id}")]
    IntentExpired {
        /// Node the intent concerned
        node_id: u8,
    },

    // ===== Registry Errors =====
    /// Operation referenced an endpoint not present in the registry
    #[error("Unknown node: {0}")]
    UnknownNode(u8),

    /// Node identifier outside the assignable range
    #[error("Invalid node id: {0}")]
    InvalidNodeId(u8),

    /// Association group outside the tracked range
    #[error("Invalid association group {group} (groups 1-{max})")]
    InvalidGroup {
        /// Requested group
        group: u8,
        /// Highest tracked group
        max: u8,
    },

    // ===== Argument / Configuration Errors =====
    /// Operation arguments cannot be encoded
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Controller memory range outside the snapshot buffer
    #[error("Memory range {offset}+{len} outside snapshot of {size} bytes")]
    MemoryOutOfRange {
        /// Start offset
        offset: usize,
        /// Range length
        len: usize,
        /// Snapshot size
        size: usize,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// Engine is not running
    #[error("Protocol engine is not running")]
    EngineNotRunning,

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DriverError::Disconnected
                | DriverError::ReadError(_)
                | DriverError::WriteError(_)
                | DriverError::Io(_)
        )
    }

    /// Check if this is a transport failure that ends the current session
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            DriverError::PortNotFound(_)
                | DriverError::PortOpenFailed { .. }
                | DriverError::ReadError(_)
                | DriverError::WriteError(_)
                | DriverError::Disconnected
                | DriverError::Io(_)
        )
    }

    /// Check if this is a protocol error (bad data from the controller)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            DriverError::Checksum { .. } | DriverError::Framing(_)
        )
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            DriverError::PortNotFound(_) => "PORT_NOT_FOUND",
            DriverError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            DriverError::ReadError(_) => "READ_ERROR",
            DriverError::WriteError(_) => "WRITE_ERROR",
            DriverError::Disconnected => "DISCONNECTED",
            DriverError::Checksum { .. } => "CHECKSUM",
            DriverError::Framing(_) => "FRAMING",
            DriverError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            DriverError::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            DriverError::IntentExpired { .. } => "INTENT_EXPIRED",
            DriverError::UnknownNode(_) => "REGISTRY_MISS",
            DriverError::InvalidNodeId(_) => "INVALID_NODE_ID",
            DriverError::InvalidGroup { .. } => "INVALID_GROUP",
            DriverError::InvalidArgument(_) => "INVALID_ARGUMENT",
            DriverError::MemoryOutOfRange { .. } => "MEMORY_OUT_OF_RANGE",
            DriverError::InvalidConfig(_) => "INVALID_CONFIG",
            DriverError::EngineNotRunning => "ENGINE_NOT_RUNNING",
            DriverError::ChannelClosed => "CHANNEL_CLOSED",
            DriverError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for DriverError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => DriverError::PortNotFound(err.description),
            serialport::ErrorKind::Io(kind) => {
                DriverError::Io(std::io::Error::new(kind, err.description))
            }
            _ => DriverError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

impl<T> From<tokio::sync::watch::error::SendError<T>> for DriverError {
    fn from(_: tokio::sync::watch::error::SendError<T>) -> Self {
        DriverError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = DriverError::PortNotFound("/dev/ttyACM0".to_string());
        assert_eq!(err.error_code(), "PORT_NOT_FOUND");
        assert_eq!(DriverError::UnknownNode(9).error_code(), "REGISTRY_MISS");
    }

    #[test]
    fn test_is_retriable() {
        assert!(DriverError::Disconnected.is_retriable());
        assert!(DriverError::ReadError("eof".to_string()).is_retriable());
        assert!(!DriverError::Checksum {
            expected: 1,
            actual: 2
        }
        .is_retriable());
    }

    #[test]
    fn test_is_protocol_error() {
        assert!(DriverError::Framing("zero length".to_string()).is_protocol_error());
        assert!(!DriverError::Disconnected.is_protocol_error());
    }

    #[test]
    fn test_transport_classification() {
        assert!(DriverError::WriteError("broken pipe".to_string()).is_transport_error());
        assert!(!DriverError::UnknownNode(4).is_transport_error());
    }

    #[test]
    fn test_payload_too_large_message() {
        let err = DriverError::PayloadTooLarge {
            size: 300,
            max: 254,
        };
        assert!(err.to_string().contains("300"));
        assert!(err.to_string().contains("254"));
    }
}
