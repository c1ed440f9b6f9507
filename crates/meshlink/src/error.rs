//! Error types for radio link operations
//!
//! A single error enum covers transport establishment, framing, socket I/O,
//! and both firmware-update protocols. Callers decide on retries using
//! [`LinkError::is_retriable`]; this crate never retries on its own.

use thiserror::Error;

/// Main error type for link and OTA operations
#[derive(Error, Debug)]
pub enum LinkError {
    // ===== Transport Establishment Errors =====
    /// Discovery could not be started or failed mid-session
    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    /// Connecting to the device failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection timeout
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Manual connection string could not be parsed
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// Device is not known to the transport
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    // ===== Framing / Protocol Errors =====
    /// Payload cannot be represented by the 16-bit length prefix
    #[error("Payload too large: {size} bytes exceeds frame maximum of {max} bytes")]
    PayloadTooLarge {
        /// Actual payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Payload bytes did not parse as an application message
    #[error("Message decode error: {0}")]
    Decode(String),

    /// Message could not be serialized
    #[error("Message encode error: {0}")]
    Encode(String),

    // ===== Connection Lifecycle Errors =====
    /// The link was dropped by the peer or the socket failed
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// The consumer of the event stream went away
    #[error("Event stream cancelled")]
    EventStreamCancelled,

    /// Operation requires an established connection
    #[error("Not connected")]
    NotConnected,

    // ===== Bluetooth Errors =====
    /// Bluetooth adapter is off or unavailable
    #[error("Bluetooth unavailable: {0}")]
    BluetoothUnavailable(String),

    /// Scan finished without finding a matching device
    #[error("Scan timed out after {duration_ms}ms")]
    ScanTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Required GATT service is missing
    #[error("Service missing: {0}")]
    ServiceMissing(String),

    /// Required GATT characteristic is missing
    #[error("Characteristic missing: {0}")]
    CharacteristicMissing(String),

    /// A second operation of the same kind was started before the first resolved
    #[error("Operation already in progress: {0}")]
    OperationInProgress(&'static str),

    /// Platform Bluetooth stack error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),

    // ===== OTA Errors =====
    /// Device reported an error during the update
    #[error("Device reported an error")]
    DeviceReportedError,

    /// Device did not answer the invitation in time
    #[error("Device failed to respond in time ({duration_ms}ms)")]
    HandshakeTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Device asked for authentication but no password is configured
    #[error("Device requires authentication but no password was provided")]
    AuthenticationRequired,

    /// An OTA session is already running on this updater
    #[error("An update is already in progress")]
    UpdateInProgress,

    /// Cancellation refused because bytes are in flight
    #[error("Cannot cancel while the transfer is in flight")]
    TransferInFlight,

    /// Update was cancelled by the user
    #[error("Update cancelled")]
    Cancelled,

    /// Firmware image is unusable
    #[error("Invalid firmware image: {0}")]
    InvalidFirmware(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// A bounded wait elapsed
    #[error("Operation timed out")]
    Timeout,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Check if the orchestrator may retry after this error
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LinkError::ConnectionTimeout { .. }
                | LinkError::ConnectionFailed(_)
                | LinkError::Disconnected(_)
                | LinkError::ScanTimeout { .. }
                | LinkError::Decode(_)
                | LinkError::Timeout
                | LinkError::Io(_)
        )
    }

    /// Check if this is a protocol error (bad data from device)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            LinkError::Decode(_) | LinkError::PayloadTooLarge { .. } | LinkError::DeviceReportedError
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            LinkError::DiscoveryFailed(_) => "DISCOVERY_FAILED",
            LinkError::ConnectionFailed(_) => "CONNECTION_FAILED",
            LinkError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            LinkError::InvalidConnectionString(_) => "INVALID_CONNECTION_STRING",
            LinkError::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            LinkError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            LinkError::Decode(_) => "DECODE",
            LinkError::Encode(_) => "ENCODE",
            LinkError::Disconnected(_) => "DISCONNECTED",
            LinkError::EventStreamCancelled => "EVENT_STREAM_CANCELLED",
            LinkError::NotConnected => "NOT_CONNECTED",
            LinkError::BluetoothUnavailable(_) => "BLUETOOTH_UNAVAILABLE",
            LinkError::ScanTimeout { .. } => "SCAN_TIMEOUT",
            LinkError::ServiceMissing(_) => "SERVICE_MISSING",
            LinkError::CharacteristicMissing(_) => "CHARACTERISTIC_MISSING",
            LinkError::OperationInProgress(_) => "OPERATION_IN_PROGRESS",
            LinkError::Bluetooth(_) => "BLUETOOTH",
            LinkError::DeviceReportedError => "DEVICE_REPORTED_ERROR",
            LinkError::HandshakeTimeout { .. } => "HANDSHAKE_TIMEOUT",
            LinkError::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            LinkError::UpdateInProgress => "UPDATE_IN_PROGRESS",
            LinkError::TransferInFlight => "TRANSFER_IN_FLIGHT",
            LinkError::Cancelled => "CANCELLED",
            LinkError::InvalidFirmware(_) => "INVALID_FIRMWARE",
            LinkError::InvalidConfig(_) => "INVALID_CONFIG",
            LinkError::ChannelClosed => "CHANNEL_CLOSED",
            LinkError::Timeout => "TIMEOUT",
            LinkError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

// Conversion from prost decode error
impl From<prost::DecodeError> for LinkError {
    fn from(err: prost::DecodeError) -> Self {
        LinkError::Decode(err.to_string())
    }
}

// Conversion from prost encode error
impl From<prost::EncodeError> for LinkError {
    fn from(err: prost::EncodeError) -> Self {
        LinkError::Encode(err.to_string())
    }
}

// Conversion from tokio mpsc send error
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for LinkError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        LinkError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for LinkError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        LinkError::ChannelClosed
    }
}

impl From<tokio::time::error::Elapsed> for LinkError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        LinkError::Timeout
    }
}

#[cfg(feature = "ble")]
impl From<btleplug::Error> for LinkError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => {
                LinkError::BluetoothUnavailable("permission denied".to_string())
            }
            btleplug::Error::DeviceNotFound => LinkError::DeviceNotFound(err.to_string()),
            btleplug::Error::NotConnected => LinkError::NotConnected,
            btleplug::Error::TimedOut(duration) => LinkError::ConnectionTimeout {
                duration_ms: duration.as_millis() as u64,
            },
            other => LinkError::Bluetooth(other.to_string()),
        }
    }
}

#[cfg(feature = "tcp")]
impl From<mdns_sd::Error> for LinkError {
    fn from(err: mdns_sd::Error) -> Self {
        LinkError::DiscoveryFailed(err.to_string())
    }
}
