//! # Error Types Module
//!
//! Centralized error handling for the stimulator session core.
//! Provides custom error types for each layer with proper context and error chaining.
//!
//! ## Error Types
//! - `ConnectionError`: session thread, runtime and handle failures
//! - `ConfigError`: configuration file I/O and parsing errors
//! - `TransportError`: failures reported by the BLE transport
//! - `DecodeError`: malformed notification payloads
//! - `SessionError`: conditions the session surfaces to the presentation layer
//!
//! ## Usage Examples
//! ```rust,ignore
//! // Config module uses ConfigError
//! pub fn load() -> Result<Config, ConfigError> { ... }
//!
//! // Transport implementations use TransportError
//! async fn write(&self, handle: &DeviceHandle, bytes: &[u8]) -> Result<(), TransportError>;
//!
//! // The protocol codec uses DecodeError
//! pub fn decode(frame: &[u8]) -> Result<Notification, DecodeError> { ... }
//! ```
//!
//! None of these terminate the process. The session resolves every failure
//! into a state transition or a reported `SessionError`.

use std::fmt;

/// Errors that can occur while hosting the session
#[derive(Debug)]
pub enum ConnectionError {
    /// Failed to create Tokio runtime
    RuntimeCreation(String),
    /// The session loop has gone away and no longer accepts intents
    ChannelClosed,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::RuntimeCreation(msg) => {
                write!(f, "Failed to create async runtime: {}", msg)
            }
            ConnectionError::ChannelClosed => {
                write!(f, "Session is no longer running")
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(std::io::Error),
    /// Failed to write config file
    WriteFailed(std::io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
    /// A configured UUID is not valid
    InvalidUuid { field: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
            ConfigError::InvalidUuid { field, value } => {
                write!(f, "Invalid UUID for {}: {}", field, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
            ConfigError::InvalidUuid { .. } => None,
        }
    }
}

/// Errors reported by a BLE transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The OS refused Bluetooth access
    PermissionDenied,
    /// Bluetooth adapter not found or not available
    NoAdapter,
    /// Bluetooth manager initialization failed
    ManagerInit(String),
    /// The peripheral is unknown to the adapter
    DeviceNotFound,
    /// The link is down or the handle is no longer valid
    NotConnected,
    /// A required GATT characteristic is missing after discovery
    MissingCharacteristic(uuid::Uuid),
    /// The operation did not complete in time
    Timeout,
    /// Any other stack failure
    Ble(String),
}

impl TransportError {
    /// Whether this failure means the link itself should be considered lost.
    pub fn is_link_loss(&self) -> bool {
        matches!(
            self,
            TransportError::NotConnected | TransportError::DeviceNotFound | TransportError::Timeout
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::PermissionDenied => {
                write!(f, "Bluetooth permission denied")
            }
            TransportError::NoAdapter => {
                write!(f, "No Bluetooth adapter found. Please ensure Bluetooth is enabled.")
            }
            TransportError::ManagerInit(msg) => {
                write!(f, "Failed to initialize Bluetooth manager: {}", msg)
            }
            TransportError::DeviceNotFound => {
                write!(f, "Device not found")
            }
            TransportError::NotConnected => {
                write!(f, "Device is not connected")
            }
            TransportError::MissingCharacteristic(uuid) => {
                write!(f, "Characteristic {} not found on device", uuid)
            }
            TransportError::Timeout => {
                write!(f, "Bluetooth operation timed out")
            }
            TransportError::Ble(msg) => {
                write!(f, "Bluetooth error: {}", msg)
            }
        }
    }
}

impl std::error::Error for TransportError {}

impl From<btleplug::Error> for TransportError {
    fn from(error: btleplug::Error) -> Self {
        match error {
            btleplug::Error::PermissionDenied => TransportError::PermissionDenied,
            btleplug::Error::DeviceNotFound => TransportError::DeviceNotFound,
            btleplug::Error::NotConnected => TransportError::NotConnected,
            btleplug::Error::TimedOut(_) => TransportError::Timeout,
            other => TransportError::Ble(other.to_string()),
        }
    }
}

/// Errors that can occur while decoding a notification frame
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// `Batt:` frame whose value is not a finite number
    InvalidVoltage(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidVoltage(raw) => {
                write!(f, "Invalid battery voltage in notification: {:?}", raw)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Conditions surfaced by the session to the presentation layer.
///
/// These are reports, not crashes: each one has already been resolved into
/// a state transition by the time it is published.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Bluetooth access was refused; the user has to act, the core will not retry
    PermissionDenied,
    /// No matching device advertised within the scan window
    ScanTimeout,
    /// The scan could not be started
    ScanFailed(TransportError),
    /// Connecting or service discovery failed
    ConnectFailure { device: String, reason: TransportError },
    /// A command write failed without taking the link down
    WriteFailure { command: String, reason: TransportError },
    /// A notification could not be decoded; telemetry is unchanged
    DecodeFailure(DecodeError),
    /// Status polling gave up after the configured number of failures
    PollExhausted { attempts: u32 },
    /// The requested operation needs a connected device
    NotConnected,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::PermissionDenied => {
                write!(f, "Bluetooth permission denied; grant access and scan again")
            }
            SessionError::ScanTimeout => {
                write!(f, "No stimulator found. Make sure it is switched on and nearby.")
            }
            SessionError::ScanFailed(e) => {
                write!(f, "Scan operation failed: {}", e)
            }
            SessionError::ConnectFailure { device, reason } => {
                write!(f, "Failed to connect to device {}: {}", device, reason)
            }
            SessionError::WriteFailure { command, reason } => {
                write!(f, "Failed to send {}: {}", command, reason)
            }
            SessionError::DecodeFailure(e) => {
                write!(f, "{}", e)
            }
            SessionError::PollExhausted { attempts } => {
                write!(f, "Connection degraded: status polling stopped after {} failures", attempts)
            }
            SessionError::NotConnected => {
                write!(f, "No stimulator connected")
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::ScanFailed(e) => Some(e),
            SessionError::ConnectFailure { reason, .. } => Some(reason),
            SessionError::WriteFailure { reason, .. } => Some(reason),
            SessionError::DecodeFailure(e) => Some(e),
            _ => None,
        }
    }
}
