//! Error types shared by drivers and the property layer.
//!
//! Drivers use `anyhow::Result` at their capability seams and convert into
//! [`AstroError`] where a caller needs to branch on the failure class:
//!
//! - **Precondition**: request arrived while busy, parked or disconnected.
//!   Rejected before any hardware I/O.
//! - **Hardware / Timeout / Io**: the device misbehaved. The wire layer retries
//!   transient cases itself; what reaches this type has already exhausted retries.
//! - **RegistryFull**: hot-plug capacity exhausted. Logged, device ignored.
//! - **LockHeld**: another process (or endpoint) owns the device.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Initialization,
    Configuration,
    Communication,
    Shutdown,
    Hardware,
    Timeout,
    InvalidParameter,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Shutdown => "shutdown",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
        };
        write!(f, "{}", label)
    }
}

#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    pub driver_type: String,
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Convenience alias for results using [`AstroError`].
pub type AppResult<T> = std::result::Result<T, AstroError>;

/// Primary error type of the property and connection layers.
#[derive(Error, Debug)]
pub enum AstroError {
    /// The property is not defined on the endpoint.
    #[error("Unknown property {device}.{name}")]
    UnknownProperty { device: String, name: String },

    /// The property exists but has no item with this name, or the item has
    /// a different kind than the update.
    #[error("Property {property} has no {kind} item '{item}'")]
    UnknownItem {
        property: String,
        item: String,
        kind: &'static str,
    },

    /// A property with the same name is already defined on the endpoint.
    #[error("Property {device}.{name} is already defined")]
    AlreadyDefined { device: String, name: String },

    /// Operation requires a connected endpoint.
    #[error("{0} is not connected")]
    NotConnected(String),

    /// Request rejected because of the current device state (busy, parked, ...).
    ///
    /// No hardware I/O has been attempted when this is returned.
    #[error("{0}")]
    Precondition(String),

    /// Device reported an error or answered with nonsense after retries.
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Device did not answer in time after retries.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Standard I/O failure (lock files, sockets, serial devices).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Semantically invalid configuration.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Hot-plug registry is full; the new device was ignored.
    #[error("Device registry full ({capacity} endpoints)")]
    RegistryFull { capacity: usize },

    /// Another owner holds the advisory lock for this device.
    #[error("Device {0} is locked by another owner")]
    LockHeld(String),

    /// Structured driver error with category
    #[error("{0}")]
    Driver(DriverError),
}

impl From<DriverError> for AstroError {
    fn from(err: DriverError) -> Self {
        AstroError::Driver(err)
    }
}
