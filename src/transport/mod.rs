//! Control-channel transports.
//!
//! A transport carries the attribute table to and from a remote
//! configurator. It turns remote writes and link drops into
//! [`ControlEvent`](crate::provisioning::ControlEvent)s on the dispatcher's
//! queue, and implements [`ControlChannel`] for the two things the core
//! asks of it: becoming discoverable and pushing status changes.
//!
//! # Components
//!
//! - [`console`] - stdin-driven channel for host development
//! - [`ble`] - NimBLE GATT service (ESP32 only)

use std::fmt;

pub mod console;

#[cfg(feature = "esp32")]
mod ble;

#[cfg(feature = "esp32")]
pub use ble::NimbleControlChannel;
pub use console::ConsoleChannel;

/// Transport collaborator used by the status synchronizer.
pub trait ControlChannel: Send {
    /// Start (or resume) advertising so a configurator can connect.
    fn start_discoverable(&self) -> Result<(), TransportError>;

    /// Push a changed status value to subscribed remote readers.
    fn notify_status(&self, connected: bool) -> Result<(), TransportError>;
}

/// Transport errors.
#[derive(Debug)]
pub enum TransportError {
    /// BLE stack reported an error.
    Ble(String),
    /// Advertising could not be configured or started.
    Advertising(String),
    /// Generic I/O error.
    Io(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ble(e) => write!(f, "BLE error: {}", e),
            Self::Advertising(e) => write!(f, "advertising failed: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
