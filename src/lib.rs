//! BLE WiFi provisioning firmware library.
//!
//! A device with no network configuration advertises a small attribute
//! table (SSID, password, status). A configurator writes credentials, the
//! device joins the access point in the background and reports the result
//! through the status attribute.
//!
//! Everything except the ESP-IDF adapters is platform-independent and can
//! be tested on the host machine without ESP32 hardware.

pub mod config;
pub mod network;
pub mod provisioning;
pub mod stats_server;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export commonly used items
pub use config::{ConfigError, ProvisionerConfig};
pub use network::{ConnectionStatus, NetworkError, NetworkInterface};
pub use provisioning::{
    event_queue, Attribute, AttributeStore, Collaborators, ControlEvent, Provisioner,
    StartupError,
};
pub use stats_server::{ProvisioningStats, StatsServer};
pub use transport::{ControlChannel, TransportError};
