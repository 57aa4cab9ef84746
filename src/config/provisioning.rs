//! Provisioning configuration.
//!
//! Fixed attribute limits and GATT identifiers, plus the runtime settings
//! of the provisioner. Everything here is platform-independent and can be
//! tested on the host machine.
//!
//! # Example
//!
//! ```
//! use ble_wifi_provisioner::config::ProvisionerConfig;
//!
//! let config = ProvisionerConfig::default();
//! assert!(config.validate().is_ok());
//! assert_eq!(config.device_name, "CONNECT-TO-WIFI");
//! ```

use std::fmt;
use std::time::Duration;

/// Maximum SSID length per IEEE 802.11 standard.
pub const MAX_SSID_LEN: usize = 32;

/// Maximum password length for WPA2 (64 hex digits or 63 ASCII chars).
pub const MAX_PASSWORD_LEN: usize = 64;

/// The status attribute is a single boolean byte.
pub const STATUS_LEN: usize = 1;

/// Depth of the control-channel event queue.
pub const EVENT_QUEUE_DEPTH: usize = 16;

/// Longest device name that still fits a legacy advertising packet
/// next to the flags field (31 - 3 bytes flags - 2 bytes AD header).
pub const MAX_DEVICE_NAME_LEN: usize = 26;

/// Advertised name when nothing else is configured.
pub const DEFAULT_DEVICE_NAME: &str = "CONNECT-TO-WIFI";

/// Default SNTP server used by the connectivity probe.
pub const DEFAULT_NTP_SERVER: &str = "pool.ntp.org:123";

/// Default delay between two connectivity probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of access points reported by the start-up scan.
pub const DEFAULT_SCAN_LIMIT: usize = 15;

/// Default port for the stats endpoint.
pub const DEFAULT_STATS_PORT: u16 = 8080;

/// GATT service UUID for WiFi provisioning.
pub const SERVICE_UUID: &str = "21c04d09-c884-4af1-96a9-52e4e4ba195b";

/// GATT characteristic UUID for the SSID attribute.
pub const SSID_CHAR_UUID: &str = "1e500043-6b31-4a3d-b91e-025f92ca9763";

/// GATT characteristic UUID for the password attribute.
pub const PASSWORD_CHAR_UUID: &str = "1e500043-6b31-4a3d-b91e-025f92ca9764";

/// GATT characteristic UUID for the connection status attribute.
pub const STATUS_CHAR_UUID: &str = "1e500043-6b31-4a3d-b91e-025f92ca9765";

/// Runtime settings of the provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionerConfig {
    /// Name used in BLE advertisements.
    pub device_name: String,
    /// SNTP server (`host:port`) for the post-join connectivity probe.
    pub ntp_server: String,
    /// Delay between two connectivity probes.
    pub probe_interval: Duration,
    /// Maximum number of access points logged by the start-up scan.
    pub scan_limit: usize,
    /// Port for the stats endpoint, `None` to disable it.
    pub stats_port: Option<u16>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            ntp_server: DEFAULT_NTP_SERVER.to_string(),
            probe_interval: DEFAULT_PROBE_INTERVAL,
            scan_limit: DEFAULT_SCAN_LIMIT,
            stats_port: Some(DEFAULT_STATS_PORT),
        }
    }
}

impl ProvisionerConfig {
    /// Build a configuration from `PROVISION_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Separated from [`from_env`](Self::from_env) so that parsing can be
    /// tested without touching the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("PROVISION_DEVICE_NAME") {
            config.device_name = name;
        }
        if let Some(server) = lookup("PROVISION_NTP_SERVER") {
            config.ntp_server = server;
        }
        if let Some(secs) = lookup("PROVISION_PROBE_INTERVAL_SECS") {
            let secs = parse_number::<u64>("PROVISION_PROBE_INTERVAL_SECS", &secs)?;
            config.probe_interval = Duration::from_secs(secs);
        }
        if let Some(limit) = lookup("PROVISION_SCAN_LIMIT") {
            config.scan_limit = parse_number("PROVISION_SCAN_LIMIT", &limit)?;
        }
        if let Some(port) = lookup("PROVISION_STATS_PORT") {
            config.stats_port = match port.trim().to_lowercase().as_str() {
                "off" | "none" | "" => None,
                other => Some(parse_number("PROVISION_STATS_PORT", other)?),
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.is_empty() {
            return Err(ConfigError::DeviceNameEmpty);
        }
        if self.device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(ConfigError::DeviceNameTooLong {
                len: self.device_name.len(),
                max: MAX_DEVICE_NAME_LEN,
            });
        }
        if self.ntp_server.is_empty() {
            return Err(ConfigError::NtpServerEmpty);
        }
        if self.probe_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "probe_interval",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}

/// Errors that can occur while building the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Advertised device name is empty.
    DeviceNameEmpty,
    /// Advertised device name does not fit an advertising packet.
    DeviceNameTooLong { len: usize, max: usize },
    /// No SNTP server configured.
    NtpServerEmpty,
    /// A setting could not be parsed.
    InvalidValue { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceNameEmpty => write!(f, "device name cannot be empty"),
            Self::DeviceNameTooLong { len, max } => {
                write!(f, "device name too long: {} bytes (max {})", len, max)
            }
            Self::NtpServerEmpty => write!(f, "NTP server cannot be empty"),
            Self::InvalidValue { key, value } => {
                write!(f, "invalid value for {}: {:?}", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
