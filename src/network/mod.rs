//! Network interface abstraction.
//!
//! The provisioning core only ever talks to the network through the
//! [`NetworkInterface`] trait, which works on:
//! - **ESP32** (`esp32` feature): ESP-IDF station WiFi
//! - **Host**: a simulated set of access points for development
//!
//! It also hosts the SNTP connectivity probe run after a successful join.
//!
//! # Example
//!
//! ```
//! use ble_wifi_provisioner::network::{AuthMode, ConnectionStatus, HostNetwork, NetworkInterface};
//!
//! let network = HostNetwork::with_networks([("HomeNet", "")]);
//! network.connect(b"HomeNet", b"", AuthMode::Open).unwrap();
//! assert_eq!(network.connection_status(), ConnectionStatus::Up);
//! ```

use log::{info, warn};
use std::fmt;
use std::net::Ipv4Addr;

mod host;
mod time_probe;
#[cfg(feature = "esp32")]
mod wifi;

pub use host::HostNetwork;
pub use time_probe::{NtpProbe, ProbeError, TimeProbe};
#[cfg(feature = "esp32")]
pub use wifi::EspWifiNetwork;

/// Connection state as reported by the interface itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not associated with any access point.
    Idle,
    /// Association or DHCP in progress.
    Connecting,
    /// Associated and holding an IP address.
    Up,
}

/// Authentication used for a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Open network, no passphrase.
    Open,
    /// WPA/WPA2 personal.
    WpaWpa2,
}

/// Security advertised by a scanned access point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    None,
    Wep,
    Wpa,
    Wpa2,
    WpaWpa2,
    Wpa3,
    Unknown,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::Wep => "WEP",
            Self::Wpa => "WPA",
            Self::Wpa2 => "WPA2",
            Self::WpaWpa2 => "WPA/WPA2",
            Self::Wpa3 => "WPA3",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// One access point found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String,
    pub bssid: [u8; 6],
    pub security: SecurityMode,
    /// Signal strength in dBm.
    pub rssi: i8,
    pub channel: u8,
}

impl fmt::Display for AccessPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Network: {} secured: {} BSSID: {} RSSI: {} Ch: {}",
            self.ssid,
            self.security,
            format_mac(&self.bssid),
            self.rssi,
            self.channel
        )
    }
}

/// Addressing details of an established link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub mac: [u8; 6],
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    /// Signal strength of the associated AP in dBm, if known.
    pub rssi: Option<i8>,
}

impl fmt::Display for LinkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MAC: {} IP: {} Netmask: {} Gateway: {}",
            format_mac(&self.mac),
            self.ip,
            self.netmask,
            self.gateway
        )?;
        if let Some(rssi) = self.rssi {
            write!(f, " RSSI: {}", rssi)?;
        }
        Ok(())
    }
}

/// Format a MAC address as colon-separated hex.
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Convert a CIDR prefix length into a dotted netmask.
pub fn prefix_to_netmask(prefix: u8) -> Ipv4Addr {
    let bits = match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    };
    Ipv4Addr::from(bits)
}

/// Network interface collaborator.
///
/// All methods take `&self`: `connect` may block for seconds on the join
/// worker while the control channel concurrently queries status or requests
/// a disconnect, so implementations synchronize internally.
pub trait NetworkInterface: Send + Sync {
    /// Join an access point. Blocks until associated with an IP or failed.
    fn connect(&self, ssid: &[u8], password: &[u8], auth: AuthMode) -> Result<(), NetworkError>;

    /// Leave the current access point. Not an error when already idle.
    fn disconnect(&self) -> Result<(), NetworkError>;

    /// Current connection state.
    fn connection_status(&self) -> ConnectionStatus;

    /// Scan for access points, returning at most `limit` results.
    fn scan(&self, limit: usize) -> Result<Vec<AccessPoint>, NetworkError>;

    /// Addressing details, `None` when not connected.
    fn link_info(&self) -> Option<LinkInfo>;
}

/// Scan for access points and log each one.
///
/// Scan failures are logged and reported as zero networks.
pub fn log_scan_results(network: &dyn NetworkInterface, limit: usize) -> usize {
    info!("Scan:");
    match network.scan(limit) {
        Ok(access_points) => {
            for ap in &access_points {
                info!("{}", ap);
            }
            info!("{} Networks available.", access_points.len());
            access_points.len()
        }
        Err(e) => {
            warn!("Scan failed: {}", e);
            0
        }
    }
}

/// Network errors.
#[derive(Debug)]
pub enum NetworkError {
    /// SSID is not valid for the driver (length or encoding).
    InvalidSsid,
    /// Password is not valid for the driver.
    InvalidPassword,
    /// Join attempt failed with a driver-specific code.
    JoinFailed { code: i32 },
    /// Interface could not be brought up.
    Unavailable(String),
    /// Generic I/O error.
    Io(std::io::Error),
}

impl NetworkError {
    /// Driver error code, when one exists.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::JoinFailed { code } => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSsid => write!(f, "invalid SSID"),
            Self::InvalidPassword => write!(f, "invalid password"),
            Self::JoinFailed { code } => write!(f, "join failed with code {}", code),
            Self::Unavailable(reason) => write!(f, "network unavailable: {}", reason),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(feature = "esp32")]
impl From<esp_idf_sys::EspError> for NetworkError {
    fn from(e: esp_idf_sys::EspError) -> Self {
        Self::JoinFailed { code: e.code() }
    }
}
