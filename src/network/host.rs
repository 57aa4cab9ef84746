//! Host network provider.
//!
//! A development machine cannot join arbitrary access points, so this
//! provider simulates them: it is configured with a list of networks and
//! their passphrases and answers joins, scans and status queries as a WiFi
//! driver would. Joins take a configurable time so the blocking behavior of
//! the join worker is exercised for real.

use super::{
    prefix_to_netmask, AccessPoint, AuthMode, ConnectionStatus, LinkInfo, NetworkError,
    NetworkInterface, SecurityMode,
};
use log::{debug, info};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use zeroize::Zeroizing;

/// Join failure code: no access point with that SSID.
pub const JOIN_ERROR_NO_SSID: i32 = -1;

/// Join failure code: passphrase or auth mode rejected.
pub const JOIN_ERROR_AUTH: i32 = -2;

/// Default simulated association time.
const DEFAULT_JOIN_DELAY: Duration = Duration::from_millis(500);

/// Locally administered MAC reported by the simulated station.
const SIMULATED_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

struct SimulatedAccessPoint {
    ssid: String,
    password: Zeroizing<String>,
}

/// Host network provider backed by simulated access points.
pub struct HostNetwork {
    access_points: Vec<SimulatedAccessPoint>,
    join_delay: Duration,
    status: Mutex<ConnectionStatus>,
}

impl HostNetwork {
    /// Create a provider that knows the given `(ssid, password)` pairs.
    /// An empty password makes the network open.
    pub fn with_networks<I, S, P>(networks: I) -> Self
    where
        I: IntoIterator<Item = (S, P)>,
        S: Into<String>,
        P: Into<String>,
    {
        let access_points = networks
            .into_iter()
            .map(|(ssid, password)| SimulatedAccessPoint {
                ssid: ssid.into(),
                password: Zeroizing::new(password.into()),
            })
            .collect();
        Self {
            access_points,
            join_delay: Duration::ZERO,
            status: Mutex::new(ConnectionStatus::Idle),
        }
    }

    /// Parse networks from `ssid:password` entries separated by `;`.
    ///
    /// An entry without `:` is an open network.
    pub fn from_spec(spec: &str) -> Self {
        let networks = spec
            .split(';')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.split_once(':') {
                Some((ssid, password)) => (ssid.to_string(), password.to_string()),
                None => (entry.to_string(), String::new()),
            });
        Self::with_networks(networks).with_join_delay(DEFAULT_JOIN_DELAY)
    }

    /// Build from `PROVISION_SIM_NETWORKS`, or an empty world if unset.
    pub fn from_env() -> Self {
        let spec = std::env::var("PROVISION_SIM_NETWORKS").unwrap_or_default();
        Self::from_spec(&spec)
    }

    /// Set the simulated association time.
    pub fn with_join_delay(mut self, delay: Duration) -> Self {
        self.join_delay = delay;
        self
    }

    /// Drop the current association, as if the AP went away.
    pub fn simulate_link_loss(&self) {
        let mut status = self.lock_status();
        if *status != ConnectionStatus::Idle {
            info!("Simulated WiFi link lost");
            *status = ConnectionStatus::Idle;
        }
    }

    fn lock_status(&self) -> MutexGuard<'_, ConnectionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.lock_status() = status;
    }

    /// Check a join request against the simulated access points.
    fn authenticate(&self, ssid: &str, password: &[u8], auth: AuthMode) -> Result<(), NetworkError> {
        let ap = self
            .access_points
            .iter()
            .find(|ap| ap.ssid == ssid)
            .ok_or(NetworkError::JoinFailed {
                code: JOIN_ERROR_NO_SSID,
            })?;

        let accepted = match auth {
            AuthMode::Open => ap.password.is_empty(),
            AuthMode::WpaWpa2 => !ap.password.is_empty() && ap.password.as_bytes() == password,
        };
        if accepted {
            Ok(())
        } else {
            Err(NetworkError::JoinFailed {
                code: JOIN_ERROR_AUTH,
            })
        }
    }

    /// Get the primary local IP address.
    ///
    /// Creates a UDP socket and "connects" it to a public address (nothing
    /// is sent), then checks which local address the OS picked.
    fn detect_local_ip() -> Option<Ipv4Addr> {
        use std::net::UdpSocket;

        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        }
    }
}

impl NetworkInterface for HostNetwork {
    fn connect(&self, ssid: &[u8], password: &[u8], auth: AuthMode) -> Result<(), NetworkError> {
        let ssid = std::str::from_utf8(ssid).map_err(|_| NetworkError::InvalidSsid)?;
        debug!("Simulated join to {} ({:?})", ssid, auth);

        self.set_status(ConnectionStatus::Connecting);
        std::thread::sleep(self.join_delay);

        match self.authenticate(ssid, password, auth) {
            Ok(()) => {
                self.set_status(ConnectionStatus::Up);
                Ok(())
            }
            Err(e) => {
                self.set_status(ConnectionStatus::Idle);
                Err(e)
            }
        }
    }

    fn disconnect(&self) -> Result<(), NetworkError> {
        self.set_status(ConnectionStatus::Idle);
        Ok(())
    }

    fn connection_status(&self) -> ConnectionStatus {
        *self.lock_status()
    }

    fn scan(&self, limit: usize) -> Result<Vec<AccessPoint>, NetworkError> {
        Ok(self
            .access_points
            .iter()
            .take(limit)
            .enumerate()
            .map(|(i, ap)| AccessPoint {
                ssid: ap.ssid.clone(),
                bssid: [0x02, 0x00, 0x00, 0x00, 0x01, i as u8],
                security: if ap.password.is_empty() {
                    SecurityMode::None
                } else {
                    SecurityMode::Wpa2
                },
                rssi: (-40 - 5 * i as i32).max(-100) as i8,
                channel: 1 + ((i * 5) % 13) as u8,
            })
            .collect())
    }

    fn link_info(&self) -> Option<LinkInfo> {
        if self.connection_status() != ConnectionStatus::Up {
            return None;
        }
        let ip = Self::detect_local_ip().unwrap_or(Ipv4Addr::LOCALHOST);
        let [a, b, c, _] = ip.octets();
        Some(LinkInfo {
            mac: SIMULATED_MAC,
            ip,
            netmask: prefix_to_netmask(24),
            gateway: Ipv4Addr::new(a, b, c, 1),
            rssi: Some(-40),
        })
    }
}
