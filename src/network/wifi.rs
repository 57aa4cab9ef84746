//! ESP32 station WiFi.
//!
//! Wraps the ESP-IDF blocking WiFi driver behind [`NetworkInterface`].
//! `connect` holds the driver lock for the whole association, so the
//! connection state is cached in an atomic that status queries can read
//! without waiting.

use super::{
    prefix_to_netmask, AccessPoint, AuthMode, ConnectionStatus, LinkInfo, NetworkError,
    NetworkInterface, SecurityMode,
};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::wifi::{
    AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi,
};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

const STATUS_IDLE: u8 = 0;
const STATUS_CONNECTING: u8 = 1;
const STATUS_UP: u8 = 2;

/// ESP-IDF station interface.
pub struct EspWifiNetwork {
    wifi: Mutex<BlockingWifi<EspWifi<'static>>>,
    status: AtomicU8,
}

impl EspWifiNetwork {
    /// Bring up the WiFi driver in station mode, not yet associated.
    pub fn new(modem: Modem, sysloop: EspSystemEventLoop) -> Result<Self, NetworkError> {
        let esp_wifi = EspWifi::new(modem, sysloop.clone(), None)?;
        let mut wifi = BlockingWifi::wrap(esp_wifi, sysloop)?;

        // Scanning needs a started driver.
        wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
        wifi.start()?;
        info!("WiFi driver started in station mode");

        Ok(Self {
            wifi: Mutex::new(wifi),
            status: AtomicU8::new(STATUS_IDLE),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BlockingWifi<EspWifi<'static>>> {
        self.wifi.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ConnectionStatus) {
        let raw = match status {
            ConnectionStatus::Idle => STATUS_IDLE,
            ConnectionStatus::Connecting => STATUS_CONNECTING,
            ConnectionStatus::Up => STATUS_UP,
        };
        self.status.store(raw, Ordering::Release);
    }

    fn cached_status(&self) -> ConnectionStatus {
        match self.status.load(Ordering::Acquire) {
            STATUS_UP => ConnectionStatus::Up,
            STATUS_CONNECTING => ConnectionStatus::Connecting,
            _ => ConnectionStatus::Idle,
        }
    }

    fn join(
        wifi: &mut BlockingWifi<EspWifi<'static>>,
        ssid: &[u8],
        password: &[u8],
        auth: AuthMode,
    ) -> Result<(), NetworkError> {
        let ssid = std::str::from_utf8(ssid).map_err(|_| NetworkError::InvalidSsid)?;
        let password = std::str::from_utf8(password).map_err(|_| NetworkError::InvalidPassword)?;
        let auth_method = match auth {
            AuthMode::Open => AuthMethod::None,
            AuthMode::WpaWpa2 => AuthMethod::WPAWPA2Personal,
        };

        let config = Configuration::Client(ClientConfiguration {
            ssid: ssid.try_into().map_err(|_| NetworkError::InvalidSsid)?,
            password: password
                .try_into()
                .map_err(|_| NetworkError::InvalidPassword)?,
            auth_method,
            ..Default::default()
        });

        wifi.set_configuration(&config)?;
        if !wifi.is_started()? {
            wifi.start()?;
        }
        wifi.connect()?;
        wifi.wait_netif_up()?;
        Ok(())
    }

    fn security(auth: Option<AuthMethod>) -> SecurityMode {
        match auth {
            Some(AuthMethod::None) => SecurityMode::None,
            Some(AuthMethod::WEP) => SecurityMode::Wep,
            Some(AuthMethod::WPA) => SecurityMode::Wpa,
            Some(AuthMethod::WPA2Personal) => SecurityMode::Wpa2,
            Some(AuthMethod::WPAWPA2Personal) => SecurityMode::WpaWpa2,
            Some(AuthMethod::WPA3Personal) | Some(AuthMethod::WPA2WPA3Personal) => {
                SecurityMode::Wpa3
            }
            _ => SecurityMode::Unknown,
        }
    }

    fn ap_rssi() -> Option<i8> {
        let mut record = esp_idf_sys::wifi_ap_record_t::default();
        // SAFETY: `record` is a valid out-pointer for the duration of the call.
        esp_idf_sys::esp!(unsafe { esp_idf_sys::esp_wifi_sta_get_ap_info(&mut record) }).ok()?;
        Some(record.rssi)
    }
}

impl NetworkInterface for EspWifiNetwork {
    fn connect(&self, ssid: &[u8], password: &[u8], auth: AuthMode) -> Result<(), NetworkError> {
        self.set_status(ConnectionStatus::Connecting);
        let mut wifi = self.lock();
        let result = Self::join(&mut wifi, ssid, password, auth);
        match &result {
            Ok(()) => self.set_status(ConnectionStatus::Up),
            Err(e) => {
                debug!("Join failed: {}", e);
                // Leave the driver idle so the next attempt starts clean.
                if let Err(e) = wifi.disconnect() {
                    debug!("Disconnect after failed join: {}", e);
                }
                self.set_status(ConnectionStatus::Idle);
            }
        }
        result
    }

    fn disconnect(&self) -> Result<(), NetworkError> {
        let mut wifi = self.lock();
        if wifi.is_connected()? {
            info!("Disconnecting from WiFi");
            wifi.disconnect()?;
        }
        self.set_status(ConnectionStatus::Idle);
        Ok(())
    }

    fn connection_status(&self) -> ConnectionStatus {
        // A running connect holds the lock; report the cached state.
        let Ok(wifi) = self.wifi.try_lock() else {
            return self.cached_status();
        };
        let up = wifi.is_connected().unwrap_or(false) && wifi.is_up().unwrap_or(false);
        drop(wifi);

        if up {
            self.set_status(ConnectionStatus::Up);
        } else if self.cached_status() == ConnectionStatus::Up {
            warn!("WiFi link lost");
            self.set_status(ConnectionStatus::Idle);
        }
        self.cached_status()
    }

    fn scan(&self, limit: usize) -> Result<Vec<AccessPoint>, NetworkError> {
        let mut wifi = self.lock();
        let found = wifi.scan()?;
        Ok(found
            .into_iter()
            .take(limit)
            .map(|ap| AccessPoint {
                ssid: ap.ssid.to_string(),
                bssid: ap.bssid,
                security: Self::security(ap.auth_method),
                rssi: ap.signal_strength,
                channel: ap.channel,
            })
            .collect())
    }

    fn link_info(&self) -> Option<LinkInfo> {
        if self.cached_status() != ConnectionStatus::Up {
            return None;
        }
        let wifi = self.lock();
        let netif = wifi.wifi().sta_netif();
        let ip_info = netif.get_ip_info().ok()?;
        let mac = netif.get_mac().ok()?;
        Some(LinkInfo {
            mac,
            ip: ip_info.ip,
            netmask: prefix_to_netmask(ip_info.subnet.mask.0),
            gateway: ip_info.subnet.gateway,
            rssi: Self::ap_rssi(),
        })
    }
}
