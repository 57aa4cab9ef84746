//! Provisioner configuration.
//!
//! # Components
//!
//! - [`provisioning`] - attribute limits, GATT identifiers and runtime
//!   settings (host-testable)

mod provisioning;

pub use provisioning::{
    ConfigError, ProvisionerConfig, DEFAULT_DEVICE_NAME, DEFAULT_NTP_SERVER,
    DEFAULT_PROBE_INTERVAL, DEFAULT_SCAN_LIMIT, DEFAULT_STATS_PORT, EVENT_QUEUE_DEPTH,
    MAX_DEVICE_NAME_LEN, MAX_PASSWORD_LEN, MAX_SSID_LEN, PASSWORD_CHAR_UUID, SERVICE_UUID,
    SSID_CHAR_UUID, STATUS_CHAR_UUID, STATUS_LEN,
};
