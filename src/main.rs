//! BLE WiFi provisioner binary.
//!
//! Runs on both ESP32 and host platforms:
//! - **Host**: `cargo run --bin provisioner`
//! - **ESP32**: `cargo espflash flash --bin provisioner --features esp32 --release`
//!
//! On the host the BLE service is replaced by a console (type `help`) and
//! the access points are simulated from `PROVISION_SIM_NETWORKS`, e.g.
//! `PROVISION_SIM_NETWORKS="HomeNet:secret123;Cafe" cargo run`.
//!
//! ## Endpoints
//!
//! - Stats: http://localhost:8080/stats

use ble_wifi_provisioner::network::{log_scan_results, NetworkInterface, NtpProbe};
use ble_wifi_provisioner::provisioning::{
    event_queue, AttributeStore, Collaborators, EventInbox, EventQueue, Provisioner,
};
use ble_wifi_provisioner::{ProvisionerConfig, StatsServer};
use log::{error, info, warn};
use std::error::Error;
use std::sync::Arc;

// ESP32: Initialize ESP-IDF before anything else
#[cfg(feature = "esp32")]
fn platform_init() {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    info!("ESP-IDF initialized");
}

// Host: Just initialize env_logger
#[cfg(not(feature = "esp32"))]
fn platform_init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Scan, start the provisioner and the stats endpoint.
fn start(
    config: &ProvisionerConfig,
    store: &AttributeStore,
    events: &EventQueue,
    inbox: EventInbox,
    collaborators: Collaborators,
) -> Result<(Provisioner, Option<StatsServer>), Box<dyn Error>> {
    log_scan_results(collaborators.network.as_ref(), config.scan_limit);

    let provisioner = Provisioner::start(config, store.clone(), events.clone(), inbox, collaborators)?;

    let stats_server = match config.stats_port {
        Some(port) => {
            match StatsServer::start(None, port, provisioner.stats().clone(), store.clone()) {
                Ok(server) => Some(server),
                Err(e) => {
                    warn!("Failed to start stats server: {}", e);
                    None
                }
            }
        }
        None => None,
    };

    Ok((provisioner, stats_server))
}

#[cfg(feature = "esp32")]
fn run() -> Result<(), Box<dyn Error>> {
    use ble_wifi_provisioner::network::EspWifiNetwork;
    use ble_wifi_provisioner::transport::NimbleControlChannel;
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;

    info!("Platform: ESP32");
    let config = ProvisionerConfig::default();
    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;

    let store = AttributeStore::new();
    let (events, inbox) = event_queue();

    let network: Arc<dyn NetworkInterface> =
        Arc::new(EspWifiNetwork::new(peripherals.modem, sysloop)?);
    let channel = NimbleControlChannel::new(&config.device_name, store.clone(), events.clone())?;

    let (provisioner, _stats_server) = start(
        &config,
        &store,
        &events,
        inbox,
        Collaborators {
            channel: Box::new(channel),
            network,
            probe: Box::new(NtpProbe::new(&config.ntp_server)),
        },
    )?;
    drop(events);

    provisioner.run();
    Ok(())
}

#[cfg(not(feature = "esp32"))]
fn run() -> Result<(), Box<dyn Error>> {
    use ble_wifi_provisioner::network::HostNetwork;
    use ble_wifi_provisioner::provisioning::ControlEvent;
    use ble_wifi_provisioner::transport::ConsoleChannel;
    use std::thread;

    info!("Platform: Host");
    let config = ProvisionerConfig::from_env()?;

    let store = AttributeStore::new();
    let (events, inbox) = event_queue();

    let host_network = Arc::new(HostNetwork::from_env());
    let network: Arc<dyn NetworkInterface> = host_network.clone();

    let (provisioner, _stats_server) = start(
        &config,
        &store,
        &events,
        inbox,
        Collaborators {
            channel: Box::new(ConsoleChannel::new(&config.device_name)),
            network,
            probe: Box::new(NtpProbe::new(&config.ntp_server)),
        },
    )?;

    println!("Type 'help' for commands.");
    let console_store = store.clone();
    thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            ConsoleChannel::run_input(
                stdin.lock(),
                std::io::stdout(),
                &console_store,
                &events,
                Some(&host_network),
            );
            info!("Console closed, shutting down");
            if events.post_blocking(ControlEvent::Shutdown).is_err() {
                warn!("Provisioner already stopped");
            }
        })?;

    provisioner.run();
    Ok(())
}

fn main() {
    platform_init();
    info!("=== BLE WiFi provisioner starting ===");

    if let Err(e) = run() {
        error!("Fatal: {}", e);
        #[cfg(feature = "esp32")]
        loop {
            std::thread::sleep(std::time::Duration::from_secs(60));
        }
        #[cfg(not(feature = "esp32"))]
        std::process::exit(1);
    }
}
