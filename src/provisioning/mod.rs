//! WiFi provisioning over a control channel.
//!
//! A remote configurator writes an SSID and password into a three-entry
//! attribute table. Writing the password (or `1` to the status attribute)
//! admits one join on the background worker; the outcome is mirrored back
//! into the status attribute and pushed to the configurator when it
//! changes.
//!
//! # Components
//!
//! - [`store`](AttributeStore) - the attribute table
//! - [`join`](JoinCoordinator) - single join worker behind a one-slot
//!   admission channel
//! - [`sync`](StatusSynchronizer) - status mirroring and join admission
//! - [`dispatcher`](EventDispatcher) - run-to-completion event loop
//!
//! # Example
//!
//! ```
//! use ble_wifi_provisioner::config::ProvisionerConfig;
//! use ble_wifi_provisioner::network::{HostNetwork, NtpProbe};
//! use ble_wifi_provisioner::provisioning::{
//!     event_queue, Attribute, AttributeStore, Collaborators, ControlEvent, Provisioner,
//! };
//! use ble_wifi_provisioner::transport::ConsoleChannel;
//! use std::sync::Arc;
//!
//! let config = ProvisionerConfig::default();
//! let store = AttributeStore::new();
//! let (events, inbox) = event_queue();
//! let provisioner = Provisioner::start(
//!     &config,
//!     store.clone(),
//!     events.clone(),
//!     inbox,
//!     Collaborators {
//!         channel: Box::new(ConsoleChannel::new(&config.device_name)),
//!         network: Arc::new(HostNetwork::with_networks([("HomeNet", "")])),
//!         probe: Box::new(NtpProbe::new(&config.ntp_server)),
//!     },
//! )
//! .unwrap();
//!
//! events.post(ControlEvent::written(Attribute::Ssid, "HomeNet")).unwrap();
//! provisioner.dispatcher().dispatch_pending();
//! assert_eq!(store.read(Attribute::Ssid), b"HomeNet");
//! provisioner.shutdown();
//! ```

mod dispatcher;
mod join;
mod store;
mod sync;

pub use dispatcher::{
    event_queue, ControlEvent, EventDispatcher, EventInbox, EventQueue, EventQueueError,
};
pub use join::{admission_slot, AdmissionSignal, JoinCoordinator, JoinOutcome, JoinPhase, JoinWorker};
pub use store::{Attribute, AttributeStore, Credentials, StoreError};
pub use sync::StatusSynchronizer;

use crate::config::{ConfigError, ProvisionerConfig};
use crate::network::{NetworkInterface, TimeProbe};
use crate::stats_server::ProvisioningStats;
use crate::transport::{ControlChannel, TransportError};
use log::info;
use std::fmt;
use std::sync::Arc;

/// Platform collaborators handed to [`Provisioner::start`].
pub struct Collaborators {
    pub channel: Box<dyn ControlChannel>,
    pub network: Arc<dyn NetworkInterface>,
    pub probe: Box<dyn TimeProbe>,
}

/// Running provisioning service: dispatcher plus join worker.
pub struct Provisioner {
    dispatcher: EventDispatcher,
    worker: JoinWorker,
    events: EventQueue,
    store: AttributeStore,
    stats: Arc<ProvisioningStats>,
}

impl Provisioner {
    /// Wire the components together, become discoverable and start the
    /// join worker.
    ///
    /// Failing to become discoverable is fatal: with no way for a
    /// configurator to reach the device there is nothing to provision.
    pub fn start(
        config: &ProvisionerConfig,
        store: AttributeStore,
        events: EventQueue,
        inbox: EventInbox,
        collaborators: Collaborators,
    ) -> Result<Self, StartupError> {
        config.validate()?;

        let Collaborators {
            channel,
            network,
            probe,
        } = collaborators;
        let stats = Arc::new(ProvisioningStats::new());
        let phase = Arc::new(JoinPhase::new());
        let (signal, admissions) = admission_slot();

        let sync = StatusSynchronizer::new(
            store.clone(),
            channel,
            network.clone(),
            signal,
            phase.clone(),
            stats.clone(),
        );
        sync.start_discoverable()?;
        info!("Advertising as \"{}\"", config.device_name);

        let worker = JoinCoordinator::new(
            store.clone(),
            network,
            probe,
            events.clone(),
            phase,
            stats.clone(),
        )
        .with_probe_interval(config.probe_interval)
        .spawn(admissions)
        .map_err(StartupError::Worker)?;

        let dispatcher = EventDispatcher::new(inbox, sync, store.clone(), stats.clone());

        Ok(Self {
            dispatcher,
            worker,
            events,
            store,
            stats,
        })
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn store(&self) -> &AttributeStore {
        &self.store
    }

    pub fn stats(&self) -> &Arc<ProvisioningStats> {
        &self.stats
    }

    /// A sender for transports and tests.
    pub fn events(&self) -> EventQueue {
        self.events.clone()
    }

    /// Whether the join worker is inside a connect call.
    pub fn join_in_flight(&self) -> bool {
        self.dispatcher.synchronizer().join_in_flight()
    }

    /// Dispatch until [`ControlEvent::Shutdown`] is posted, then stop the
    /// worker.
    pub fn run(self) {
        self.dispatcher.dispatch_forever();
        self.shutdown();
    }

    /// Stop the join worker and wait for it.
    ///
    /// Waits for a connect call in progress to return.
    pub fn shutdown(self) {
        let Self {
            dispatcher,
            worker,
            events,
            ..
        } = self;
        worker.request_shutdown();
        // Dropping the synchronizer closes the admission channel, which wakes
        // an idle worker.
        drop(dispatcher);
        drop(events);
        worker.join();
        info!("Provisioner stopped");
    }
}

/// Errors that prevent the provisioner from starting.
#[derive(Debug)]
pub enum StartupError {
    /// Configuration is invalid.
    Config(ConfigError),
    /// The control channel could not become discoverable.
    Transport(TransportError),
    /// The join worker thread could not be spawned.
    Worker(std::io::Error),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid configuration: {}", e),
            Self::Transport(e) => write!(f, "control channel failed to start: {}", e),
            Self::Worker(e) => write!(f, "failed to spawn join worker: {}", e),
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Transport(e) => Some(e),
            Self::Worker(e) => Some(e),
        }
    }
}

impl From<ConfigError> for StartupError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<TransportError> for StartupError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ConnectionStatus;
    use crate::testing::{wait_until, FakeChannel, FakeNetwork, FakeProbe, Harness, TEST_TIMEOUT};
    use std::time::Duration;

    #[test]
    fn test_start_advertises_once() {
        let h = Harness::start(FakeNetwork::new());
        assert_eq!(h.channel.discoverable_calls(), 1);
        assert!(!h.store.status());
    }

    #[test]
    fn test_start_fails_when_not_discoverable() {
        let channel = FakeChannel::new();
        channel.fail_discoverable(true);
        let (events, inbox) = event_queue();
        let result = Provisioner::start(
            &ProvisionerConfig::default(),
            AttributeStore::new(),
            events,
            inbox,
            Collaborators {
                channel: Box::new(channel),
                network: FakeNetwork::new(),
                probe: Box::new(FakeProbe::new()),
            },
        );
        assert!(matches!(result, Err(StartupError::Transport(_))));
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let config = ProvisionerConfig {
            device_name: String::new(),
            ..ProvisionerConfig::default()
        };
        let (events, inbox) = event_queue();
        let result = Provisioner::start(
            &config,
            AttributeStore::new(),
            events,
            inbox,
            Collaborators {
                channel: Box::new(FakeChannel::new()),
                network: FakeNetwork::new(),
                probe: Box::new(FakeProbe::new()),
            },
        );
        assert!(matches!(result, Err(StartupError::Config(_))));
    }

    #[test]
    fn test_status_follows_interface_through_link_loss() {
        let h = Harness::start(FakeNetwork::new());
        h.write(Attribute::Ssid, b"HomeNet");
        h.write(Attribute::Password, b"secret123");
        assert!(h.dispatch_until(|| h.store.status()));
        assert!(wait_until(TEST_TIMEOUT, || h.probe.calls() >= 1));

        h.network.set_status(ConnectionStatus::Idle);
        assert!(h.dispatch_until(|| !h.store.status()));
        assert_eq!(h.channel.notifications(), vec![true, false]);
    }

    #[test]
    fn test_run_returns_on_shutdown_event() {
        let h = Harness::start(FakeNetwork::new());
        let Harness { provisioner, .. } = h;
        let events = provisioner.events();
        let runner = std::thread::spawn(move || provisioner.run());

        events.post(ControlEvent::Shutdown).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !runner.is_finished() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(runner.is_finished());
        runner.join().unwrap();
    }
}
