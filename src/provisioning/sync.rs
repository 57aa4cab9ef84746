//! Status synchronizer: keeps the status attribute in step with the
//! interface and decides when a join may be admitted.
//!
//! Every method runs on the dispatcher, so the status attribute has a
//! single writer apart from remote peers.

use super::join::{AdmissionSignal, JoinOutcome, JoinPhase};
use super::store::AttributeStore;
use crate::network::NetworkInterface;
use crate::stats_server::ProvisioningStats;
use crate::transport::{ControlChannel, TransportError};
use log::{debug, error, info, warn};
use std::sync::Arc;

pub struct StatusSynchronizer {
    store: AttributeStore,
    channel: Box<dyn ControlChannel>,
    network: Arc<dyn NetworkInterface>,
    admission: AdmissionSignal,
    phase: Arc<JoinPhase>,
    stats: Arc<ProvisioningStats>,
}

impl StatusSynchronizer {
    pub fn new(
        store: AttributeStore,
        channel: Box<dyn ControlChannel>,
        network: Arc<dyn NetworkInterface>,
        admission: AdmissionSignal,
        phase: Arc<JoinPhase>,
        stats: Arc<ProvisioningStats>,
    ) -> Self {
        Self {
            store,
            channel,
            network,
            admission,
            phase,
            stats,
        }
    }

    /// Make the device discoverable to configurators.
    pub fn start_discoverable(&self) -> Result<(), TransportError> {
        self.channel.start_discoverable()
    }

    /// Whether the join worker is inside a connect call.
    pub fn join_in_flight(&self) -> bool {
        self.phase.is_in_flight()
    }

    /// Credentials were written: admit a join if an SSID is present.
    ///
    /// With no SSID the status is mirrored false and nothing is admitted.
    pub fn on_credentials_ready(&self) {
        if !self.store.is_configured() {
            info!("Invalid WiFi credentials. Please configure SSID and password");
            self.mirror_status(false);
            return;
        }

        self.phase.admit();
        if self.admission.release() {
            debug!("Join admitted");
        } else {
            debug!("Join already pending, request coalesced");
        }
    }

    /// A remote peer wrote the status attribute.
    ///
    /// `true` asks for a join with the stored credentials. `false` asks to
    /// leave the network and cancels any admission still waiting; while a
    /// join is in flight the request is handed to the worker, which
    /// disconnects once the connect call returns.
    pub fn on_status_write(&self, requested: bool) {
        if requested {
            info!("Received WiFi connect request");
            self.on_credentials_ready();
            return;
        }

        info!("Received WiFi disconnect request");
        if self.phase.request_disconnect() {
            info!("Join in progress, disconnect deferred until it returns");
            return;
        }
        if let Err(e) = self.network.disconnect() {
            warn!("Disconnect failed: {}", e);
        }
    }

    /// The worker resolved an attempt or saw the link drop.
    pub fn on_join_outcome(&self, outcome: JoinOutcome) {
        if let Some(code) = outcome.error_code {
            info!("Join failed with error code {}", code);
        }
        self.mirror_status(outcome.succeeded);
    }

    /// The configurator's link dropped: clear the status and advertise again.
    pub fn on_link_disconnected(&self) {
        info!("Control link disconnected");
        ProvisioningStats::record(&self.stats.link_disconnects);
        self.mirror_status(false);
        if let Err(e) = self.channel.start_discoverable() {
            error!("Failed to resume advertising: {}", e);
        }
    }

    /// Store `connected` and notify remote readers, only when it changed.
    fn mirror_status(&self, connected: bool) {
        if !self.store.set_status_if_changed(connected) {
            return;
        }
        ProvisioningStats::record(&self.stats.status_notifications);
        if let Err(e) = self.channel.notify_status(connected) {
            warn!("Status notification failed: {}", e);
        }
    }
}
