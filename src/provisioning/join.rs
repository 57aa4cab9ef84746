//! Join coordinator: the single background worker that joins the network.
//!
//! The worker sleeps on a one-slot admission channel. Each admission is one
//! permission to try the credentials currently in the store. Admissions
//! released while the slot is already armed coalesce, and admissions
//! released while a join is running wait in the slot, so at most one
//! further attempt follows the one in flight.
//!
//! ```text
//!  control context                 join worker
//!  ───────────────                 ───────────
//!  AdmissionSignal::release ──▶ [slot: 1] ──▶ wake
//!                                               ├─ already up? report success
//!                                               ├─ cancelled by disconnect? skip
//!                                               ├─ connect (blocking)
//!  ◀── ControlEvent::JoinResolved ──────────────┤
//!                                               └─ on success: probe loop
//!                                                  until the link drops,
//!                                                  answering admissions
//!                                                  as already connected
//! ```
//!
//! Outcomes go back through the dispatcher's event queue, so the status
//! attribute is only ever mirrored from the control context.

use super::dispatcher::{ControlEvent, EventQueue};
use super::store::{AttributeStore, Credentials};
use crate::config::DEFAULT_PROBE_INTERVAL;
use crate::network::{ConnectionStatus, NetworkInterface, TimeProbe};
use crate::stats_server::ProvisioningStats;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Longest uninterrupted sleep in the probe loop, so shutdown is prompt.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Result of one join attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Whether the device ended up associated.
    pub succeeded: bool,
    /// Driver error code of a failed join, when there is one.
    pub error_code: Option<i32>,
}

impl JoinOutcome {
    pub fn success() -> Self {
        Self {
            succeeded: true,
            error_code: None,
        }
    }

    pub fn failure(error_code: Option<i32>) -> Self {
        Self {
            succeeded: false,
            error_code,
        }
    }
}

/// Sending half of the one-slot admission channel.
#[derive(Clone)]
pub struct AdmissionSignal {
    slot: SyncSender<()>,
}

impl AdmissionSignal {
    /// Arm the slot without blocking.
    ///
    /// Returns `false` if the slot was already armed (the request coalesces
    /// with the pending one) or the worker is gone.
    pub fn release(&self) -> bool {
        match self.slot.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => false,
            Err(TrySendError::Disconnected(())) => {
                warn!("Join worker is not running, admission dropped");
                false
            }
        }
    }
}

/// Create the admission channel with capacity one.
pub fn admission_slot() -> (AdmissionSignal, Receiver<()>) {
    let (slot, admissions) = mpsc::sync_channel(1);
    (AdmissionSignal { slot }, admissions)
}

#[derive(Debug, Default)]
struct PhaseState {
    in_flight: bool,
    disconnect_pending: bool,
    /// Set by a disconnect request, cleared by a later admission. An
    /// admission still waiting in the slot is stale while this is set.
    cancelled: bool,
}

/// Tracks whether a connect call is running, so disconnect requests that
/// arrive meanwhile can be deferred instead of racing the join.
///
/// The most recent request wins: a disconnect cancels any admission
/// released before it, and an admission released after it is honored.
#[derive(Debug, Default)]
pub struct JoinPhase {
    state: Mutex<PhaseState>,
}

impl JoinPhase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PhaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a connect call is running right now.
    pub fn is_in_flight(&self) -> bool {
        self.lock().in_flight
    }

    /// Record that a join was admitted, superseding earlier disconnects.
    pub fn admit(&self) {
        self.lock().cancelled = false;
    }

    /// Record a disconnect request.
    ///
    /// Admissions released before this point are cancelled. Returns `true`
    /// when a join is in flight and the disconnect was deferred to the
    /// worker; the caller must disconnect itself otherwise.
    pub fn request_disconnect(&self) -> bool {
        let mut state = self.lock();
        state.cancelled = true;
        if state.in_flight {
            state.disconnect_pending = true;
        }
        state.in_flight
    }

    /// Enter the in-flight phase unless a disconnect cancelled the
    /// admission being served. A cancellation is consumed here.
    pub(super) fn begin(&self) -> bool {
        let mut state = self.lock();
        if std::mem::take(&mut state.cancelled) {
            return false;
        }
        state.in_flight = true;
        state.disconnect_pending = false;
        true
    }

    /// End the in-flight phase, returning whether a disconnect was deferred.
    pub(super) fn finish(&self) -> bool {
        let mut state = self.lock();
        state.in_flight = false;
        std::mem::take(&mut state.disconnect_pending)
    }
}

/// The join worker's state. Consumed by [`spawn`](Self::spawn).
pub struct JoinCoordinator {
    store: AttributeStore,
    network: Arc<dyn NetworkInterface>,
    probe: Box<dyn TimeProbe>,
    events: EventQueue,
    phase: Arc<JoinPhase>,
    stats: Arc<ProvisioningStats>,
    probe_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl JoinCoordinator {
    pub fn new(
        store: AttributeStore,
        network: Arc<dyn NetworkInterface>,
        probe: Box<dyn TimeProbe>,
        events: EventQueue,
        phase: Arc<JoinPhase>,
        stats: Arc<ProvisioningStats>,
    ) -> Self {
        Self {
            store,
            network,
            probe,
            events,
            phase,
            stats,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the delay between connectivity probes.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Start the worker thread.
    pub fn spawn(self, admissions: Receiver<()>) -> std::io::Result<JoinWorker> {
        let shutdown = self.shutdown.clone();
        let handle = thread::Builder::new()
            .name("wifi-join".into())
            .spawn(move || self.run(admissions))?;
        Ok(JoinWorker {
            handle: Some(handle),
            shutdown,
        })
    }

    /// Worker loop. Ends when every admission sender is gone or on shutdown.
    fn run(mut self, admissions: Receiver<()>) {
        debug!("Join worker started");
        for () in admissions.iter() {
            if self.is_shutting_down() {
                break;
            }
            self.handle_admission(&admissions);
        }
        debug!("Join worker stopped");
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn handle_admission(&mut self, admissions: &Receiver<()>) {
        if self.network.connection_status() == ConnectionStatus::Up {
            self.skip_connected();
            return;
        }

        let credentials = self.store.credentials();
        if credentials.ssid.is_empty() {
            info!("SSID cleared before join, nothing to connect to");
            self.report(JoinOutcome::failure(None));
            return;
        }

        let Some(outcome) = self.attempt(&credentials) else {
            info!("Join cancelled by a disconnect request");
            ProvisioningStats::record(&self.stats.skipped_joins);
            return;
        };
        drop(credentials);
        self.report(outcome);

        if outcome.succeeded {
            if let Some(info) = self.network.link_info() {
                info!("WiFi connection info: {}", info);
            }
            self.probe_until_link_drops(admissions);
        }
    }

    /// An admission arrived while the link is up: no join, but report the
    /// link so a status cleared meanwhile is restored.
    fn skip_connected(&self) {
        info!("Already connected to AP, skipping join");
        ProvisioningStats::record(&self.stats.skipped_joins);
        self.report(JoinOutcome::success());
    }

    /// One blocking connect attempt with the given credentials.
    ///
    /// `None` if a disconnect request cancelled the admission first.
    fn attempt(&self, credentials: &Credentials) -> Option<JoinOutcome> {
        if !self.phase.begin() {
            return None;
        }
        let auth = credentials.auth_mode();
        info!(
            "Connecting to AP: {} ({:?})",
            credentials.ssid_lossy(),
            auth
        );
        ProvisioningStats::record(&self.stats.join_attempts);

        let result = self
            .network
            .connect(&credentials.ssid, &credentials.password, auth);
        let disconnect_requested = self.phase.finish();

        if disconnect_requested {
            info!("Disconnect was requested during join, disconnecting");
            if let Err(e) = self.network.disconnect() {
                warn!("Deferred disconnect failed: {}", e);
            }
        }

        let outcome = match result {
            Ok(()) if !disconnect_requested => {
                info!(
                    "WiFi connection success. Connected to AP: {}",
                    credentials.ssid_lossy()
                );
                ProvisioningStats::record(&self.stats.join_successes);
                JoinOutcome::success()
            }
            Ok(()) => {
                ProvisioningStats::record(&self.stats.join_failures);
                JoinOutcome::failure(None)
            }
            Err(e) => {
                error!("WiFi connection error: {}", e);
                ProvisioningStats::record(&self.stats.join_failures);
                JoinOutcome::failure(e.code())
            }
        };
        Some(outcome)
    }

    /// Probe internet connectivity until the link goes down.
    ///
    /// Reports a failed outcome when the link drops so the status attribute
    /// follows the interface. Admissions released meanwhile are answered
    /// as already connected.
    fn probe_until_link_drops(&mut self, admissions: &Receiver<()>) {
        info!("Getting time from remote server to check internet connectivity");
        loop {
            match self.probe.fetch_time() {
                Ok(unix_secs) => info!("Current time is {} (unix seconds)", unix_secs),
                Err(e) => warn!(
                    "Time probe failed: {}. Please check AP internet settings",
                    e
                ),
            }

            if !self.sleep_unless_shutdown(self.probe_interval) {
                return;
            }

            match self.network.connection_status() {
                ConnectionStatus::Up => {
                    if admissions.try_recv().is_ok() {
                        self.skip_connected();
                    }
                    continue;
                }
                ConnectionStatus::Connecting => info!("Trying to reconnect to AP..."),
                ConnectionStatus::Idle => {}
            }
            info!("WiFi disconnected");
            self.report(JoinOutcome::failure(None));
            return;
        }
    }

    /// Sleep for `duration`, returning `false` if shutdown was requested.
    fn sleep_unless_shutdown(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.is_shutting_down() {
                return false;
            }
            let step = remaining.min(SHUTDOWN_POLL);
            thread::sleep(step);
            remaining -= step;
        }
        !self.is_shutting_down()
    }

    fn report(&self, outcome: JoinOutcome) {
        if self
            .events
            .post_blocking(ControlEvent::JoinResolved(outcome))
            .is_err()
        {
            debug!("Dispatcher gone, join outcome {:?} dropped", outcome);
        }
    }
}

/// Handle to the running join worker.
pub struct JoinWorker {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl JoinWorker {
    /// Ask the worker to stop after its current step.
    ///
    /// A connect call in progress is not interrupted. The worker exits
    /// once it returns, or once all admission senders are dropped while it
    /// waits.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Whether the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Request shutdown and wait for the thread to exit.
    pub fn join(mut self) {
        self.request_shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Join worker panicked");
            }
        }
    }
}

impl Drop for JoinWorker {
    fn drop(&mut self) {
        self.request_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::AuthMode;
    use crate::provisioning::dispatcher::{event_queue, EventInbox};
    use crate::provisioning::Attribute;
    use crate::testing::{wait_until, FakeNetwork, FakeProbe, TEST_TIMEOUT};

    struct Fixture {
        store: AttributeStore,
        network: Arc<FakeNetwork>,
        probe: FakeProbe,
        phase: Arc<JoinPhase>,
        stats: Arc<ProvisioningStats>,
        signal: AdmissionSignal,
        inbox: EventInbox,
        worker: JoinWorker,
    }

    fn start(network: Arc<FakeNetwork>) -> Fixture {
        let store = AttributeStore::new();
        let probe = FakeProbe::new();
        let phase = Arc::new(JoinPhase::new());
        let stats = Arc::new(ProvisioningStats::new());
        let (events, inbox) = event_queue();
        let (signal, admissions) = admission_slot();

        let worker = JoinCoordinator::new(
            store.clone(),
            network.clone(),
            Box::new(probe.clone()),
            events,
            phase.clone(),
            stats.clone(),
        )
        .with_probe_interval(Duration::from_millis(10))
        .spawn(admissions)
        .unwrap();

        Fixture {
            store,
            network,
            probe,
            phase,
            stats,
            signal,
            inbox,
            worker,
        }
    }

    fn next_outcome(inbox: &EventInbox) -> Option<JoinOutcome> {
        match inbox.recv_timeout(TEST_TIMEOUT)? {
            ControlEvent::JoinResolved(outcome) => Some(outcome),
            _ => None,
        }
    }

    #[test]
    fn test_slot_coalesces_releases() {
        let (signal, admissions) = admission_slot();
        assert!(signal.release());
        assert!(!signal.release());
        assert!(!signal.release());
        assert!(admissions.try_recv().is_ok());
        assert!(admissions.try_recv().is_err());
        assert!(signal.release());
    }

    #[test]
    fn test_release_without_worker() {
        let (signal, admissions) = admission_slot();
        drop(admissions);
        assert!(!signal.release());
    }

    #[test]
    fn test_phase_defers_only_while_in_flight() {
        let phase = JoinPhase::new();
        phase.admit();
        assert!(phase.begin());
        assert!(phase.is_in_flight());
        assert!(phase.request_disconnect());
        assert!(phase.finish());
        assert!(!phase.is_in_flight());

        // A deferred request is consumed once.
        phase.admit();
        assert!(phase.begin());
        assert!(!phase.finish());
    }

    #[test]
    fn test_phase_disconnect_cancels_earlier_admission() {
        let phase = JoinPhase::new();
        phase.admit();
        assert!(!phase.request_disconnect());
        assert!(!phase.begin());
        assert!(!phase.is_in_flight());

        // The cancellation is consumed, and a later admission wins.
        phase.request_disconnect();
        phase.admit();
        assert!(phase.begin());
        phase.finish();
    }

    #[test]
    fn test_open_join_succeeds_and_probes() {
        let f = start(FakeNetwork::new());
        f.store.write(Attribute::Ssid, b"HomeNet").unwrap();
        assert!(f.signal.release());

        assert_eq!(next_outcome(&f.inbox), Some(JoinOutcome::success()));
        let calls = f.network.connects();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].ssid, b"HomeNet");
        assert!(calls[0].password.is_empty());
        assert_eq!(calls[0].auth, AuthMode::Open);

        assert!(wait_until(TEST_TIMEOUT, || f.probe.calls() >= 2));
        assert_eq!(ProvisioningStats::get(&f.stats.join_successes), 1);
    }

    #[test]
    fn test_secured_join_uses_wpa() {
        let f = start(FakeNetwork::new());
        f.store.write(Attribute::Ssid, b"HomeNet").unwrap();
        f.store.write(Attribute::Password, b"secret123").unwrap();
        f.signal.release();

        assert_eq!(next_outcome(&f.inbox), Some(JoinOutcome::success()));
        let calls = f.network.connects();
        assert_eq!(calls[0].password, b"secret123");
        assert_eq!(calls[0].auth, AuthMode::WpaWpa2);
    }

    #[test]
    fn test_failed_join_reports_code_once() {
        let f = start(FakeNetwork::failing(-3009));
        f.store.write(Attribute::Ssid, b"HomeNet").unwrap();
        f.signal.release();

        assert_eq!(
            next_outcome(&f.inbox),
            Some(JoinOutcome::failure(Some(-3009)))
        );
        // No automatic retry.
        assert!(f.inbox.recv_timeout(Duration::from_millis(100)).is_none());
        assert_eq!(f.network.connect_count(), 1);
        assert_eq!(f.probe.calls(), 0);
    }

    #[test]
    fn test_skip_when_already_up_reports_success() {
        let f = start(FakeNetwork::new());
        f.network.set_status(ConnectionStatus::Up);
        f.store.write(Attribute::Ssid, b"HomeNet").unwrap();
        f.signal.release();

        assert_eq!(next_outcome(&f.inbox), Some(JoinOutcome::success()));
        assert_eq!(ProvisioningStats::get(&f.stats.skipped_joins), 1);
        assert_eq!(f.network.connect_count(), 0);
        assert!(f.inbox.recv_timeout(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn test_cancelled_admission_does_not_connect() {
        let f = start(FakeNetwork::new());
        f.store.write(Attribute::Ssid, b"HomeNet").unwrap();
        f.phase.admit();
        f.phase.request_disconnect();
        f.signal.release();

        assert!(wait_until(TEST_TIMEOUT, || {
            ProvisioningStats::get(&f.stats.skipped_joins) == 1
        }));
        assert_eq!(f.network.connect_count(), 0);
        assert!(f.inbox.recv_timeout(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn test_admission_while_probing_reports_success() {
        let f = start(FakeNetwork::new());
        f.store.write(Attribute::Ssid, b"HomeNet").unwrap();
        f.signal.release();
        assert_eq!(next_outcome(&f.inbox), Some(JoinOutcome::success()));

        f.signal.release();
        assert_eq!(next_outcome(&f.inbox), Some(JoinOutcome::success()));
        assert_eq!(ProvisioningStats::get(&f.stats.skipped_joins), 1);
        assert_eq!(f.network.connect_count(), 1);
    }

    #[test]
    fn test_empty_ssid_at_wake_reports_failure() {
        let f = start(FakeNetwork::new());
        f.signal.release();

        assert_eq!(next_outcome(&f.inbox), Some(JoinOutcome::failure(None)));
        assert_eq!(f.network.connect_count(), 0);
    }

    #[test]
    fn test_link_drop_ends_probe_loop() {
        let f = start(FakeNetwork::new());
        f.store.write(Attribute::Ssid, b"HomeNet").unwrap();
        f.signal.release();
        assert_eq!(next_outcome(&f.inbox), Some(JoinOutcome::success()));

        f.network.set_status(ConnectionStatus::Idle);
        assert_eq!(next_outcome(&f.inbox), Some(JoinOutcome::failure(None)));

        // Worker is waiting again and takes the next admission.
        f.signal.release();
        assert_eq!(next_outcome(&f.inbox), Some(JoinOutcome::success()));
        assert_eq!(f.network.connect_count(), 2);
    }

    #[test]
    fn test_disconnect_during_join_is_deferred() {
        let (network, gate) = FakeNetwork::gated();
        let f = start(network);
        f.store.write(Attribute::Ssid, b"HomeNet").unwrap();
        f.signal.release();

        assert!(wait_until(TEST_TIMEOUT, || f.phase.is_in_flight()));
        assert!(f.phase.request_disconnect());
        assert_eq!(f.network.disconnect_count(), 0);

        gate.send(Ok(())).unwrap();
        assert_eq!(next_outcome(&f.inbox), Some(JoinOutcome::failure(None)));
        assert_eq!(f.network.disconnect_count(), 1);
        assert_eq!(f.network.connection_status(), ConnectionStatus::Idle);
    }

    #[test]
    fn test_worker_stops_when_signal_dropped() {
        let f = start(FakeNetwork::new());
        let Fixture { signal, worker, .. } = f;
        drop(signal);
        assert!(wait_until(TEST_TIMEOUT, || worker.is_finished()));
        worker.join();
    }
}
