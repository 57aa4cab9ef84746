//! Test doubles for the provisioning collaborators.
//!
//! Compiled for unit tests only. The fakes record every call so tests can
//! assert on exactly what the core asked of the network and the control
//! channel.

use crate::config::ProvisionerConfig;
use crate::network::{
    AccessPoint, AuthMode, ConnectionStatus, LinkInfo, NetworkError, NetworkInterface, ProbeError,
    TimeProbe,
};
use crate::provisioning::{
    event_queue, Attribute, AttributeStore, Collaborators, ControlEvent, Provisioner,
};
use crate::transport::{ControlChannel, TransportError};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How long [`Harness::settle`] keeps dispatching.
const SETTLE_TIME: Duration = Duration::from_millis(150);

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Arguments of one `connect` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectCall {
    pub ssid: Vec<u8>,
    pub password: Vec<u8>,
    pub auth: AuthMode,
}

#[derive(Debug)]
struct NetworkState {
    status: ConnectionStatus,
    connects: Vec<ConnectCall>,
    disconnects: usize,
}

/// Scripted network interface.
///
/// By default every connect succeeds at once. A failing fake returns the
/// configured driver code. A gated fake blocks each connect until the test
/// sends its result.
pub struct FakeNetwork {
    state: Mutex<NetworkState>,
    fail_code: Option<i32>,
    gate: Option<Mutex<Receiver<Result<(), i32>>>>,
}

impl FakeNetwork {
    fn build(fail_code: Option<i32>, gate: Option<Receiver<Result<(), i32>>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetworkState {
                status: ConnectionStatus::Idle,
                connects: Vec::new(),
                disconnects: 0,
            }),
            fail_code,
            gate: gate.map(Mutex::new),
        })
    }

    pub fn new() -> Arc<Self> {
        Self::build(None, None)
    }

    pub fn failing(code: i32) -> Arc<Self> {
        Self::build(Some(code), None)
    }

    pub fn gated() -> (Arc<Self>, Sender<Result<(), i32>>) {
        let (tx, rx) = mpsc::channel();
        (Self::build(None, Some(rx)), tx)
    }

    pub fn connects(&self) -> Vec<ConnectCall> {
        self.state.lock().unwrap().connects.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects.len()
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.state.lock().unwrap().status = status;
    }
}

impl NetworkInterface for FakeNetwork {
    fn connect(&self, ssid: &[u8], password: &[u8], auth: AuthMode) -> Result<(), NetworkError> {
        {
            let mut state = self.state.lock().unwrap();
            state.connects.push(ConnectCall {
                ssid: ssid.to_vec(),
                password: password.to_vec(),
                auth,
            });
            state.status = ConnectionStatus::Connecting;
        }

        let result = match &self.gate {
            Some(gate) => gate.lock().unwrap().recv().unwrap_or(Err(-99)),
            None => self.fail_code.map_or(Ok(()), Err),
        };

        let mut state = self.state.lock().unwrap();
        match result {
            Ok(()) => {
                state.status = ConnectionStatus::Up;
                Ok(())
            }
            Err(code) => {
                state.status = ConnectionStatus::Idle;
                Err(NetworkError::JoinFailed { code })
            }
        }
    }

    fn disconnect(&self) -> Result<(), NetworkError> {
        let mut state = self.state.lock().unwrap();
        state.disconnects += 1;
        state.status = ConnectionStatus::Idle;
        Ok(())
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.state.lock().unwrap().status
    }

    fn scan(&self, _limit: usize) -> Result<Vec<AccessPoint>, NetworkError> {
        Ok(Vec::new())
    }

    fn link_info(&self) -> Option<LinkInfo> {
        (self.connection_status() == ConnectionStatus::Up).then(|| LinkInfo {
            mac: [0x02, 0, 0, 0, 0, 1],
            ip: Ipv4Addr::new(10, 0, 0, 2),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            rssi: Some(-50),
        })
    }
}

#[derive(Debug, Default)]
struct ChannelLog {
    notifications: Vec<bool>,
    discoverable_calls: usize,
    fail_discoverable: bool,
}

/// Recording control channel. Clones share one log.
#[derive(Clone, Default)]
pub struct FakeChannel {
    log: Arc<Mutex<ChannelLog>>,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<bool> {
        self.log.lock().unwrap().notifications.clone()
    }

    pub fn discoverable_calls(&self) -> usize {
        self.log.lock().unwrap().discoverable_calls
    }

    pub fn fail_discoverable(&self, fail: bool) {
        self.log.lock().unwrap().fail_discoverable = fail;
    }
}

impl ControlChannel for FakeChannel {
    fn start_discoverable(&self) -> Result<(), TransportError> {
        let mut log = self.log.lock().unwrap();
        log.discoverable_calls += 1;
        if log.fail_discoverable {
            return Err(TransportError::Advertising("radio off".into()));
        }
        Ok(())
    }

    fn notify_status(&self, connected: bool) -> Result<(), TransportError> {
        self.log.lock().unwrap().notifications.push(connected);
        Ok(())
    }
}

/// Time probe that always answers and counts calls.
#[derive(Clone, Default)]
pub struct FakeProbe {
    calls: Arc<AtomicUsize>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TimeProbe for FakeProbe {
    fn fetch_time(&mut self) -> Result<u64, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(1_700_000_000)
    }
}

/// A started provisioner wired to fakes.
///
/// The test thread plays the dispatcher: nothing is handled until the test
/// calls [`write`](Self::write), [`post`](Self::post) or one of the
/// dispatch helpers.
pub struct Harness {
    pub provisioner: Provisioner,
    pub store: AttributeStore,
    pub network: Arc<FakeNetwork>,
    pub channel: FakeChannel,
    pub probe: FakeProbe,
}

impl Harness {
    pub fn start(network: Arc<FakeNetwork>) -> Self {
        let config = ProvisionerConfig {
            probe_interval: Duration::from_millis(10),
            ..ProvisionerConfig::default()
        };
        let store = AttributeStore::new();
        let channel = FakeChannel::new();
        let probe = FakeProbe::new();
        let (events, inbox) = event_queue();

        let provisioner = Provisioner::start(
            &config,
            store.clone(),
            events,
            inbox,
            Collaborators {
                channel: Box::new(channel.clone()),
                network: network.clone(),
                probe: Box::new(probe.clone()),
            },
        )
        .unwrap();

        Self {
            provisioner,
            store,
            network,
            channel,
            probe,
        }
    }

    /// Post an event and handle everything queued.
    pub fn post(&self, event: ControlEvent) {
        self.provisioner.events().post(event).unwrap();
        self.provisioner.dispatcher().dispatch_pending();
    }

    /// Remote write to an attribute, handled immediately.
    pub fn write(&self, attribute: Attribute, data: &[u8]) {
        self.post(ControlEvent::written(attribute, data));
    }

    /// Dispatch incoming events until `condition` holds.
    pub fn dispatch_until(&self, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + TEST_TIMEOUT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            self.provisioner
                .dispatcher()
                .dispatch_next(Duration::from_millis(5));
        }
        condition()
    }

    /// Keep dispatching for a short while so in-flight outcomes land.
    pub fn settle(&self) {
        let deadline = Instant::now() + SETTLE_TIME;
        while Instant::now() < deadline {
            self.provisioner
                .dispatcher()
                .dispatch_next(Duration::from_millis(5));
        }
    }
}
