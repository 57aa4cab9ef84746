//! HTTP stats server for provisioning monitoring.
//!
//! Provides a simple `/stats` endpoint that returns provisioning counters
//! and the current status attribute as JSON. Uses `tiny_http`, which works
//! on both host and ESP32 (via std::net).
//!
//! # Example Response
//!
//! ```json
//! {
//!   "uptime_secs": 3600,
//!   "configured": true,
//!   "connected": true,
//!   "joins": { "attempts": 3, "succeeded": 1, "failed": 2, "skipped": 0 },
//!   "channel": { "status_notifications": 4, "link_disconnects": 1, "rejected_writes": 0 }
//! }
//! ```

use crate::provisioning::AttributeStore;
use log::{error, info, warn};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tiny_http::{Header, Method, Response, Server};

/// How often the server loop checks for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Provisioning counters.
///
/// Shared between the dispatcher, the join worker and the stats server.
/// All fields are atomics so updates never take a lock.
#[derive(Debug)]
pub struct ProvisioningStats {
    start_time: Instant,
    /// Connect calls issued to the network interface.
    pub join_attempts: AtomicUsize,
    /// Joins that ended associated.
    pub join_successes: AtomicUsize,
    /// Joins that failed or were cancelled by a deferred disconnect.
    pub join_failures: AtomicUsize,
    /// Admissions skipped because the link was already up.
    pub skipped_joins: AtomicUsize,
    /// Status changes pushed to remote readers.
    pub status_notifications: AtomicUsize,
    /// Control-channel link disconnects.
    pub link_disconnects: AtomicUsize,
    /// Attribute writes rejected as malformed.
    pub rejected_writes: AtomicUsize,
}

impl Default for ProvisioningStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvisioningStats {
    /// Create zeroed statistics.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            join_attempts: AtomicUsize::new(0),
            join_successes: AtomicUsize::new(0),
            join_failures: AtomicUsize::new(0),
            skipped_joins: AtomicUsize::new(0),
            status_notifications: AtomicUsize::new(0),
            link_disconnects: AtomicUsize::new(0),
            rejected_writes: AtomicUsize::new(0),
        }
    }

    /// Increment a counter.
    pub fn record(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter.
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Serialize counters plus the current attribute state to JSON.
    pub fn to_json(&self, store: &AttributeStore) -> String {
        format!(
            r#"{{"uptime_secs":{},"configured":{},"connected":{},"joins":{{"attempts":{},"succeeded":{},"failed":{},"skipped":{}}},"channel":{{"status_notifications":{},"link_disconnects":{},"rejected_writes":{}}}}}"#,
            self.uptime_secs(),
            store.is_configured(),
            store.status(),
            Self::get(&self.join_attempts),
            Self::get(&self.join_successes),
            Self::get(&self.join_failures),
            Self::get(&self.skipped_joins),
            Self::get(&self.status_notifications),
            Self::get(&self.link_disconnects),
            Self::get(&self.rejected_writes),
        )
    }
}

/// HTTP stats server.
///
/// Runs in a background thread and serves provisioning statistics as JSON.
pub struct StatsServer {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl StatsServer {
    /// Start the stats server.
    ///
    /// `bind_addr` of `None` binds to 0.0.0.0. Drop the returned handle to
    /// stop the server.
    pub fn start(
        bind_addr: Option<IpAddr>,
        port: u16,
        stats: Arc<ProvisioningStats>,
        store: AttributeStore,
    ) -> Result<Self, std::io::Error> {
        let addr = match bind_addr {
            Some(ip) => format!("{}:{}", ip, port),
            None => format!("0.0.0.0:{}", port),
        };

        let server = Server::http(&addr)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, e.to_string()))?;

        info!("Stats server listening on http://{}/stats", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::Builder::new()
            .name("stats-server".into())
            .spawn(move || Self::run_server(server, stats, store, shutdown_clone))?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    fn run_server(
        server: Server,
        stats: Arc<ProvisioningStats>,
        store: AttributeStore,
        shutdown: Arc<AtomicBool>,
    ) {
        let content_type = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
            .expect("static header");
        let allow_get = Header::from_bytes(&b"Allow"[..], &b"GET"[..]).expect("static header");

        while !shutdown.load(Ordering::Acquire) {
            let request = match server.recv_timeout(POLL_INTERVAL) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    error!("Stats server error: {}", e);
                    break;
                }
            };

            let response = if request.method() != &Method::Get {
                Response::from_string("Method Not Allowed")
                    .with_status_code(405)
                    .with_header(allow_get.clone())
            } else if matches!(request.url(), "/stats" | "/stats/") {
                Response::from_string(stats.to_json(&store))
                    .with_header(content_type.clone())
                    .with_status_code(200)
            } else {
                Response::from_string("Not Found").with_status_code(404)
            };

            if let Err(e) = request.respond(response) {
                warn!("Failed to send stats response: {}", e);
            }
        }
        info!("Stats server shutting down");
    }

    /// Stop the server. May take up to one poll interval.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        self.stop();
    }
}
