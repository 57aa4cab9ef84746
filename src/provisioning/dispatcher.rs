//! Event dispatcher: serializes everything that touches the attribute table.
//!
//! Transport callbacks run in the BLE stack's context (or the console
//! thread) and must return quickly, so they only post a [`ControlEvent`].
//! A single dispatcher drains the bounded queue and runs each handler to
//! completion, which keeps attribute writes, join outcomes and link drops
//! strictly ordered.

use super::join::JoinOutcome;
use super::store::{Attribute, AttributeStore};
use super::sync::StatusSynchronizer;
use crate::config::EVENT_QUEUE_DEPTH;
use crate::stats_server::ProvisioningStats;
use log::{debug, info, trace, warn};
use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

/// Work items handled by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// A remote peer wrote `data` to the attribute with `handle`.
    AttributeWritten { handle: u16, data: Vec<u8> },
    /// The configurator's link went away.
    LinkDisconnected,
    /// The join worker finished an attempt (or saw the link drop).
    JoinResolved(JoinOutcome),
    /// Stop dispatching.
    Shutdown,
}

impl ControlEvent {
    /// Convenience constructor for a write to a known attribute.
    pub fn written(attribute: Attribute, data: impl Into<Vec<u8>>) -> Self {
        Self::AttributeWritten {
            handle: attribute.handle(),
            data: data.into(),
        }
    }
}

/// Posting failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventQueueError {
    /// Queue is at capacity; the event was dropped.
    Full,
    /// Dispatcher is gone.
    Closed,
}

impl fmt::Display for EventQueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "event queue full ({} events)", EVENT_QUEUE_DEPTH),
            Self::Closed => write!(f, "event dispatcher stopped"),
        }
    }
}

impl std::error::Error for EventQueueError {}

/// Sending side of the dispatcher queue. Cheap to clone.
#[derive(Clone)]
pub struct EventQueue {
    tx: SyncSender<ControlEvent>,
}

impl EventQueue {
    /// Post without blocking. Used from transport callbacks.
    pub fn post(&self, event: ControlEvent) -> Result<(), EventQueueError> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => EventQueueError::Full,
            TrySendError::Disconnected(_) => EventQueueError::Closed,
        })
    }

    /// Post, waiting for room. Used from the join worker, which must not
    /// lose an outcome.
    pub fn post_blocking(&self, event: ControlEvent) -> Result<(), EventQueueError> {
        self.tx.send(event).map_err(|_| EventQueueError::Closed)
    }
}

/// Receiving side of the dispatcher queue.
pub struct EventInbox {
    rx: Receiver<ControlEvent>,
}

impl EventInbox {
    /// Wait for the next event. `None` once every sender is gone.
    pub fn recv(&self) -> Option<ControlEvent> {
        self.rx.recv().ok()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ControlEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take an event if one is queued.
    pub fn try_recv(&self) -> Option<ControlEvent> {
        self.rx.try_recv().ok()
    }
}

/// Create the dispatcher queue with the default depth.
pub fn event_queue() -> (EventQueue, EventInbox) {
    let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
    (EventQueue { tx }, EventInbox { rx })
}

/// Drains the queue and runs each event to completion.
pub struct EventDispatcher {
    inbox: EventInbox,
    sync: StatusSynchronizer,
    store: AttributeStore,
    stats: Arc<ProvisioningStats>,
}

impl EventDispatcher {
    pub fn new(
        inbox: EventInbox,
        sync: StatusSynchronizer,
        store: AttributeStore,
        stats: Arc<ProvisioningStats>,
    ) -> Self {
        Self {
            inbox,
            sync,
            store,
            stats,
        }
    }

    pub fn synchronizer(&self) -> &StatusSynchronizer {
        &self.sync
    }

    /// Dispatch until a shutdown event arrives or every sender is gone.
    pub fn dispatch_forever(&self) {
        while let Some(event) = self.inbox.recv() {
            if !self.handle(event) {
                break;
            }
        }
        debug!("Event dispatcher stopped");
    }

    /// Handle everything already queued without waiting.
    ///
    /// Returns the number of events handled.
    pub fn dispatch_pending(&self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.inbox.try_recv() {
            handled += 1;
            if !self.handle(event) {
                break;
            }
        }
        handled
    }

    /// Handle at most one event, waiting up to `timeout` for it.
    ///
    /// Returns `None` if nothing arrived, otherwise what [`handle`](Self::handle)
    /// returned: `Some(false)` means shutdown was requested.
    pub fn dispatch_next(&self, timeout: Duration) -> Option<bool> {
        self.inbox
            .recv_timeout(timeout)
            .map(|event| self.handle(event))
    }

    /// Run one event to completion. Returns `false` for shutdown.
    pub fn handle(&self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::AttributeWritten { handle, data } => {
                self.on_attribute_written(handle, &data)
            }
            ControlEvent::LinkDisconnected => self.sync.on_link_disconnected(),
            ControlEvent::JoinResolved(outcome) => self.sync.on_join_outcome(outcome),
            ControlEvent::Shutdown => return false,
        }
        true
    }

    fn on_attribute_written(&self, handle: u16, data: &[u8]) {
        let Some(attribute) = Attribute::from_handle(handle) else {
            trace!("Ignoring write to unknown handle {}", handle);
            return;
        };

        if let Err(e) = self.store.write(attribute, data) {
            warn!("Rejected {} write: {}", attribute, e);
            ProvisioningStats::record(&self.stats.rejected_writes);
            return;
        }

        match attribute {
            Attribute::Ssid => {
                info!(
                    "WiFi SSID: {}",
                    String::from_utf8_lossy(&self.store.read(Attribute::Ssid))
                );
            }
            Attribute::Password => {
                info!("WiFi password received");
                self.sync.on_credentials_ready();
            }
            Attribute::Status => {
                let requested = data.first().is_some_and(|&b| b != 0);
                self.sync.on_status_write(requested);
            }
        }
    }
}
