//! Bookkeeping over a [`Channel`]: persistent subscriptions that survive
//! reconnects, fire-and-forget emits, and one-shot correlated requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::channel::{Channel, ChannelEvent};
use crate::error::{Result, SyncError};
use crate::lock;
use crate::protocol::{ClientEvent, Frame};

/// Persistent handler for one inbound event name.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Connection status as seen by the wrapper.
///
/// `epoch` increments on every successful connect and identifies the
/// connection a piece of work was started under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub connected: bool,
    pub connection_id: Option<String>,
    pub epoch: u64,
}

struct PendingReply {
    event: &'static str,
    tx: oneshot::Sender<Result<Value>>,
}

struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<u64, PendingReply>>,
    ack_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.ack_id);
    }
}

pub struct Transport {
    channel: Arc<dyn Channel>,
    handlers: Mutex<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    pending: Mutex<HashMap<u64, PendingReply>>,
    next_id: AtomicU64,
    status: watch::Sender<LinkStatus>,
}

impl Transport {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        let (status, _) = watch::channel(LinkStatus::default());
        Self {
            channel,
            handlers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            status,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().connected && self.channel.is_connected()
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    /// Register a persistent handler. It stays attached across reconnects
    /// until [`Transport::off`] is called.
    pub fn on(&self, event: &str, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let is_new_name = {
            let mut handlers = lock(&self.handlers);
            let entry = handlers.entry(event.to_string()).or_default();
            entry.push((id, handler));
            entry.len() == 1
        };
        if is_new_name && self.is_connected() {
            self.channel.listen(&[event.to_string()]);
        }
        id
    }

    pub fn off(&self, id: SubscriptionId) {
        let mut handlers = lock(&self.handlers);
        for list in handlers.values_mut() {
            list.retain(|(sid, _)| *sid != id);
        }
        handlers.retain(|_, list| !list.is_empty());
    }

    /// Fire-and-forget. Dropped with a warning when the link is down.
    pub fn emit(&self, event: &ClientEvent) -> bool {
        if !self.is_connected() {
            warn!(event = event.name(), "emit while disconnected, dropped");
            return false;
        }
        let frame = match Frame::from_client_event(event, None) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = event.name(), error = %e, "failed to encode event");
                return false;
            }
        };
        match self.channel.send(frame) {
            Ok(()) => {
                debug!(event = event.name(), "emitted");
                true
            }
            Err(e) => {
                warn!(event = event.name(), error = %e, "emit failed, dropped");
                false
            }
        }
    }

    /// Send an event and wait for its correlated ack.
    pub async fn request(&self, event: &ClientEvent, timeout: Duration) -> Result<Value> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let name = event.name();
        let ack_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::from_client_event(event, Some(ack_id))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(ack_id, PendingReply { event: name, tx });
        // Removes the entry however this future ends, including being dropped.
        let _pending = PendingGuard {
            pending: &self.pending,
            ack_id,
        };

        self.channel.send(frame)?;
        debug!(event = name, ack_id, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::NotConnected),
            Err(_) => {
                warn!(event = name, ack_id, "request timed out");
                Err(SyncError::AckTimeout {
                    event: name,
                    timeout,
                })
            }
        }
    }

    /// Feed one channel event through the wrapper.
    pub fn handle(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::Connecting => {}
            ChannelEvent::Connected { connection_id } => {
                self.status.send_modify(|s| {
                    s.connected = true;
                    s.connection_id = Some(connection_id.clone());
                    s.epoch += 1;
                });
                self.reattach();
            }
            ChannelEvent::Disconnected { reason } => {
                self.status.send_modify(|s| {
                    s.connected = false;
                    s.connection_id = None;
                });
                self.fail_pending();
                debug!(reason = %reason, "link down");
            }
            ChannelEvent::Frame(Frame::Ack { ack_id, data }) => {
                match lock(&self.pending).remove(ack_id) {
                    Some(pending) => {
                        debug!(event = pending.event, ack_id, "ack received");
                        let _ = pending.tx.send(Ok(data.clone()));
                    }
                    None => debug!(ack_id, "ack with no pending request"),
                }
            }
            ChannelEvent::Frame(Frame::Event { event, data, .. }) => {
                self.dispatch(event, data);
            }
        }
    }

    /// Re-register every persistent event name on the current connection.
    fn reattach(&self) {
        let names: Vec<String> = lock(&self.handlers).keys().cloned().collect();
        if names.is_empty() {
            return;
        }
        self.channel.listen(&names);
        info!(
            count = names.len(),
            connection_id = ?self.channel.connection_id(),
            "reattached listeners"
        );
    }

    fn fail_pending(&self) {
        let drained: Vec<PendingReply> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        for pending in drained {
            debug!(event = pending.event, "failing pending request, link down");
            let _ = pending.tx.send(Err(SyncError::NotConnected));
        }
    }

    fn dispatch(&self, event: &str, data: &Value) {
        // Clone out so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<Handler> = match lock(&self.handlers).get(event) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => {
                debug!(event, "no handler for inbound event");
                return;
            }
        };
        for handler in handlers {
            handler(data);
        }
    }

    pub fn close(&self) {
        self.fail_pending();
        self.channel.close();
    }
}
