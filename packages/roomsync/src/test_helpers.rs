use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};
use crate::existence::ExistenceCheck;
use crate::lock;
use crate::protocol::Frame;
use crate::session::SessionCode;
use crate::transport::{Channel, ChannelEvent, Transport};

#[derive(Default)]
struct MockLink {
    connected: bool,
    connection_id: Option<String>,
    listening: HashSet<String>,
    sent: Vec<Frame>,
}

/// Scripted relay link. Tests drive connects, drops and inbound traffic by
/// hand and inspect what the client sent.
///
/// Like a real channel, inbound events are only delivered for names the
/// current connection listens to, and the filter resets on every connect.
pub struct MockChannel {
    events_tx: mpsc::Sender<ChannelEvent>,
    link: Mutex<MockLink>,
    sent_tx: mpsc::UnboundedSender<Frame>,
    sent_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl MockChannel {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<ChannelEvent>) {
        let (events_tx, events_rx) = mpsc::channel(crate::transport::ws::EVENT_QUEUE_CAPACITY);
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            events_tx,
            link: Mutex::new(MockLink::default()),
            sent_tx,
            sent_rx: tokio::sync::Mutex::new(sent_rx),
        });
        (channel, events_rx)
    }

    pub async fn connect(&self, connection_id: &str) {
        {
            let mut link = lock(&self.link);
            link.connected = true;
            link.connection_id = Some(connection_id.to_string());
            link.listening.clear();
        }
        self.push(ChannelEvent::Connecting).await;
        self.push(ChannelEvent::Connected {
            connection_id: connection_id.to_string(),
        })
        .await;
    }

    pub async fn drop_link(&self, reason: &str) {
        {
            let mut link = lock(&self.link);
            link.connected = false;
            link.connection_id = None;
            link.listening.clear();
        }
        self.push(ChannelEvent::Disconnected {
            reason: reason.to_string(),
        })
        .await;
    }

    /// Push a relay broadcast. Returns false if nobody listens for it on
    /// this connection.
    pub async fn deliver(&self, event: &str, data: Value) -> bool {
        if !self.is_listening(event) {
            return false;
        }
        self.push(ChannelEvent::Frame(Frame::Event {
            event: event.to_string(),
            data,
            ack_id: None,
        }))
        .await;
        true
    }

    pub async fn ack(&self, ack_id: u64, data: Value) {
        self.push(ChannelEvent::Frame(Frame::Ack { ack_id, data }))
            .await;
    }

    pub fn is_listening(&self, event: &str) -> bool {
        lock(&self.link).listening.contains(event)
    }

    /// Every frame sent so far, oldest first.
    pub fn sent(&self) -> Vec<Frame> {
        lock(&self.link).sent.clone()
    }

    /// Payloads of every sent event named `event`.
    pub fn sent_events(&self, event: &str) -> Vec<Value> {
        lock(&self.link)
            .sent
            .iter()
            .filter_map(|frame| match frame {
                Frame::Event { event: name, data, .. } if name == event => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Wait for the next correlated request named `event`, skipping anything
    /// else sent in between.
    pub async fn next_request(&self, event: &str) -> (u64, Value) {
        let mut rx = self.sent_rx.lock().await;
        let wait = async {
            loop {
                match rx.recv().await {
                    Some(Frame::Event {
                        event: name,
                        data,
                        ack_id: Some(ack_id),
                    }) if name == event => return (ack_id, data),
                    Some(_) => continue,
                    None => panic!("mock channel dropped"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(60), wait)
            .await
            .unwrap_or_else(|_| panic!("no {event} request was sent"))
    }

    async fn push(&self, event: ChannelEvent) {
        self.events_tx
            .send(event)
            .await
            .expect("channel event receiver dropped");
    }
}

impl Channel for MockChannel {
    fn is_connected(&self) -> bool {
        lock(&self.link).connected
    }

    fn connection_id(&self) -> Option<String> {
        lock(&self.link).connection_id.clone()
    }

    fn send(&self, frame: Frame) -> Result<()> {
        let mut link = lock(&self.link);
        if !link.connected {
            return Err(SyncError::NotConnected);
        }
        link.sent.push(frame.clone());
        let _ = self.sent_tx.send(frame);
        Ok(())
    }

    fn listen(&self, events: &[String]) {
        lock(&self.link).listening.extend(events.iter().cloned());
    }

    fn close(&self) {
        let mut link = lock(&self.link);
        link.connected = false;
        link.connection_id = None;
    }
}

/// Feed every queued channel event into a bare transport.
pub fn pump(transport: &Transport, rx: &mut mpsc::Receiver<ChannelEvent>) {
    while let Ok(event) = rx.try_recv() {
        transport.handle(&event);
    }
}

/// Let spawned tasks run until they block. Needs a paused clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Existence check with a scripted answer that counts its calls.
#[derive(Default)]
pub struct FakeExistence {
    missing: AtomicBool,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FakeExistence {
    pub fn set_exists(&self, exists: bool) {
        self.missing.store(!exists, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ExistenceCheck for FakeExistence {
    fn exists<'a>(&'a self, _code: &'a SessionCode) -> BoxFuture<'a, Result<bool>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.failing.load(Ordering::SeqCst) {
            Err(SyncError::ExistenceCheck("connection refused".into()))
        } else {
            Ok(!self.missing.load(Ordering::SeqCst))
        };
        Box::pin(async move { result })
    }
}
