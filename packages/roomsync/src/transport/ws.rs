//! WebSocket [`Channel`] with automatic reconnection.
//!
//! One background task owns the socket. Each successful connect gets a fresh
//! connection id and an empty listener filter; on drop the task backs off
//! exponentially (with jitter) and tries again until the channel is closed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::channel::{Channel, ChannelEvent};
use crate::error::{Result, SyncError};
use crate::lock;
use crate::protocol::Frame;

/// Capacity of the channel-event queue feeding the sync client.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based), capped at `max`,
    /// plus up to 20% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1 << attempt.saturating_sub(1).min(10));
        let capped = exp.min(self.max);
        let jitter_ms = (capped.as_millis() as u64) / 5;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        capped + Duration::from_millis(jitter)
    }
}

#[derive(Default)]
struct Link {
    connection_id: Option<String>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    listening: HashSet<String>,
}

pub struct WsChannel {
    url: String,
    link: Arc<Mutex<Link>>,
    cancel: CancellationToken,
}

impl WsChannel {
    /// Start the connection task. Must be called inside a tokio runtime.
    pub fn spawn(
        url: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> (Arc<Self>, mpsc::Receiver<ChannelEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let channel = Arc::new(Self {
            url: url.into(),
            link: Arc::new(Mutex::new(Link::default())),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run_connection_loop(
            channel.url.clone(),
            policy,
            channel.link.clone(),
            events_tx,
            channel.cancel.clone(),
        ));

        (channel, events_rx)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Channel for WsChannel {
    fn is_connected(&self) -> bool {
        lock(&self.link).outbound.is_some()
    }

    fn connection_id(&self) -> Option<String> {
        lock(&self.link).connection_id.clone()
    }

    fn send(&self, frame: Frame) -> Result<()> {
        let link = lock(&self.link);
        let outbound = link.outbound.as_ref().ok_or(SyncError::NotConnected)?;
        outbound.send(frame).map_err(|_| SyncError::NotConnected)
    }

    fn listen(&self, events: &[String]) {
        lock(&self.link).listening.extend(events.iter().cloned());
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_connection_loop(
    url: String,
    policy: ReconnectPolicy,
    link: Arc<Mutex<Link>>,
    events_tx: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
) {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() || events_tx.send(ChannelEvent::Connecting).await.is_err() {
            break;
        }

        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
        };

        let delay = match connected {
            Ok((ws_stream, _)) => {
                attempt = 0;
                let connection_id = Uuid::new_v4().to_string();
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                {
                    let mut link = lock(&link);
                    link.connection_id = Some(connection_id.clone());
                    link.outbound = Some(out_tx);
                    link.listening.clear();
                }
                info!(url = %url, connection_id = %connection_id, "connected to relay");

                if events_tx
                    .send(ChannelEvent::Connected { connection_id })
                    .await
                    .is_err()
                {
                    break;
                }

                let reason = pump_connection(ws_stream, out_rx, &link, &events_tx, &cancel).await;

                *lock(&link) = Link::default();
                info!(url = %url, reason = %reason, "relay connection lost");
                let _ = events_tx.send(ChannelEvent::Disconnected { reason }).await;
                policy.delay(1)
            }
            Err(e) => {
                attempt += 1;
                let delay = policy.delay(attempt);
                warn!(
                    url = %url,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "relay connect failed: {}", e
                );
                delay
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!(url = %url, "connection loop stopped");
}

/// Shuttle frames until the socket ends. Returns the disconnect reason.
async fn pump_connection(
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    link: &Mutex<Link>,
    events_tx: &mpsc::Sender<ChannelEvent>,
    cancel: &CancellationToken,
) -> String {
    let (mut ws_write, mut ws_read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_write.send(Message::Close(None)).await;
                return "closed by client".to_string();
            }

            Some(frame) = out_rx.recv() => {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("dropping unencodable frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_write.send(Message::Text(json.into())).await {
                    return format!("write failed: {e}");
                }
            }

            msg = ws_read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("ignoring malformed frame: {}", e);
                                continue;
                            }
                        };
                        if let Some(name) = frame.event_name() {
                            if !lock(link).listening.contains(name) {
                                debug!(event = name, "no listener on this connection, skipped");
                                continue;
                            }
                        }
                        if events_tx.send(ChannelEvent::Frame(frame)).await.is_err() {
                            return "client dropped".to_string();
                        }
                    }
                    Some(Ok(Message::Close(_))) => return "closed by relay".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return format!("read failed: {e}"),
                    None => return "stream ended".to_string(),
                }
            }
        }
    }
}
