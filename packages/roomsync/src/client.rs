//! The sync client: one explicitly constructed manager per relay connection.
//!
//! [`SyncClient`] owns the transport wrapper, the session handle, the room
//! registry, the recovery coordinator and the orphan reconciler. A driver task
//! feeds channel events through them in arrival order. Several clients can
//! live side by side in one process.

use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::existence::{ExistenceCheck, HttpExistenceCheck};
use crate::lock;
use crate::orphans::{MountTable, OrphanReconciler, RenderedWidgets};
use crate::protocol::{ClientEvent, RoomType, ServerEvent, events};
use crate::recovery::{ConnectAction, RecoveryContext, RecoveryCoordinator, RecoveryOutcome, RecoveryState};
use crate::registry::{RecoverySnapshot, RoomMap, RoomRecord, RoomRegistry};
use crate::session::{Identity, SessionCode, SessionHandle, SessionManager};
use crate::store::{HandleStore, MemoryStore};
use crate::transport::{Channel, ChannelEvent, LinkStatus, Transport, WsChannel};
use crate::widget::WidgetSync;

const SIGNAL_CAPACITY: usize = 64;

/// Session-level notifications for the host application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionSignal {
    Created { code: SessionCode },
    Joined { code: SessionCode, rooms: usize },
    Recovered { code: SessionCode, rooms: usize },
    /// The session could not be re-established. Fires once per loss.
    Lost {
        code: SessionCode,
        #[serde(serialize_with = "serialize_error")]
        reason: SyncError,
    },
    Closed { code: SessionCode },
}

fn serialize_error<S: serde::Serializer>(err: &SyncError, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&err.to_string())
}

pub(crate) struct Shared {
    pub(crate) config: SyncConfig,
    pub(crate) transport: Arc<Transport>,
    pub(crate) sessions: SessionManager,
    pub(crate) registry: RoomRegistry,
    pub(crate) recovery: RecoveryCoordinator,
    pub(crate) mounts: Arc<MountTable>,
    orphans: OrphanReconciler,
    rendered: Arc<dyn RenderedWidgets>,
    existence: Arc<dyn ExistenceCheck>,
    signals: broadcast::Sender<SessionSignal>,
    /// Last code announced as `Created`, so coalesced creators signal once.
    announced: Mutex<Option<SessionCode>>,
    cancel: CancellationToken,
}

impl Shared {
    fn signal(&self, signal: SessionSignal) {
        debug!(signal = ?signal, "session signal");
        // No subscribers is fine.
        let _ = self.signals.send(signal);
    }

    /// The live session, created on demand.
    pub(crate) async fn ensure_session(&self) -> Result<SessionHandle> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Shutdown);
        }
        let handle = self.sessions.create_session().await?;
        let fresh = {
            let mut announced = lock(&self.announced);
            if announced.as_ref() == Some(&handle.code) {
                false
            } else {
                *announced = Some(handle.code.clone());
                true
            }
        };
        if fresh && handle.is_host {
            self.signal(SessionSignal::Created {
                code: handle.code.clone(),
            });
        }
        Ok(handle)
    }

    /// Drop every piece of session state, locally and on disk.
    fn teardown(&self) -> Option<SessionHandle> {
        let previous = self.sessions.clear();
        self.registry.clear();
        self.recovery.reset_gate();
        lock(&self.announced).take();
        previous
    }

    fn on_broadcast(&self, event: &str, data: &Value) {
        let parsed = match ServerEvent::parse(event, data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(event, error = %e, "dropping malformed broadcast");
                return;
            }
        };
        if let ServerEvent::Closed {} = parsed {
            if let Some(handle) = self.teardown() {
                info!(code = %handle.code, "session closed by relay");
                self.signal(SessionSignal::Closed { code: handle.code });
            }
            return;
        }
        if self.registry.apply(&parsed) {
            debug!(event, "registry updated");
        }
    }

    fn on_channel_event(self: &Arc<Self>, event: &ChannelEvent) {
        match event {
            ChannelEvent::Connecting => self.recovery.on_connecting(),
            ChannelEvent::Disconnected { .. } => self.recovery.on_disconnected(),
            ChannelEvent::Connected { connection_id } => {
                let epoch = self.transport.status().epoch;
                debug!(connection_id = %connection_id, epoch, "connected");
                let handle = self.sessions.current();
                match self.recovery.on_connected(epoch, handle.as_ref()) {
                    ConnectAction::Nothing => {}
                    ConnectAction::Reclaim(handle) => {
                        tokio::spawn(reclaim(self.clone(), handle));
                    }
                    ConnectAction::Rejoin(handle) => {
                        tokio::spawn(rejoin_on_first_connect(self.clone(), handle));
                    }
                    ConnectAction::Recover { epoch } => {
                        tokio::spawn(recover(self.clone(), epoch));
                    }
                }
            }
            ChannelEvent::Frame(_) => {}
        }
    }

    /// Run orphan cleanup for `epoch` and open the gate.
    ///
    /// Only runs while `epoch` is the live connection and its cleanup is still
    /// pending, and only for the host. Otherwise it just releases the gate
    /// held for `epoch`, if any.
    pub(crate) fn reconcile_orphans(&self, epoch: u64) -> Vec<String> {
        let status = self.transport.status();
        let due = status.connected
            && status.epoch == epoch
            && self.recovery.gate().cleanup_pending == Some(epoch);
        let orphans = match self.sessions.current() {
            Some(handle) if due && handle.is_host => self.orphans.reconcile(
                epoch,
                &handle.code,
                &self.registry,
                &*self.rendered,
                &self.transport,
            ),
            _ => {
                debug!(epoch, current_epoch = status.epoch, "orphan cleanup not due, skipped");
                Vec::new()
            }
        };
        self.recovery.cleanup_done(epoch);
        orphans
    }
}

async fn reclaim(shared: Arc<Shared>, handle: SessionHandle) {
    if shared.sessions.discard_expired().is_some() {
        return;
    }
    match shared.sessions.reclaim(&handle).await {
        Ok(current) => {
            info!(code = %current.code, "session reclaimed");
            if current.code != handle.code {
                *lock(&shared.announced) = Some(current.code.clone());
                shared.signal(SessionSignal::Created { code: current.code });
            }
        }
        Err(reason @ SyncError::ServerRejected { .. }) => {
            shared.teardown();
            shared.signal(SessionSignal::Lost {
                code: handle.code,
                reason,
            });
        }
        Err(e) => warn!(code = %handle.code, error = %e, "session reclaim failed"),
    }
}

async fn rejoin_on_first_connect(shared: Arc<Shared>, handle: SessionHandle) {
    if shared.sessions.discard_expired().is_some() {
        return;
    }
    let timeout = shared.config.request_timeout;
    match shared.sessions.join(&handle.code, timeout).await {
        Ok(reply) => {
            let rooms = reply.active_rooms.len();
            shared.registry.seed(reply.active_rooms);
            info!(code = %handle.code, rooms, "rejoined session");
            shared.signal(SessionSignal::Joined {
                code: handle.code,
                rooms,
            });
        }
        Err(reason) if reason.is_session_fatal() => {
            shared.teardown();
            shared.signal(SessionSignal::Lost {
                code: handle.code,
                reason,
            });
        }
        Err(e) => warn!(code = %handle.code, error = %e, "rejoin failed"),
    }
}

async fn recover(shared: Arc<Shared>, epoch: u64) {
    let ctx = RecoveryContext {
        transport: &shared.transport,
        sessions: &shared.sessions,
        registry: &shared.registry,
        existence: &*shared.existence,
        rejoin_timeout: shared.config.rejoin_timeout,
    };
    match shared.recovery.recover(&ctx, epoch).await {
        RecoveryOutcome::Recovered {
            code,
            epoch,
            snapshot,
        } => {
            shared.signal(SessionSignal::Recovered {
                code,
                rooms: snapshot.len(),
            });
            // Participants own no rooms, so there is nothing to reconcile.
            if !shared.sessions.current().is_some_and(|h| h.is_host) {
                shared.recovery.cleanup_done(epoch);
                return;
            }
            let settle = shared.config.orphan_settle;
            let shared = shared.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shared.cancel.cancelled() => {}
                    _ = tokio::time::sleep(settle) => {
                        shared.reconcile_orphans(epoch);
                    }
                }
            });
        }
        RecoveryOutcome::Lost { code, reason } => {
            lock(&shared.announced).take();
            shared.signal(SessionSignal::Lost { code, reason });
        }
        RecoveryOutcome::Skipped | RecoveryOutcome::Stale => {}
    }
}

async fn drive(shared: Arc<Shared>, mut events: mpsc::Receiver<ChannelEvent>) {
    loop {
        let event = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    info!("channel event stream ended");
                    break;
                }
            },
        };
        shared.transport.handle(&event);
        shared.on_channel_event(&event);
    }
    debug!("sync driver stopped");
}

/// Builder for [`SyncClient`].
pub struct SyncClientBuilder {
    config: SyncConfig,
    channel: Option<(Arc<dyn Channel>, mpsc::Receiver<ChannelEvent>)>,
    existence: Option<Arc<dyn ExistenceCheck>>,
    rendered: Option<Arc<dyn RenderedWidgets>>,
    store: Option<Arc<dyn HandleStore>>,
}

impl SyncClientBuilder {
    /// Use this channel instead of a WebSocket to `config.ws_url`.
    pub fn channel(mut self, channel: Arc<dyn Channel>, events: mpsc::Receiver<ChannelEvent>) -> Self {
        self.channel = Some((channel, events));
        self
    }

    /// Use this check instead of HTTP against `config.http_url`.
    pub fn existence(mut self, existence: Arc<dyn ExistenceCheck>) -> Self {
        self.existence = Some(existence);
        self
    }

    /// Source of rendered widget ids for orphan cleanup. Defaults to the
    /// widgets currently mounted through [`WidgetSync`].
    pub fn rendered_widgets(mut self, rendered: Arc<dyn RenderedWidgets>) -> Self {
        self.rendered = Some(rendered);
        self
    }

    /// Where the session handle survives restarts. Defaults to memory only.
    pub fn store(mut self, store: Arc<dyn HandleStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Wire everything up and start the driver task. Must be called inside a
    /// tokio runtime.
    pub fn build(self) -> SyncClient {
        let config = self.config;
        let (channel, events) = match self.channel {
            Some(pair) => pair,
            None => {
                let (channel, events) = WsChannel::spawn(config.ws_url.clone(), config.reconnect);
                (channel as Arc<dyn Channel>, events)
            }
        };
        let existence = self
            .existence
            .unwrap_or_else(|| Arc::new(HttpExistenceCheck::new(config.http_url.clone())));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::default()));
        let mounts = Arc::new(MountTable::default());
        let rendered = self
            .rendered
            .unwrap_or_else(|| mounts.clone() as Arc<dyn RenderedWidgets>);

        let restored = match store.load() {
            Ok(restored) => restored,
            Err(e) => {
                warn!(error = %e, "failed to load persisted session");
                None
            }
        };
        let client_id = config
            .client_id
            .clone()
            .or_else(|| restored.as_ref().map(|s| s.client_id.clone()))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let transport = Arc::new(Transport::new(channel));
        let sessions = SessionManager::new(
            transport.clone(),
            store,
            Identity {
                client_id,
                display_name: config.display_name.clone(),
            },
            config.session_ttl,
            config.request_timeout,
        );
        if let Some(stored) = restored {
            info!(code = %stored.handle.code, is_host = stored.handle.is_host, "restored session handle");
            sessions.restore(stored.handle);
            sessions.discard_expired();
        }

        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        let shared = Arc::new(Shared {
            config,
            transport,
            sessions,
            registry: RoomRegistry::new(),
            recovery: RecoveryCoordinator::new(),
            mounts,
            orphans: OrphanReconciler::default(),
            rendered,
            existence,
            signals,
            announced: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        if let Some(handle) = shared.sessions.current() {
            *lock(&shared.announced) = Some(handle.code);
        }

        for name in events::INBOUND {
            let weak: Weak<Shared> = Arc::downgrade(&shared);
            shared.transport.on(
                name,
                Arc::new(move |data: &Value| {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_broadcast(name, data);
                    }
                }),
            );
        }

        tokio::spawn(drive(shared.clone(), events));
        SyncClient { shared }
    }
}

pub struct SyncClient {
    shared: Arc<Shared>,
}

impl SyncClient {
    pub fn builder(config: SyncConfig) -> SyncClientBuilder {
        SyncClientBuilder {
            config,
            channel: None,
            existence: None,
            rendered: None,
            store: None,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    pub fn client_id(&self) -> String {
        self.shared.sessions.identity().client_id
    }

    /// Return the live session code, creating a session if there is none.
    /// Concurrent calls share one request.
    pub async fn create_session(&self) -> Result<SessionCode> {
        self.shared.ensure_session().await.map(|h| h.code)
    }

    /// Join an existing session as a participant.
    pub async fn join_session(&self, code: &str, name: &str) -> Result<SessionHandle> {
        let code = SessionCode::parse(code)?;
        let shared = &self.shared;
        if !shared.existence.exists(&code).await? {
            return Err(SyncError::SessionNotFound {
                code: code.to_string(),
            });
        }
        shared.sessions.set_display_name(name);
        let reply = shared
            .sessions
            .join(&code, shared.config.request_timeout)
            .await?;

        shared.teardown();
        let handle = SessionHandle::participant(code.clone());
        shared.sessions.set(handle.clone());
        *lock(&shared.announced) = Some(code.clone());
        let rooms = reply.active_rooms.len();
        shared.registry.seed(reply.active_rooms);
        info!(code = %code, rooms, "joined session");
        shared.signal(SessionSignal::Joined { code, rooms });
        Ok(handle)
    }

    /// Tell the relay the session is over and forget it locally, whether or
    /// not the relay heard.
    pub fn close_session(&self) {
        let shared = &self.shared;
        if let Some(handle) = shared.sessions.current() {
            shared.transport.emit(&ClientEvent::Close {
                code: handle.code.to_string(),
            });
        }
        if let Some(handle) = shared.teardown() {
            info!(code = %handle.code, "session closed");
            shared.signal(SessionSignal::Closed { code: handle.code });
        }
    }

    /// The live (non-expired) session handle.
    pub fn session(&self) -> Option<SessionHandle> {
        self.shared.sessions.live()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.transport.is_connected()
    }

    pub fn link_status(&self) -> watch::Receiver<LinkStatus> {
        self.shared.transport.watch_status()
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.shared.recovery.state()
    }

    pub fn watch_recovery(&self) -> watch::Receiver<RecoveryState> {
        self.shared.recovery.subscribe()
    }

    pub fn signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.shared.signals.subscribe()
    }

    pub fn rooms(&self) -> RoomMap {
        self.shared.registry.rooms()
    }

    pub fn room(&self, widget_id: &str) -> Option<RoomRecord> {
        self.shared.registry.get(widget_id)
    }

    pub fn watch_rooms(&self) -> watch::Receiver<RoomMap> {
        self.shared.registry.subscribe()
    }

    pub fn recovery_snapshot(&self) -> Option<Arc<RecoverySnapshot>> {
        self.shared.registry.snapshot()
    }

    pub fn recovery_data(&self, widget_id: &str) -> Option<RoomRecord> {
        self.shared.registry.recovery_data(widget_id)
    }

    /// Adapter for one widget instance.
    pub fn widget(&self, room_type: RoomType, widget_id: impl Into<String>) -> WidgetSync {
        WidgetSync::new(self.shared.clone(), room_type, widget_id.into())
    }

    /// Run orphan cleanup for the current connection now, instead of waiting
    /// for the post-recovery delay. Does nothing unless a recovery on this
    /// connection is still waiting for its cleanup.
    pub fn reconcile_orphans(&self) -> Vec<String> {
        let epoch = self.shared.transport.status().epoch;
        self.shared.reconcile_orphans(epoch)
    }

    /// Stop the driver and close the channel. The session handle is kept so
    /// a later client can pick it up from the store.
    pub fn shutdown(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        info!("shutting down sync client");
        self.shared.cancel.cancel();
        self.shared.transport.close();
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoredSession;
    use crate::test_helpers::{FakeExistence, MockChannel, settle};
    use chrono::{TimeDelta, Utc};
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;

    struct Harness {
        client: SyncClient,
        channel: Arc<MockChannel>,
        existence: Arc<FakeExistence>,
        store: Arc<MemoryStore>,
    }

    fn harness_with(store: MemoryStore, rendered: Option<Arc<dyn RenderedWidgets>>) -> Harness {
        let (channel, events) = MockChannel::new();
        let existence = Arc::new(FakeExistence::default());
        let store = Arc::new(store);
        let config = SyncConfig {
            client_id: Some("client-1".into()),
            display_name: "Presenter".into(),
            ..SyncConfig::default()
        };
        let mut builder = SyncClient::builder(config)
            .channel(channel.clone(), events)
            .existence(existence.clone())
            .store(store.clone());
        if let Some(rendered) = rendered {
            builder = builder.rendered_widgets(rendered);
        }
        Harness {
            client: builder.build(),
            channel,
            existence,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(MemoryStore::default(), None)
    }

    fn stored(code: &str, is_host: bool) -> StoredSession {
        let code = SessionCode::parse(code).unwrap();
        StoredSession {
            handle: if is_host {
                SessionHandle::host(code)
            } else {
                SessionHandle::participant(code)
            },
            client_id: "client-1".into(),
        }
    }

    impl Harness {
        async fn connect(&self, id: &str) {
            self.channel.connect(id).await;
            settle().await;
        }

        async fn reconnect(&self, id: &str) {
            self.channel.drop_link("reset").await;
            settle().await;
            self.connect(id).await;
        }

        async fn create_session(&self, code: &str) -> SessionCode {
            let create = self.client.create_session();
            let answer = async {
                let (ack_id, _) = self.channel.next_request(events::CREATE).await;
                self.channel
                    .ack(ack_id, json!({"success": true, "code": code}))
                    .await;
            };
            let (result, ()) = tokio::join!(create, answer);
            result.unwrap()
        }

        async fn broadcast(&self, event: &str, data: Value) {
            assert!(self.channel.deliver(event, data).await, "{event} not listened");
            settle().await;
        }

        async fn answer_recover(&self, rooms: Value) {
            let (ack_id, _) = self.channel.next_request(events::RECOVER).await;
            self.channel
                .ack(ack_id, json!({"success": true, "activeRooms": rooms}))
                .await;
            settle().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_creates_share_one_request() {
        let h = harness();
        h.connect("conn-1").await;
        let mut signals = h.client.signals();

        let first = h.client.create_session();
        let second = h.client.create_session();
        let answer = async {
            let (ack_id, _) = h.channel.next_request(events::CREATE).await;
            settle().await;
            h.channel
                .ack(ack_id, json!({"success": true, "code": "3F9KP"}))
                .await;
        };
        let (a, b, ()) = tokio::join!(first, second, answer);
        assert_eq!(a.unwrap().as_str(), "3F9KP");
        assert_eq!(b.unwrap().as_str(), "3F9KP");
        assert_eq!(h.channel.sent_events(events::CREATE).len(), 1);

        // Signalled once
        assert!(matches!(signals.try_recv(), Ok(SessionSignal::Created { .. })));
        assert!(signals.try_recv().is_err());

        // Live handle answers locally from now on
        assert_eq!(h.client.create_session().await.unwrap().as_str(), "3F9KP");
        assert_eq!(h.channel.sent_events(events::CREATE).len(), 1);
        assert!(h.store.load().unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_handle_gets_fresh_session() {
        let mut old = stored("3F9KP", true);
        old.handle.created_at = Utc::now() - TimeDelta::hours(2) - TimeDelta::milliseconds(1);
        let h = harness_with(MemoryStore::with(old), None);
        assert!(h.client.session().is_none());

        h.connect("conn-1").await;
        // Nothing to reclaim
        assert!(h.channel.sent_events(events::CREATE).is_empty());

        let code = h.create_session("7QW2D").await;
        assert_eq!(code.as_str(), "7QW2D");
        let sent = h.channel.sent_events(events::CREATE);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].get("existingCode").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn first_connect_with_persisted_handle_does_not_recover() {
        let h = harness_with(MemoryStore::with(stored("3F9KP", true)), None);
        h.connect("conn-1").await;

        assert!(h.channel.sent_events(events::RECOVER).is_empty());
        assert_eq!(h.existence.calls(), 0);
        assert_eq!(h.client.recovery_state(), RecoveryState::Connected);

        // The host re-announces its code instead
        let (ack_id, data) = h.channel.next_request(events::CREATE).await;
        assert_eq!(data["existingCode"], "3F9KP");
        h.channel
            .ack(ack_id, json!({"success": true, "code": "3F9KP"}))
            .await;
        settle().await;
        assert_eq!(h.client.session().unwrap().code.as_str(), "3F9KP");
    }

    #[tokio::test(start_paused = true)]
    async fn restored_participant_rejoins_on_first_connect() {
        let h = harness_with(MemoryStore::with(stored("3F9KP", false)), None);
        h.connect("conn-1").await;

        let (ack_id, data) = h.channel.next_request(events::JOIN).await;
        assert_eq!(data["clientId"], "client-1");
        h.channel
            .ack(
                ack_id,
                json!({"success": true, "activeRooms": [{"roomType": "poll", "widgetId": "w1", "isActive": true}]}),
            )
            .await;
        settle().await;

        assert!(h.client.room("w1").is_some());
        assert!(h.client.recovery_snapshot().is_none());
        assert!(h.channel.sent_events(events::RECOVER).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_on_recovery_clears_everything_once() {
        let h = harness();
        h.connect("conn-1").await;
        h.create_session("3F9KP").await;
        h.broadcast(
            events::ROOM_CREATED,
            json!({"roomType": "poll", "widgetId": "w1", "roomData": {}}),
        )
        .await;
        assert!(h.client.room("w1").is_some());

        let mut signals = h.client.signals();
        h.existence.set_exists(false);
        h.reconnect("conn-2").await;

        assert!(h.client.session().is_none());
        assert!(h.client.rooms().is_empty());
        assert!(h.client.recovery_snapshot().is_none());
        assert!(h.store.load().unwrap().is_none());
        assert_eq!(h.client.recovery_state(), RecoveryState::Lost);

        let mut lost = 0;
        while let Ok(signal) = signals.try_recv() {
            if matches!(signal, SessionSignal::Lost { .. }) {
                lost += 1;
            }
        }
        assert_eq!(lost, 1);

        // Another reconnect without a session is a plain connect, no second loss
        h.reconnect("conn-3").await;
        assert_eq!(h.client.recovery_state(), RecoveryState::Connected);
        assert!(signals.try_recv().is_err());
        assert_eq!(h.existence.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_state_change_creates_minimal_record() {
        let h = harness();
        h.connect("conn-1").await;
        h.broadcast(
            events::WIDGET_STATE_CHANGED,
            json!({"roomType": "rtFeedback", "widgetId": "ghost", "isActive": true}),
        )
        .await;
        let record = h.client.room("ghost").unwrap();
        assert!(record.is_active);
        assert_eq!(record.room_type, RoomType::RtFeedback);
        assert_eq!(record.participant_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_broadcast_is_ignored() {
        let h = harness();
        h.connect("conn-1").await;
        h.broadcast(events::ROOM_CREATED, json!({"widgetId": 7})).await;
        assert!(h.client.rooms().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn orphan_cleanup_runs_once_per_epoch() {
        let rendered: Arc<dyn RenderedWidgets> = Arc::new(|| HashSet::from(["w1".to_string()]));
        let h = harness_with(MemoryStore::default(), Some(rendered));
        h.connect("conn-1").await;
        h.create_session("3F9KP").await;
        h.reconnect("conn-2").await;
        h.answer_recover(json!([
            {"roomType": "poll", "widgetId": "w1", "isActive": true},
            {"roomType": "questions", "widgetId": "w2", "isActive": false}
        ]))
        .await;
        assert_eq!(h.client.recovery_state(), RecoveryState::Recovered);
        assert!(h.channel.sent_events(events::CLOSE_ROOM).is_empty());

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let closes = h.channel.sent_events(events::CLOSE_ROOM);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0]["widgetId"], "w2");
        assert_eq!(closes[0]["roomType"], "questions");
        assert!(h.client.room("w2").is_none());
        // Snapshot keeps what was recovered
        assert!(h.client.recovery_data("w2").is_some());

        assert!(h.client.reconcile_orphans().is_empty());
        assert_eq!(h.channel.sent_events(events::CLOSE_ROOM).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_close_tears_down_and_signals() {
        let h = harness();
        h.connect("conn-1").await;
        h.create_session("3F9KP").await;
        let mut signals = h.client.signals();

        h.broadcast(events::CLOSED, json!({})).await;
        assert!(h.client.session().is_none());
        assert_eq!(
            signals.try_recv().unwrap(),
            SessionSignal::Closed {
                code: SessionCode::parse("3F9KP").unwrap()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_session_is_unconditional() {
        let h = harness();
        h.connect("conn-1").await;
        h.create_session("3F9KP").await;
        h.broadcast(
            events::ROOM_CREATED,
            json!({"roomType": "poll", "widgetId": "w1"}),
        )
        .await;

        h.channel.drop_link("offline").await;
        settle().await;
        h.client.close_session();

        // Emit was dropped, local state is gone regardless
        assert!(h.channel.sent_events(events::CLOSE).is_empty());
        assert!(h.client.session().is_none());
        assert!(h.client.rooms().is_empty());
        assert!(h.store.load().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn join_checks_existence_first() {
        let h = harness();
        h.connect("conn-1").await;
        h.existence.set_exists(false);
        let err = h.client.join_session("3f9kp", "Ada").await.unwrap_err();
        assert_eq!(
            err,
            SyncError::SessionNotFound {
                code: "3F9KP".into()
            }
        );
        assert!(h.channel.sent_events(events::JOIN).is_empty());

        assert!(matches!(
            h.client.join_session("bad", "Ada").await,
            Err(SyncError::InvalidCode(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn join_seeds_registry_and_persists_participant() {
        let h = harness();
        h.connect("conn-1").await;
        let join = h.client.join_session("3F9KP", "Ada");
        let answer = async {
            let (ack_id, data) = h.channel.next_request(events::JOIN).await;
            assert_eq!(data["name"], "Ada");
            h.channel
                .ack(
                    ack_id,
                    json!({"success": true, "activeRooms": [
                        {"roomType": "linkShare", "widgetId": "w5", "isActive": true, "participantCount": 3}
                    ]}),
                )
                .await;
        };
        let (handle, ()) = tokio::join!(join, answer);
        let handle = handle.unwrap();
        assert!(!handle.is_host);
        assert_eq!(h.client.room("w5").unwrap().participant_count, 3);
        assert!(!h.store.load().unwrap().unwrap().handle.is_host);
    }

    #[tokio::test(start_paused = true)]
    async fn participant_recovers_with_join() {
        let h = harness();
        h.connect("conn-1").await;
        let join = h.client.join_session("3F9KP", "Ada");
        let answer = async {
            let (ack_id, _) = h.channel.next_request(events::JOIN).await;
            h.channel
                .ack(ack_id, json!({"success": true, "activeRooms": []}))
                .await;
        };
        let (joined, ()) = tokio::join!(join, answer);
        joined.unwrap();

        h.reconnect("conn-2").await;
        let (ack_id, data) = h.channel.next_request(events::JOIN).await;
        assert_eq!(data["code"], "3F9KP");
        h.channel
            .ack(ack_id, json!({"success": true, "activeRooms": []}))
            .await;
        settle().await;
        assert_eq!(h.client.recovery_state(), RecoveryState::Recovered);
        assert!(h.channel.sent_events(events::RECOVER).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn participant_recovery_keeps_host_rooms() {
        let h = harness();
        h.connect("conn-1").await;
        let rooms = json!([{"roomType": "poll", "widgetId": "w1", "isActive": true}]);
        let join = h.client.join_session("3F9KP", "Ada");
        let answer = async {
            let (ack_id, _) = h.channel.next_request(events::JOIN).await;
            h.channel
                .ack(ack_id, json!({"success": true, "activeRooms": rooms}))
                .await;
        };
        let (joined, ()) = tokio::join!(join, answer);
        joined.unwrap();

        h.reconnect("conn-2").await;
        let (ack_id, _) = h.channel.next_request(events::JOIN).await;
        h.channel
            .ack(ack_id, json!({"success": true, "activeRooms": rooms}))
            .await;
        settle().await;
        assert_eq!(h.client.recovery_state(), RecoveryState::Recovered);
        assert!(h.client.shared.recovery.gate().is_open());

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(h.channel.sent_events(events::CLOSE_ROOM).is_empty());
        assert!(h.client.room("w1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_from_a_dropped_connection_does_not_run_later() {
        let rendered: Arc<dyn RenderedWidgets> = Arc::new(HashSet::<String>::new);
        let h = harness_with(MemoryStore::default(), Some(rendered));
        h.connect("conn-1").await;
        h.create_session("3F9KP").await;
        h.reconnect("conn-2").await;
        h.answer_recover(json!([{"roomType": "poll", "widgetId": "w1", "isActive": true}]))
            .await;

        // Link drops inside the settle window; the next recovery is left pending
        h.reconnect("conn-3").await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(h.client.recovery_state(), RecoveryState::Recovering);
        assert!(h.channel.sent_events(events::CLOSE_ROOM).is_empty());
        assert!(h.client.room("w1").is_some());

        h.answer_recover(json!([{"roomType": "poll", "widgetId": "w1", "isActive": true}]))
            .await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let closes = h.channel.sent_events(events::CLOSE_ROOM);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0]["widgetId"], "w1");
        assert!(h.client.shared.recovery.gate().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_cleanup_needs_a_pending_recovery() {
        let rendered: Arc<dyn RenderedWidgets> = Arc::new(HashSet::<String>::new);
        let h = harness_with(MemoryStore::default(), Some(rendered));
        h.connect("conn-1").await;
        h.create_session("3F9KP").await;
        h.broadcast(
            events::ROOM_CREATED,
            json!({"roomType": "poll", "widgetId": "w1"}),
        )
        .await;

        assert!(h.client.reconcile_orphans().is_empty());
        assert!(h.channel.sent_events(events::CLOSE_ROOM).is_empty());
        assert!(h.client.room("w1").is_some());
    }

    fn count_lost(signals: &mut broadcast::Receiver<SessionSignal>) -> usize {
        let mut lost = 0;
        while let Ok(signal) = signals.try_recv() {
            if matches!(signal, SessionSignal::Lost { .. }) {
                lost += 1;
            }
        }
        lost
    }

    #[tokio::test(start_paused = true)]
    async fn existence_check_error_loses_session_once() {
        let h = harness();
        h.connect("conn-1").await;
        h.create_session("3F9KP").await;
        h.broadcast(
            events::ROOM_CREATED,
            json!({"roomType": "poll", "widgetId": "w1"}),
        )
        .await;

        let mut signals = h.client.signals();
        h.existence.set_failing(true);
        h.reconnect("conn-2").await;

        assert_eq!(h.client.recovery_state(), RecoveryState::Lost);
        assert!(h.client.session().is_none());
        assert!(h.client.rooms().is_empty());
        assert!(h.client.recovery_snapshot().is_none());
        assert!(h.store.load().unwrap().is_none());
        assert!(h.channel.sent_events(events::RECOVER).is_empty());
        assert_eq!(count_lost(&mut signals), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_recover_ack_loses_session_once() {
        let h = harness();
        h.connect("conn-1").await;
        h.create_session("3F9KP").await;
        h.reconnect("conn-2").await;
        h.answer_recover(json!([{"roomType": "poll", "widgetId": "w1", "isActive": true}]))
            .await;
        assert!(h.client.recovery_snapshot().is_some());

        let mut signals = h.client.signals();
        h.reconnect("conn-3").await;
        let (ack_id, _) = h.channel.next_request(events::RECOVER).await;
        h.channel
            .ack(ack_id, json!({"success": false, "error": "Session not found"}))
            .await;
        settle().await;

        assert_eq!(h.client.recovery_state(), RecoveryState::Lost);
        assert!(h.client.session().is_none());
        assert!(h.client.rooms().is_empty());
        assert!(h.client.recovery_snapshot().is_none());
        assert!(h.store.load().unwrap().is_none());
        assert_eq!(count_lost(&mut signals), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn session_3f9kp_survives_a_disconnect() {
        let h = harness();
        let mut recovery = h.client.watch_recovery();

        // t=0: session created
        h.connect("conn-1").await;
        assert_eq!(h.create_session("3F9KP").await.as_str(), "3F9KP");

        // t=1: widget A starts its poll room
        let widget = h.client.widget(RoomType::Poll, "w1");
        widget.mount();
        let start = widget.start();
        let relay = async {
            let (ack_id, data) = h.channel.next_request(events::CREATE_ROOM).await;
            assert_eq!(data["code"], "3F9KP");
            h.channel.ack(ack_id, json!({"success": true})).await;
            h.channel
                .deliver(
                    events::ROOM_CREATED,
                    json!({"roomType": "poll", "widgetId": "w1", "roomData": {"question": "Tabs or spaces?"}}),
                )
                .await;
        };
        let (started, ()) = tokio::join!(start, relay);
        started.unwrap();
        settle().await;
        assert!(widget.has_room());

        // t=2: disconnect, t=3: reconnect
        h.channel.drop_link("network").await;
        settle().await;
        h.channel.connect("conn-2").await;
        recovery
            .wait_for(|s| *s == RecoveryState::Recovering)
            .await
            .unwrap();

        let (ack_id, data) = h.channel.next_request(events::RECOVER).await;
        assert_eq!(data["code"], "3F9KP");
        h.channel
            .ack(
                ack_id,
                json!({"success": true, "activeRooms": [
                    {"roomType": "poll", "widgetId": "w1", "isActive": true}
                ]}),
            )
            .await;
        recovery
            .wait_for(|s| *s == RecoveryState::Recovered)
            .await
            .unwrap();
        assert_eq!(h.existence.calls(), 1);
        assert!(h.client.room("w1").unwrap().is_active);
        assert!(widget.recovery_data().unwrap().is_active);

        // t=4: reconciliation finds w1 still rendered
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert!(h.channel.sent_events(events::CLOSE_ROOM).is_empty());
        assert!(widget.has_room());
        assert!(h.client.reconcile_orphans().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn independent_clients_do_not_share_state() {
        let a = harness();
        let b = harness();
        a.connect("a-1").await;
        b.connect("b-1").await;
        a.create_session("3F9KP").await;
        assert!(a.client.session().is_some());
        assert!(b.client.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_driver() {
        let h = harness();
        h.connect("conn-1").await;
        h.client.shutdown();
        settle().await;
        assert!(!h.client.is_connected());
        assert_eq!(
            h.client.create_session().await.unwrap_err(),
            SyncError::Shutdown
        );
    }
}
