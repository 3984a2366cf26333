//! Widget Sync Adapter
//!
//! The per-widget-instance facade activity UIs talk to. A [`WidgetSync`]
//! starts and stops the widget's room, reports what the registry knows about
//! it, and wakes its owner whenever that changes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::Shared;
use crate::error::{Result, SyncError};
use crate::protocol::{ClientEvent, CreateRoomReply, RoomType, decode_reply, events};
use crate::registry::{RoomMap, RoomRecord};

/// Everything a widget renders from, in one value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetState {
    pub has_room: bool,
    pub is_active: bool,
    pub is_starting: bool,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<SyncError>,
    pub participant_count: u32,
    pub recovery_data: Option<RoomRecord>,
}

fn serialize_error<S: serde::Serializer>(
    err: &Option<SyncError>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match err {
        Some(err) => s.serialize_some(&err.to_string()),
        None => s.serialize_none(),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct LocalState {
    starting: bool,
    error: Option<SyncError>,
}

pub struct WidgetSync {
    shared: Arc<Shared>,
    room_type: RoomType,
    widget_id: String,
    local: watch::Sender<LocalState>,
    local_rx: watch::Receiver<LocalState>,
    rooms_rx: watch::Receiver<RoomMap>,
    mounted: AtomicBool,
}

impl WidgetSync {
    pub(crate) fn new(shared: Arc<Shared>, room_type: RoomType, widget_id: String) -> Self {
        let (local, local_rx) = watch::channel(LocalState::default());
        let rooms_rx = shared.registry.subscribe();
        Self {
            shared,
            room_type,
            widget_id,
            local,
            local_rx,
            rooms_rx,
            mounted: AtomicBool::new(false),
        }
    }

    pub fn widget_id(&self) -> &str {
        &self.widget_id
    }

    pub fn room_type(&self) -> &RoomType {
        &self.room_type
    }

    pub fn has_room(&self) -> bool {
        self.shared.registry.contains(&self.widget_id)
    }

    pub fn is_active(&self) -> bool {
        self.shared
            .registry
            .get(&self.widget_id)
            .is_some_and(|r| r.is_active)
    }

    pub fn is_starting(&self) -> bool {
        self.local.borrow().starting
    }

    /// Error from the last `start()`, cleared by the next one.
    pub fn error(&self) -> Option<SyncError> {
        self.local.borrow().error.clone()
    }

    pub fn participant_count(&self) -> u32 {
        self.shared
            .registry
            .get(&self.widget_id)
            .map_or(0, |r| r.participant_count)
    }

    /// This widget's entry in the recovery snapshot, if the last recovery
    /// returned one. Never reflects later live updates.
    pub fn recovery_data(&self) -> Option<RoomRecord> {
        self.shared.registry.recovery_data(&self.widget_id)
    }

    pub fn state(&self) -> WidgetState {
        let record = self.shared.registry.get(&self.widget_id);
        let local = self.local.borrow().clone();
        WidgetState {
            has_room: record.is_some(),
            is_active: record.as_ref().is_some_and(|r| r.is_active),
            is_starting: local.starting,
            error: local.error,
            participant_count: record.map_or(0, |r| r.participant_count),
            recovery_data: self.recovery_data(),
        }
    }

    /// Wait for the next registry or local change and return the new state.
    pub async fn changed(&mut self) -> Result<WidgetState> {
        tokio::select! {
            r = self.rooms_rx.changed() => r.map_err(|_| SyncError::Shutdown)?,
            r = self.local_rx.changed() => r.map_err(|_| SyncError::Shutdown)?,
        }
        self.rooms_rx.mark_unchanged();
        self.local_rx.mark_unchanged();
        Ok(self.state())
    }

    /// Create this widget's room, creating the session first if needed.
    ///
    /// Waits while a recovery or its orphan cleanup is pending. A call while
    /// another `start()` is in flight, or while the room exists, does nothing.
    /// The room counts as present only once the relay broadcasts it.
    pub async fn start(&self) -> Result<()> {
        if self.has_room() {
            return Ok(());
        }
        let mut claimed = false;
        self.local.send_if_modified(|s| {
            if s.starting {
                return false;
            }
            s.starting = true;
            s.error = None;
            claimed = true;
            true
        });
        if !claimed {
            debug!(widget_id = %self.widget_id, "start already in progress");
            return Ok(());
        }

        let result = self.create_room().await;
        if let Err(e) = &result {
            warn!(widget_id = %self.widget_id, error = %e, "room start failed");
        }
        self.local.send_modify(|s| {
            s.starting = false;
            s.error = result.as_ref().err().cloned();
        });
        result
    }

    async fn create_room(&self) -> Result<()> {
        self.shared.recovery.wait_for_gate().await?;

        // A lost recovery leaves no session; a new one is created here.
        let handle = self.shared.ensure_session().await?;
        if self.has_room() {
            return Ok(());
        }

        let event = ClientEvent::CreateRoom {
            code: handle.code.to_string(),
            room_type: self.room_type.clone(),
            widget_id: self.widget_id.clone(),
        };
        let data = self
            .shared
            .transport
            .request(&event, self.shared.config.request_timeout)
            .await?;
        let reply: CreateRoomReply = decode_reply(events::CREATE_ROOM, data)?;
        if !reply.success {
            return Err(SyncError::RoomCreateRejected(
                reply
                    .error
                    .unwrap_or_else(|| "Failed to create room".to_string()),
            ));
        }
        info!(
            code = %handle.code,
            widget_id = %self.widget_id,
            room_type = %self.room_type,
            existing = reply.is_existing,
            "room start acknowledged"
        );
        Ok(())
    }

    /// Ask the relay to close the room. Local state follows the broadcast.
    pub fn stop(&self) -> bool {
        self.emit_for_room(|code, room_type, widget_id| ClientEvent::CloseRoom {
            code,
            room_type,
            widget_id,
        })
    }

    pub fn set_active(&self, is_active: bool) -> bool {
        self.emit_for_room(|code, room_type, widget_id| ClientEvent::UpdateWidgetState {
            code,
            room_type,
            widget_id,
            is_active,
        })
    }

    /// Participant side: subscribe to this room's traffic.
    pub fn join_room(&self) -> bool {
        self.emit_for_room(|code, room_type, widget_id| ClientEvent::JoinRoom {
            code,
            room_type,
            widget_id,
        })
    }

    pub fn leave_room(&self) -> bool {
        self.emit_for_room(|code, room_type, widget_id| ClientEvent::LeaveRoom {
            code,
            room_type,
            widget_id,
        })
    }

    fn emit_for_room(&self, build: impl FnOnce(String, RoomType, String) -> ClientEvent) -> bool {
        let Some(handle) = self.shared.sessions.live() else {
            debug!(widget_id = %self.widget_id, "no session, nothing to emit");
            return false;
        };
        self.shared.transport.emit(&build(
            handle.code.to_string(),
            self.room_type.clone(),
            self.widget_id.clone(),
        ))
    }

    /// The widget is on screen. Counts as rendered for orphan cleanup.
    pub fn mount(&self) {
        if !self.mounted.swap(true, Ordering::SeqCst) {
            self.shared.mounts.mount(&self.widget_id);
        }
    }

    /// The widget left the screen. The room is closed one scheduler tick
    /// later unless an adapter for the same widget id mounted meanwhile.
    pub fn unmount(&self) {
        if !self.mounted.swap(false, Ordering::SeqCst) {
            return;
        }
        if self.shared.mounts.unmount(&self.widget_id) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = self.shared.clone();
        let room_type = self.room_type.clone();
        let widget_id = self.widget_id.clone();
        runtime.spawn(async move {
            tokio::task::yield_now().await;
            if shared.mounts.is_mounted(&widget_id) || !shared.registry.contains(&widget_id) {
                debug!(widget_id = %widget_id, "remounted or gone, keeping room");
                return;
            }
            let Some(handle) = shared.sessions.live() else {
                return;
            };
            info!(widget_id = %widget_id, "widget unmounted, closing room");
            shared.transport.emit(&ClientEvent::CloseRoom {
                code: handle.code.to_string(),
                room_type,
                widget_id,
            });
        });
    }
}

impl Drop for WidgetSync {
    fn drop(&mut self) {
        self.unmount();
    }
}
