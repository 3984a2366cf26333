//! Room Registry
//!
//! Local mirror of the relay's rooms, keyed by widget id, published through a
//! `watch` channel so widgets are re-notified on every change. Mutation is
//! crate-private: only inbound broadcasts, recovery, session teardown and the
//! orphan reconciler write here. Widgets read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::lock;
use crate::protocol::{RoomInfo, RoomType, ServerEvent};

/// The relay's view of one widget instance's room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub room_type: RoomType,
    pub widget_id: String,
    pub is_active: bool,
    pub room_data: Value,
    pub participant_count: u32,
}

impl RoomRecord {
    /// Placeholder for a room we heard about before its `roomCreated`.
    fn minimal(room_type: RoomType, widget_id: String) -> Self {
        Self {
            room_type,
            widget_id,
            is_active: false,
            room_data: Value::Null,
            participant_count: 0,
        }
    }
}

impl From<RoomInfo> for RoomRecord {
    fn from(info: RoomInfo) -> Self {
        Self {
            room_type: info.room_type,
            widget_id: info.widget_id,
            is_active: info.is_active,
            room_data: info.room_data,
            participant_count: info.participant_count,
        }
    }
}

pub type RoomMap = HashMap<String, RoomRecord>;

/// Rooms as they were the instant recovery succeeded. Never updated.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoverySnapshot {
    rooms: RoomMap,
    taken_at: DateTime<Utc>,
}

impl RecoverySnapshot {
    pub fn get(&self, widget_id: &str) -> Option<&RoomRecord> {
        self.rooms.get(widget_id)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn rooms(&self) -> impl Iterator<Item = &RoomRecord> {
        self.rooms.values()
    }
}

pub struct RoomRegistry {
    rooms: watch::Sender<RoomMap>,
    snapshot: Mutex<Option<Arc<RecoverySnapshot>>>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        let (rooms, _) = watch::channel(RoomMap::new());
        Self {
            rooms,
            snapshot: Mutex::new(None),
        }
    }

    pub fn get(&self, widget_id: &str) -> Option<RoomRecord> {
        self.rooms.borrow().get(widget_id).cloned()
    }

    pub fn contains(&self, widget_id: &str) -> bool {
        self.rooms.borrow().contains_key(widget_id)
    }

    pub fn rooms(&self) -> RoomMap {
        self.rooms.borrow().clone()
    }

    pub fn widget_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.borrow().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.rooms.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.borrow().is_empty()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomMap> {
        self.rooms.subscribe()
    }

    pub fn snapshot(&self) -> Option<Arc<RecoverySnapshot>> {
        lock(&self.snapshot).clone()
    }

    /// The snapshot entry for a widget, never the live record.
    pub fn recovery_data(&self, widget_id: &str) -> Option<RoomRecord> {
        lock(&self.snapshot)
            .as_ref()
            .and_then(|s| s.get(widget_id).cloned())
    }

    /// Apply one relay broadcast. Unknown widget ids in state/participant
    /// updates get a minimal record instead of an error. Returns whether the
    /// registry changed.
    pub(crate) fn apply(&self, event: &ServerEvent) -> bool {
        self.rooms.send_if_modified(|rooms| match event {
            ServerEvent::RoomCreated {
                room_type,
                widget_id,
                room_data,
            } => {
                match rooms.get_mut(widget_id) {
                    Some(existing) => {
                        existing.room_type = room_type.clone();
                        existing.room_data = room_data.clone();
                    }
                    None => {
                        rooms.insert(
                            widget_id.clone(),
                            RoomRecord {
                                room_type: room_type.clone(),
                                widget_id: widget_id.clone(),
                                is_active: true,
                                room_data: room_data.clone(),
                                participant_count: 0,
                            },
                        );
                    }
                }
                true
            }
            ServerEvent::RoomClosed { widget_id, .. } => rooms.remove(widget_id).is_some(),
            ServerEvent::WidgetStateChanged {
                room_type,
                widget_id,
                is_active,
            } => {
                let record = rooms.entry(widget_id.clone()).or_insert_with(|| {
                    debug!(widget_id = %widget_id, "state change for unknown room, creating placeholder");
                    RoomRecord::minimal(room_type.clone(), widget_id.clone())
                });
                let changed = record.is_active != *is_active;
                record.is_active = *is_active;
                changed
            }
            ServerEvent::ParticipantUpdate {
                room_type,
                widget_id,
                count,
            } => {
                let record = rooms.entry(widget_id.clone()).or_insert_with(|| {
                    debug!(widget_id = %widget_id, "participant update for unknown room, creating placeholder");
                    RoomRecord::minimal(room_type.clone(), widget_id.clone())
                });
                let changed = record.participant_count != *count;
                record.participant_count = *count;
                changed
            }
            ServerEvent::Closed {} => false,
        })
    }

    /// Rebuild from a recovery reply and take the snapshot of the result.
    pub(crate) fn restore_from_recovery(&self, rooms: Vec<RoomInfo>) -> Arc<RecoverySnapshot> {
        let map: RoomMap = rooms
            .into_iter()
            .map(|info| (info.widget_id.clone(), RoomRecord::from(info)))
            .collect();
        let snapshot = Arc::new(RecoverySnapshot {
            rooms: map.clone(),
            taken_at: Utc::now(),
        });
        *lock(&self.snapshot) = Some(snapshot.clone());
        self.rooms.send_replace(map);
        snapshot
    }

    /// Rebuild from a join reply. Joining fresh is not a recovery, so no
    /// snapshot is taken.
    pub(crate) fn seed(&self, rooms: Vec<RoomInfo>) {
        let map: RoomMap = rooms
            .into_iter()
            .map(|info| (info.widget_id.clone(), RoomRecord::from(info)))
            .collect();
        self.rooms.send_replace(map);
    }

    pub(crate) fn remove(&self, widget_id: &str) -> Option<RoomRecord> {
        let mut removed = None;
        self.rooms.send_if_modified(|rooms| {
            removed = rooms.remove(widget_id);
            removed.is_some()
        });
        removed
    }

    /// Forget every room and the recovery snapshot.
    pub(crate) fn clear(&self) {
        lock(&self.snapshot).take();
        self.rooms.send_if_modified(|rooms| {
            let had_rooms = !rooms.is_empty();
            rooms.clear();
            had_rooms
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn created(widget_id: &str) -> ServerEvent {
        ServerEvent::RoomCreated {
            room_type: RoomType::Poll,
            widget_id: widget_id.into(),
            room_data: json!({"question": "Lunch?"}),
        }
    }

    #[test]
    fn room_created_then_closed() {
        let registry = RoomRegistry::new();
        assert!(registry.apply(&created("w1")));
        let record = registry.get("w1").unwrap();
        assert!(record.is_active);
        assert_eq!(record.room_data["question"], "Lunch?");

        assert!(registry.apply(&ServerEvent::RoomClosed {
            room_type: RoomType::Poll,
            widget_id: "w1".into(),
        }));
        assert!(!registry.contains("w1"));
        // Closing again is a no-op, not an error
        assert!(!registry.apply(&ServerEvent::RoomClosed {
            room_type: RoomType::Poll,
            widget_id: "w1".into(),
        }));
    }

    #[test]
    fn state_change_before_create_yields_minimal_record() {
        let registry = RoomRegistry::new();
        registry.apply(&ServerEvent::WidgetStateChanged {
            room_type: RoomType::RtFeedback,
            widget_id: "w7".into(),
            is_active: true,
        });
        let record = registry.get("w7").unwrap();
        assert!(record.is_active);
        assert_eq!(record.participant_count, 0);
        assert_eq!(record.room_data, Value::Null);

        // The late roomCreated fills in data without clobbering state
        registry.apply(&ServerEvent::WidgetStateChanged {
            room_type: RoomType::RtFeedback,
            widget_id: "w7".into(),
            is_active: false,
        });
        registry.apply(&ServerEvent::RoomCreated {
            room_type: RoomType::RtFeedback,
            widget_id: "w7".into(),
            room_data: json!({"scale": 5}),
        });
        let record = registry.get("w7").unwrap();
        assert!(!record.is_active);
        assert_eq!(record.room_data["scale"], 5);
    }

    #[test]
    fn participant_update_for_unknown_room() {
        let registry = RoomRegistry::new();
        registry.apply(&ServerEvent::ParticipantUpdate {
            room_type: RoomType::Questions,
            widget_id: "q1".into(),
            count: 12,
        });
        assert_eq!(registry.get("q1").unwrap().participant_count, 12);
        assert!(!registry.apply(&ServerEvent::ParticipantUpdate {
            room_type: RoomType::Questions,
            widget_id: "q1".into(),
            count: 12,
        }));
    }

    #[test]
    fn snapshot_is_isolated_from_live_updates() {
        let registry = RoomRegistry::new();
        let snapshot = registry.restore_from_recovery(vec![RoomInfo {
            room_type: RoomType::Poll,
            widget_id: "w1".into(),
            is_active: true,
            room_data: Value::Null,
            participant_count: 4,
        }]);
        assert_eq!(snapshot.len(), 1);

        registry.apply(&ServerEvent::WidgetStateChanged {
            room_type: RoomType::Poll,
            widget_id: "w1".into(),
            is_active: false,
        });
        registry.apply(&ServerEvent::RoomClosed {
            room_type: RoomType::Poll,
            widget_id: "w1".into(),
        });

        assert!(!registry.contains("w1"));
        let recovered = registry.recovery_data("w1").unwrap();
        assert!(recovered.is_active);
        assert_eq!(recovered.participant_count, 4);
    }

    #[test]
    fn seed_does_not_take_snapshot() {
        let registry = RoomRegistry::new();
        registry.seed(vec![RoomInfo {
            room_type: RoomType::Poll,
            widget_id: "w1".into(),
            is_active: true,
            room_data: Value::Null,
            participant_count: 0,
        }]);
        assert!(registry.contains("w1"));
        assert!(registry.snapshot().is_none());
    }

    #[test]
    fn clear_drops_rooms_and_snapshot() {
        let registry = RoomRegistry::new();
        registry.restore_from_recovery(vec![RoomInfo {
            room_type: RoomType::Poll,
            widget_id: "w1".into(),
            is_active: true,
            room_data: Value::Null,
            participant_count: 0,
        }]);
        registry.apply(&created("w2"));
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.snapshot().is_none());
        assert!(registry.recovery_data("w1").is_none());
    }

    #[tokio::test]
    async fn subscribers_are_notified() {
        let registry = RoomRegistry::new();
        let mut rx = registry.subscribe();
        registry.apply(&created("w1"));
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().contains_key("w1"));
        assert_eq!(registry.remove("w1").unwrap().widget_id, "w1");
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_empty());
    }
}
