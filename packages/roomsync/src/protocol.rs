//! Relay Protocol Types
//!
//! Wire envelope and payloads exchanged with the relay over the duplex channel.
//! Every text message is one [`Frame`]: either a named event (optionally
//! carrying an ack id the relay must echo back) or an ack reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SyncError};

/// Event names, outbound and inbound.
pub mod events {
    pub const CREATE: &str = "session:create";
    pub const RECOVER: &str = "session:recover";
    pub const JOIN: &str = "session:join";
    pub const CLOSE: &str = "session:close";
    pub const CREATE_ROOM: &str = "session:createRoom";
    pub const CLOSE_ROOM: &str = "session:closeRoom";
    pub const UPDATE_WIDGET_STATE: &str = "session:updateWidgetState";
    pub const JOIN_ROOM: &str = "session:joinRoom";
    pub const LEAVE_ROOM: &str = "session:leaveRoom";

    pub const JOINED: &str = "session:joined";
    pub const ROOM_CREATED: &str = "session:roomCreated";
    pub const ROOM_CLOSED: &str = "session:roomClosed";
    pub const WIDGET_STATE_CHANGED: &str = "session:widgetStateChanged";
    pub const PARTICIPANT_UPDATE: &str = "session:participantUpdate";
    pub const CLOSED: &str = "session:closed";

    /// Broadcasts the client keeps persistent handlers for.
    pub const INBOUND: [&str; 5] = [
        ROOM_CREATED,
        ROOM_CLOSED,
        WIDGET_STATE_CHANGED,
        PARTICIPANT_UPDATE,
        CLOSED,
    ];
}

/// One text message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Event {
        event: String,
        #[serde(default)]
        data: Value,
        #[serde(default, rename = "ackId", skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },
    Ack {
        #[serde(rename = "ackId")]
        ack_id: u64,
        #[serde(default)]
        data: Value,
    },
}

impl Frame {
    /// Build an event frame from an outbound event.
    pub fn from_client_event(event: &ClientEvent, ack_id: Option<u64>) -> Result<Self> {
        let mut value = serde_json::to_value(event)?;
        let data = value.get_mut("data").map(Value::take).unwrap_or(Value::Null);
        Ok(Frame::Event {
            event: event.name().to_string(),
            data,
            ack_id,
        })
    }

    pub fn event_name(&self) -> Option<&str> {
        match self {
            Frame::Event { event, .. } => Some(event),
            Frame::Ack { .. } => None,
        }
    }
}

/// Kind of activity a room backs.
///
/// Unknown wire values are kept as `Other` so newer activity kinds pass
/// through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RoomType {
    Poll,
    RtFeedback,
    Questions,
    LinkShare,
    Other(String),
}

impl RoomType {
    pub fn as_str(&self) -> &str {
        match self {
            RoomType::Poll => "poll",
            RoomType::RtFeedback => "rtFeedback",
            RoomType::Questions => "questions",
            RoomType::LinkShare => "linkShare",
            RoomType::Other(s) => s,
        }
    }
}

impl From<String> for RoomType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "poll" => RoomType::Poll,
            "rtFeedback" => RoomType::RtFeedback,
            "questions" => RoomType::Questions,
            "linkShare" => RoomType::LinkShare,
            _ => RoomType::Other(s),
        }
    }
}

impl From<RoomType> for String {
    fn from(rt: RoomType) -> Self {
        match rt {
            RoomType::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl FromStr for RoomType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(RoomType::from(s.to_string()))
    }
}

impl fmt::Display for RoomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages sent FROM the client TO the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "session:create", rename_all = "camelCase")]
    CreateSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        existing_code: Option<String>,
    },
    #[serde(rename = "session:recover")]
    Recover { code: String },
    #[serde(rename = "session:join", rename_all = "camelCase")]
    Join {
        code: String,
        name: String,
        client_id: String,
    },
    #[serde(rename = "session:close")]
    Close { code: String },
    #[serde(rename = "session:createRoom", rename_all = "camelCase")]
    CreateRoom {
        code: String,
        room_type: RoomType,
        widget_id: String,
    },
    #[serde(rename = "session:closeRoom", rename_all = "camelCase")]
    CloseRoom {
        code: String,
        room_type: RoomType,
        widget_id: String,
    },
    #[serde(rename = "session:updateWidgetState", rename_all = "camelCase")]
    UpdateWidgetState {
        code: String,
        room_type: RoomType,
        widget_id: String,
        is_active: bool,
    },
    #[serde(rename = "session:joinRoom", rename_all = "camelCase")]
    JoinRoom {
        code: String,
        room_type: RoomType,
        widget_id: String,
    },
    #[serde(rename = "session:leaveRoom", rename_all = "camelCase")]
    LeaveRoom {
        code: String,
        room_type: RoomType,
        widget_id: String,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::CreateSession { .. } => events::CREATE,
            ClientEvent::Recover { .. } => events::RECOVER,
            ClientEvent::Join { .. } => events::JOIN,
            ClientEvent::Close { .. } => events::CLOSE,
            ClientEvent::CreateRoom { .. } => events::CREATE_ROOM,
            ClientEvent::CloseRoom { .. } => events::CLOSE_ROOM,
            ClientEvent::UpdateWidgetState { .. } => events::UPDATE_WIDGET_STATE,
            ClientEvent::JoinRoom { .. } => events::JOIN_ROOM,
            ClientEvent::LeaveRoom { .. } => events::LEAVE_ROOM,
        }
    }
}

/// Broadcasts sent FROM the relay TO every client in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "session:roomCreated", rename_all = "camelCase")]
    RoomCreated {
        room_type: RoomType,
        widget_id: String,
        #[serde(default)]
        room_data: Value,
    },
    #[serde(rename = "session:roomClosed", rename_all = "camelCase")]
    RoomClosed {
        room_type: RoomType,
        widget_id: String,
    },
    #[serde(rename = "session:widgetStateChanged", rename_all = "camelCase")]
    WidgetStateChanged {
        room_type: RoomType,
        widget_id: String,
        is_active: bool,
    },
    #[serde(rename = "session:participantUpdate", rename_all = "camelCase")]
    ParticipantUpdate {
        room_type: RoomType,
        widget_id: String,
        count: u32,
    },
    #[serde(rename = "session:closed")]
    Closed {},
}

impl ServerEvent {
    /// Parse a named event body as delivered by the transport.
    pub fn parse(event: &str, data: &Value) -> Result<Self> {
        let data = if data.is_null() {
            Value::Object(Default::default())
        } else {
            data.clone()
        };
        let tagged = serde_json::json!({ "event": event, "data": data });
        serde_json::from_value(tagged).map_err(|e| SyncError::Protocol(format!("{event}: {e}")))
    }
}

/// One room as listed in a `session:joined` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_type: RoomType,
    pub widget_id: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub room_data: Value,
    #[serde(default)]
    pub participant_count: u32,
}

/// Ack body for `session:create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ack body for `session:createRoom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub is_existing: bool,
}

/// Ack body for `session:recover` and `session:join` (the `session:joined` payload).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedReply {
    pub success: bool,
    #[serde(default)]
    pub active_rooms: Vec<RoomInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `GET /sessions/{code}/exists`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistsReply {
    pub exists: bool,
}

/// Decode an ack body, mapping a parse failure to [`SyncError::Protocol`].
pub fn decode_reply<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| SyncError::Protocol(format!("{event} reply: {e}")))
}
