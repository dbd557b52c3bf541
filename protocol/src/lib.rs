use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Top level frame sent by clients over the socket.
///
/// `data` is decoded lazily against the payload type selected by `event`,
/// so unknown or malformed frames can still be acknowledged.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Envelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("invalid payload for `{event}`: {reason}")]
    InvalidPayload { event: String, reason: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub room_id: Uuid,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    pub room_id: Uuid,
    pub message_id: Uuid,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
    pub room_id: Uuid,
    pub message_id: Uuid,
}

/// Events a client may send after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    JoinRoom(RoomRef),
    LeaveRoom(RoomRef),
    SendMessage(SendMessage),
    EditMessage(EditMessage),
    DeleteMessage(DeleteMessage),
    TypingStart(RoomRef),
    TypingStop(RoomRef),
}

impl ClientEvent {
    /// Decode the payload of an envelope according to its event name.
    pub fn from_envelope(env: &Envelope) -> Result<Self, ProtocolError> {
        let event = env.event.as_str();
        let ev = match event {
            "room:join" => ClientEvent::JoinRoom(payload(env)?),
            "room:leave" => ClientEvent::LeaveRoom(payload(env)?),
            "message:send" => ClientEvent::SendMessage(payload(env)?),
            "message:edit" => ClientEvent::EditMessage(payload(env)?),
            "message:delete" => ClientEvent::DeleteMessage(payload(env)?),
            "typing:start" => ClientEvent::TypingStart(payload(env)?),
            "typing:stop" => ClientEvent::TypingStop(payload(env)?),
            other => return Err(ProtocolError::UnknownEvent(other.into())),
        };
        Ok(ev)
    }

    /// Typing events are fire-and-forget and never acknowledged.
    pub fn wants_ack(&self) -> bool {
        !matches!(self, ClientEvent::TypingStart(_) | ClientEvent::TypingStop(_))
    }
}

fn payload<T: serde::de::DeserializeOwned>(env: &Envelope) -> Result<T, ProtocolError> {
    serde_json::from_value(env.data.clone()).map_err(|e| ProtocolError::InvalidPayload {
        event: env.event.clone(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPayload {
    pub user_id: Uuid,
    pub nickname: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: Uuid,
    pub content: String,
    pub sender_id: Uuid,
    pub sender_nickname: String,
    pub room_id: Uuid,
    pub is_edited: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeletedPayload {
    pub message_id: Uuid,
    pub room_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    pub id: Uuid,
    pub name: String,
    pub creator_id: Uuid,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_count: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomMemberPayload {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub nickname: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: Uuid,
    pub nickname: String,
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub nickname: String,
}

/// Reply to an acknowledged client event.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AckPayload {
    pub id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessagePayload>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub message: String,
}

/// Events pushed from the server to a connection.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "ready")]
    Ready(ReadyPayload),
    #[serde(rename = "message:new")]
    MessageNew(MessagePayload),
    #[serde(rename = "message:updated")]
    MessageUpdated(MessagePayload),
    #[serde(rename = "message:deleted")]
    MessageDeleted(MessageDeletedPayload),
    #[serde(rename = "room:created")]
    RoomCreated(RoomPayload),
    #[serde(rename = "room:deleted")]
    RoomDeleted(RoomRef),
    #[serde(rename = "room:user_joined")]
    UserJoined(RoomMemberPayload),
    #[serde(rename = "room:user_left")]
    UserLeft(RoomMemberPayload),
    #[serde(rename = "user:presence")]
    Presence(PresencePayload),
    #[serde(rename = "typing:start")]
    TypingStart(TypingPayload),
    #[serde(rename = "typing:stop")]
    TypingStop(TypingPayload),
    #[serde(rename = "ack")]
    Ack(AckPayload),
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl ServerEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Ready(_) => "ready",
            ServerEvent::MessageNew(_) => "message:new",
            ServerEvent::MessageUpdated(_) => "message:updated",
            ServerEvent::MessageDeleted(_) => "message:deleted",
            ServerEvent::RoomCreated(_) => "room:created",
            ServerEvent::RoomDeleted(_) => "room:deleted",
            ServerEvent::UserJoined(_) => "room:user_joined",
            ServerEvent::UserLeft(_) => "room:user_left",
            ServerEvent::Presence(_) => "user:presence",
            ServerEvent::TypingStart(_) => "typing:start",
            ServerEvent::TypingStop(_) => "typing:stop",
            ServerEvent::Ack(_) => "ack",
            ServerEvent::Error(_) => "error",
        }
    }
}
