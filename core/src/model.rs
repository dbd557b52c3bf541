use chat_protocol::{MessagePayload, RoomPayload};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Maximum message length in characters.
pub const MAX_CONTENT_CHARS: usize = 5000;
/// Maximum room name length in characters.
pub const MAX_ROOM_NAME_CHARS: usize = 100;

/// Current time as Unix milliseconds.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Tombstone state of a soft-deletable record.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Active,
    Deleted,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(RecordStatus::Active),
            "deleted" => Some(RecordStatus::Deleted),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        self == RecordStatus::Active
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: Uuid,
    pub nickname: String,
    pub is_online: bool,
    pub last_seen_at: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub creator_id: Uuid,
    pub created_at: i64,
    pub status: RecordStatus,
}

impl Room {
    pub fn to_payload(&self, participant_count: Option<u32>) -> RoomPayload {
        RoomPayload {
            id: self.id,
            name: self.name.clone(),
            creator_id: self.creator_id,
            created_at: self.created_at,
            participant_count,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Participant {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub joined_at: i64,
    pub left_at: Option<i64>,
}

impl Participant {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

/// Result of activating a membership row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    Rejoined,
    AlreadyActive,
}

/// Total order of messages within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    pub created_at: i64,
    pub id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub sender_nickname: String,
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub is_edited: bool,
    pub status: RecordStatus,
}

impl Message {
    pub fn key(&self) -> OrderKey {
        OrderKey {
            created_at: self.created_at,
            id: self.id,
        }
    }

    pub fn to_payload(&self) -> MessagePayload {
        MessagePayload {
            id: self.id,
            content: self.content.clone(),
            sender_id: self.sender_id,
            sender_nickname: self.sender_nickname.clone(),
            room_id: self.room_id,
            is_edited: self.is_edited,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Active participant joined with their identity.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Member {
    pub user: UserIdentity,
    pub joined_at: i64,
}

/// One page of room history, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<Uuid>,
    pub has_more: bool,
}

/// Trim and bound user supplied content.
pub fn validate_content(content: &str) -> Result<&str, crate::ChatError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(crate::ChatError::validation("empty_message"));
    }
    if trimmed.chars().count() > MAX_CONTENT_CHARS {
        return Err(crate::ChatError::validation("message_too_long"));
    }
    Ok(trimmed)
}

pub fn validate_room_name(name: &str) -> Result<&str, crate::ChatError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(crate::ChatError::validation("empty_room_name"));
    }
    if trimmed.chars().count() > MAX_ROOM_NAME_CHARS {
        return Err(crate::ChatError::validation("room_name_too_long"));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_key_breaks_ties_by_id() {
        let a = OrderKey {
            created_at: 10,
            id: Uuid::from_u128(1),
        };
        let b = OrderKey {
            created_at: 10,
            id: Uuid::from_u128(2),
        };
        let c = OrderKey {
            created_at: 9,
            id: Uuid::from_u128(3),
        };
        assert!(a < b);
        assert!(c < a);
    }

    #[test]
    fn content_bounds() {
        assert!(validate_content("   ").is_err());
        assert_eq!(validate_content("  hi ").unwrap(), "hi");
        let long = "é".repeat(MAX_CONTENT_CHARS);
        assert!(validate_content(&long).is_ok());
        let too_long = "x".repeat(MAX_CONTENT_CHARS + 1);
        assert!(validate_content(&too_long).is_err());
        assert!(validate_room_name("").is_err());
        assert!(validate_room_name(&"r".repeat(101)).is_err());
    }

    #[test]
    fn status_round_trips_through_text() {
        for s in [RecordStatus::Active, RecordStatus::Deleted] {
            assert_eq!(RecordStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RecordStatus::parse("gone"), None);
    }
}
