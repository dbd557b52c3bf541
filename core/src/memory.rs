//! In-process store used by tests and embedded setups.

use crate::error::StoreError;
use crate::model::{
    JoinOutcome, Member, Message, OrderKey, Participant, RecordStatus, Room, UserIdentity,
};
use crate::store::{MessageStore, RoomStore, SessionStore, StoreResult, UserStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, UserIdentity>,
    tokens: HashMap<String, Uuid>,
    rooms: HashMap<Uuid, Room>,
    participants: HashMap<(Uuid, Uuid), Participant>,
    messages: HashMap<Uuid, Message>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a user and bind a session token to it.
    pub fn add_user(&self, nickname: &str, token: &str) -> UserIdentity {
        let user = UserIdentity {
            id: Uuid::new_v4(),
            nickname: nickname.into(),
            is_online: false,
            last_seen_at: None,
        };
        let mut guard = self.inner.write();
        guard.users.insert(user.id, user.clone());
        guard.tokens.insert(token.into(), user.id);
        user
    }

    pub fn revoke_token(&self, token: &str) {
        self.inner.write().tokens.remove(token);
    }

    fn with_nickname(inner: &Inner, mut msg: Message) -> Message {
        if let Some(u) = inner.users.get(&msg.sender_id) {
            msg.sender_nickname = u.nickname.clone();
        }
        msg
    }
}

impl SessionStore for MemoryStore {
    fn validate_token(&self, token: &str) -> StoreResult<Option<UserIdentity>> {
        let guard = self.inner.read();
        Ok(guard
            .tokens
            .get(token)
            .and_then(|id| guard.users.get(id))
            .cloned())
    }
}

impl UserStore for MemoryStore {
    fn find_user(&self, id: &Uuid) -> StoreResult<Option<UserIdentity>> {
        Ok(self.inner.read().users.get(id).cloned())
    }

    fn set_online(&self, id: &Uuid, online: bool, last_seen_at: Option<i64>) -> StoreResult<()> {
        let mut guard = self.inner.write();
        let user = guard
            .users
            .get_mut(id)
            .ok_or_else(|| StoreError::Backend(format!("unknown user {id}")))?;
        user.is_online = online;
        if last_seen_at.is_some() {
            user.last_seen_at = last_seen_at;
        }
        Ok(())
    }
}

impl RoomStore for MemoryStore {
    fn insert_room(&self, room: &Room) -> StoreResult<()> {
        self.inner.write().rooms.insert(room.id, room.clone());
        Ok(())
    }

    fn find_room(&self, id: &Uuid) -> StoreResult<Option<Room>> {
        Ok(self.inner.read().rooms.get(id).cloned())
    }

    fn soft_delete_room(&self, id: &Uuid, _at: i64) -> StoreResult<()> {
        if let Some(room) = self.inner.write().rooms.get_mut(id) {
            room.status = RecordStatus::Deleted;
        }
        Ok(())
    }

    fn list_rooms(&self) -> StoreResult<Vec<(Room, u32)>> {
        let guard = self.inner.read();
        let mut rooms: Vec<(Room, u32)> = guard
            .rooms
            .values()
            .filter(|r| r.status.is_active())
            .map(|r| {
                let count = guard
                    .participants
                    .values()
                    .filter(|p| p.room_id == r.id && p.is_active())
                    .count() as u32;
                (r.clone(), count)
            })
            .collect();
        rooms.sort_by(|a, b| (b.0.created_at, b.0.id).cmp(&(a.0.created_at, a.0.id)));
        Ok(rooms)
    }

    fn find_participant(&self, room_id: &Uuid, user_id: &Uuid) -> StoreResult<Option<Participant>> {
        Ok(self
            .inner
            .read()
            .participants
            .get(&(*room_id, *user_id))
            .cloned())
    }

    fn join_participant(&self, room_id: &Uuid, user_id: &Uuid, at: i64) -> StoreResult<JoinOutcome> {
        let mut guard = self.inner.write();
        match guard.participants.get_mut(&(*room_id, *user_id)) {
            Some(p) if p.is_active() => Ok(JoinOutcome::AlreadyActive),
            Some(p) => {
                p.left_at = None;
                p.joined_at = at;
                Ok(JoinOutcome::Rejoined)
            }
            None => {
                guard.participants.insert(
                    (*room_id, *user_id),
                    Participant {
                        room_id: *room_id,
                        user_id: *user_id,
                        joined_at: at,
                        left_at: None,
                    },
                );
                Ok(JoinOutcome::Joined)
            }
        }
    }

    fn leave_participant(&self, room_id: &Uuid, user_id: &Uuid, at: i64) -> StoreResult<bool> {
        let mut guard = self.inner.write();
        match guard.participants.get_mut(&(*room_id, *user_id)) {
            Some(p) if p.is_active() => {
                p.left_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn list_members(&self, room_id: &Uuid) -> StoreResult<Vec<Member>> {
        let guard = self.inner.read();
        let mut members: Vec<Member> = guard
            .participants
            .values()
            .filter(|p| p.room_id == *room_id && p.is_active())
            .filter_map(|p| {
                guard.users.get(&p.user_id).map(|u| Member {
                    user: u.clone(),
                    joined_at: p.joined_at,
                })
            })
            .collect();
        members.sort_by_key(|m| m.joined_at);
        Ok(members)
    }

    fn list_user_rooms(&self, user_id: &Uuid) -> StoreResult<Vec<Room>> {
        let guard = self.inner.read();
        Ok(guard
            .participants
            .values()
            .filter(|p| p.user_id == *user_id && p.is_active())
            .filter_map(|p| guard.rooms.get(&p.room_id))
            .filter(|r| r.status.is_active())
            .cloned()
            .collect())
    }
}

impl MessageStore for MemoryStore {
    fn insert_message(&self, msg: &Message) -> StoreResult<()> {
        self.inner.write().messages.insert(msg.id, msg.clone());
        Ok(())
    }

    fn find_message(&self, id: &Uuid) -> StoreResult<Option<Message>> {
        let guard = self.inner.read();
        Ok(guard
            .messages
            .get(id)
            .cloned()
            .map(|m| Self::with_nickname(&guard, m)))
    }

    fn update_message(&self, msg: &Message) -> StoreResult<()> {
        let mut guard = self.inner.write();
        match guard.messages.get_mut(&msg.id) {
            Some(existing) => {
                *existing = msg.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(format!("unknown message {}", msg.id))),
        }
    }

    fn newest_in_room(&self, room_id: &Uuid) -> StoreResult<Option<OrderKey>> {
        Ok(self
            .inner
            .read()
            .messages
            .values()
            .filter(|m| m.room_id == *room_id)
            .map(Message::key)
            .max())
    }

    fn latest_active_by_sender(&self, room_id: &Uuid, sender_id: &Uuid) -> StoreResult<Option<Message>> {
        let guard = self.inner.read();
        Ok(guard
            .messages
            .values()
            .filter(|m| m.room_id == *room_id && m.sender_id == *sender_id && m.status.is_active())
            .max_by_key(|m| m.key())
            .cloned()
            .map(|m| Self::with_nickname(&guard, m)))
    }

    fn has_newer_from_others(&self, room_id: &Uuid, sender_id: &Uuid, after: OrderKey) -> StoreResult<bool> {
        Ok(self.inner.read().messages.values().any(|m| {
            m.room_id == *room_id
                && m.sender_id != *sender_id
                && m.status.is_active()
                && m.key() > after
        }))
    }

    fn page(&self, room_id: &Uuid, before: Option<OrderKey>, take: usize) -> StoreResult<Vec<Message>> {
        let guard = self.inner.read();
        let mut msgs: Vec<Message> = guard
            .messages
            .values()
            .filter(|m| m.room_id == *room_id && m.status.is_active())
            .filter(|m| before.map_or(true, |b| m.key() < b))
            .cloned()
            .collect();
        msgs.sort_by(|a, b| b.key().cmp(&a.key()));
        msgs.truncate(take);
        Ok(msgs
            .into_iter()
            .map(|m| Self::with_nickname(&guard, m))
            .collect())
    }
}
