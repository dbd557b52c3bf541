//! Message creation, amendment and history.

use crate::error::{ChatError, ChatResult};
use crate::locks::RoomLocks;
use crate::model::{
    now_millis, validate_content, Message, MessagePage, OrderKey, RecordStatus,
};
use crate::router::BroadcastRouter;
use crate::store::{Store, StoreHandle, StoreResult};
use chat_protocol::{MessageDeletedPayload, ServerEvent};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 100;

/// Applies message mutations under the per-room lock and fans them out.
///
/// Each mutation evaluates its whole read set and write inside one store
/// call while the room lock is held; the broadcast follows the write before
/// the lock is released, even when the caller already saw a timeout.
#[derive(Clone)]
pub struct MessageEngine {
    store: StoreHandle<dyn Store>,
    router: Arc<BroadcastRouter>,
    locks: Arc<RoomLocks>,
}

fn room_is_active(s: &dyn Store, room_id: &Uuid) -> StoreResult<bool> {
    Ok(s.find_room(room_id)?.is_some_and(|r| r.status.is_active()))
}

/// Load a live message, optionally pinned to a room.
fn live_message(s: &dyn Store, id: &Uuid, scope: Option<Uuid>) -> StoreResult<ChatResult<Message>> {
    let Some(msg) = s.find_message(id)? else {
        return Ok(Err(ChatError::MessageNotFound));
    };
    if !msg.status.is_active()
        || scope.is_some_and(|r| r != msg.room_id)
        || !room_is_active(s, &msg.room_id)?
    {
        return Ok(Err(ChatError::MessageNotFound));
    }
    Ok(Ok(msg))
}

impl MessageEngine {
    pub fn new(store: StoreHandle<dyn Store>, router: Arc<BroadcastRouter>, locks: Arc<RoomLocks>) -> Self {
        Self { store, router, locks }
    }

    /// Post a message to a room the sender actively participates in.
    pub async fn create(&self, room_id: Uuid, sender_id: Uuid, content: &str) -> ChatResult<Message> {
        let content = validate_content(content)?.to_owned();
        let room = self.locks.lock(room_id).await;
        let router = self.router.clone();
        self.store
            .call_committed(room, move |s| {
                if !room_is_active(s, &room_id)? {
                    return Ok(Err(ChatError::RoomNotFound));
                }
                if !s
                    .find_participant(&room_id, &sender_id)?
                    .is_some_and(|p| p.is_active())
                {
                    return Ok(Err(ChatError::NotAMember));
                }
                let Some(sender) = s.find_user(&sender_id)? else {
                    return Ok(Err(ChatError::Internal(format!("unknown sender {sender_id}"))));
                };
                // creation keys stay strictly increasing even if the clock stalls
                let now = now_millis();
                let created_at = match s.newest_in_room(&room_id)? {
                    Some(newest) if newest.created_at >= now => newest.created_at + 1,
                    _ => now,
                };
                let msg = Message {
                    id: Uuid::new_v4(),
                    room_id,
                    sender_id,
                    sender_nickname: sender.nickname,
                    content,
                    created_at,
                    updated_at: created_at,
                    is_edited: false,
                    status: RecordStatus::Active,
                };
                s.insert_message(&msg)?;
                Ok(Ok(msg))
            }, move |msg: &Message| {
                info!(message_id = %msg.id, %room_id, %sender_id, "message created");
                router.broadcast(room_id, &ServerEvent::MessageNew(msg.to_payload()));
            })
            .await
    }

    /// Amend the requester's latest message while nobody else has spoken since.
    pub async fn edit(&self, message_id: Uuid, requester_id: Uuid, content: &str) -> ChatResult<Message> {
        self.apply_edit(None, message_id, requester_id, content).await
    }

    /// Like [`MessageEngine::edit`], treating messages of other rooms as absent.
    pub async fn edit_in_room(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        requester_id: Uuid,
        content: &str,
    ) -> ChatResult<Message> {
        self.apply_edit(Some(room_id), message_id, requester_id, content)
            .await
    }

    async fn apply_edit(
        &self,
        scope: Option<Uuid>,
        message_id: Uuid,
        requester_id: Uuid,
        content: &str,
    ) -> ChatResult<Message> {
        let content = validate_content(content)?.to_owned();
        let room_id = self.room_of(scope, message_id).await?;
        let room = self.locks.lock(room_id).await;
        let router = self.router.clone();
        self.store
            .call_committed(room, move |s| {
                let mut msg = match live_message(s, &message_id, scope)? {
                    Ok(m) => m,
                    Err(e) => return Ok(Err(e)),
                };
                if msg.sender_id != requester_id {
                    return Ok(Err(ChatError::NotOwner));
                }
                let latest = s.latest_active_by_sender(&msg.room_id, &requester_id)?;
                if latest.map(|m| m.id) != Some(msg.id) {
                    return Ok(Err(ChatError::NotLastMessage));
                }
                if s.has_newer_from_others(&msg.room_id, &requester_id, msg.key())? {
                    return Ok(Err(ChatError::Superseded));
                }
                msg.content = content;
                msg.is_edited = true;
                msg.updated_at = now_millis().max(msg.updated_at);
                s.update_message(&msg)?;
                Ok(Ok(msg))
            }, move |msg: &Message| {
                info!(%message_id, %room_id, %requester_id, "message edited");
                router.broadcast(room_id, &ServerEvent::MessageUpdated(msg.to_payload()));
            })
            .await
    }

    /// Soft-delete one of the requester's messages.
    pub async fn delete(&self, message_id: Uuid, requester_id: Uuid) -> ChatResult<Message> {
        self.apply_delete(None, message_id, requester_id).await
    }

    pub async fn delete_in_room(&self, room_id: Uuid, message_id: Uuid, requester_id: Uuid) -> ChatResult<Message> {
        self.apply_delete(Some(room_id), message_id, requester_id)
            .await
    }

    async fn apply_delete(&self, scope: Option<Uuid>, message_id: Uuid, requester_id: Uuid) -> ChatResult<Message> {
        let room_id = self.room_of(scope, message_id).await?;
        let room = self.locks.lock(room_id).await;
        let router = self.router.clone();
        self.store
            .call_committed(room, move |s| {
                let mut msg = match live_message(s, &message_id, scope)? {
                    Ok(m) => m,
                    Err(e) => return Ok(Err(e)),
                };
                if msg.sender_id != requester_id {
                    return Ok(Err(ChatError::NotOwner));
                }
                msg.status = RecordStatus::Deleted;
                s.update_message(&msg)?;
                Ok(Ok(msg))
            }, move |_: &Message| {
                info!(%message_id, %room_id, %requester_id, "message deleted");
                router.broadcast(
                    room_id,
                    &ServerEvent::MessageDeleted(MessageDeletedPayload { message_id, room_id }),
                );
            })
            .await
    }

    /// Room of a live message, resolved before taking the room lock.
    async fn room_of(&self, scope: Option<Uuid>, message_id: Uuid) -> ChatResult<Uuid> {
        let msg = self
            .store
            .call(move |s| live_message(s, &message_id, scope))
            .await??;
        Ok(msg.room_id)
    }

    /// Newest-first page of a room's live messages.
    ///
    /// `cursor` is the id of the oldest message of the previous page; only
    /// messages strictly older than its ordering key are returned.
    pub async fn list_by_room(&self, room_id: Uuid, cursor: Option<Uuid>, limit: usize) -> ChatResult<MessagePage> {
        if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err(ChatError::validation("limit must be between 1 and 100"));
        }
        let mut rows = self
            .store
            .call(move |s| {
                if !room_is_active(s, &room_id)? {
                    return Ok(Err(ChatError::RoomNotFound));
                }
                let before: Option<OrderKey> = match cursor {
                    None => None,
                    Some(c) => match s.find_message(&c)? {
                        Some(m) if m.room_id == room_id => Some(m.key()),
                        _ => return Ok(Err(ChatError::validation("unknown cursor"))),
                    },
                };
                Ok(Ok(s.page(&room_id, before, limit + 1)?))
            })
            .await??;
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = if has_more { rows.last().map(|m| m.id) } else { None };
        Ok(MessagePage {
            messages: rows,
            next_cursor,
            has_more,
        })
    }
}
