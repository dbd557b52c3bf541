//! Durable room membership and its transport-level mirror.

use crate::error::{ChatError, ChatResult};
use crate::locks::RoomLocks;
use crate::model::{now_millis, validate_room_name, JoinOutcome, Member, RecordStatus, Room, UserIdentity};
use crate::presence::{ConnectionId, ConnectionRegistry};
use crate::router::BroadcastRouter;
use crate::store::{Store, StoreHandle, StoreResult};
use chat_protocol::{RoomMemberPayload, RoomRef, ServerEvent};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct RoomDirectory {
    store: StoreHandle<dyn Store>,
    router: Arc<BroadcastRouter>,
    registry: Arc<ConnectionRegistry>,
    locks: Arc<RoomLocks>,
}

fn active_room(s: &dyn Store, room_id: &Uuid) -> StoreResult<Option<Room>> {
    Ok(s.find_room(room_id)?.filter(|r| r.status.is_active()))
}

impl RoomDirectory {
    pub fn new(
        store: StoreHandle<dyn Store>,
        router: Arc<BroadcastRouter>,
        registry: Arc<ConnectionRegistry>,
        locks: Arc<RoomLocks>,
    ) -> Self {
        Self {
            store,
            router,
            registry,
            locks,
        }
    }

    /// Create a room with the creator as its first participant.
    pub async fn create_room(&self, creator: &UserIdentity, name: &str) -> ChatResult<Room> {
        let name = validate_room_name(name)?.to_owned();
        let now = now_millis();
        let room = Room {
            id: Uuid::new_v4(),
            name,
            creator_id: creator.id,
            created_at: now,
            status: RecordStatus::Active,
        };
        let guard = self.locks.lock(room.id).await;
        let dir = self.clone();
        let creator_id = creator.id;
        self.store
            .call_committed(guard, move |s| {
                s.insert_room(&room)?;
                s.join_participant(&room.id, &room.creator_id, now)?;
                Ok(Ok(room))
            }, move |room: &Room| {
                info!(room_id = %room.id, creator = %creator_id, "room created");
                dir.mirror_join(creator_id, room.id);
                dir.router
                    .broadcast_all(&ServerEvent::RoomCreated(room.to_payload(Some(1))));
            })
            .await
    }

    /// Active rooms, newest first, with participant counts.
    pub async fn list_rooms(&self) -> ChatResult<Vec<(Room, u32)>> {
        self.store.call(|s| s.list_rooms()).await
    }

    /// Room with its active participants; online flags come from the registry.
    pub async fn room_detail(&self, room_id: Uuid) -> ChatResult<(Room, Vec<Member>)> {
        let (room, mut members) = self
            .store
            .call(move |s| {
                let Some(room) = active_room(s, &room_id)? else {
                    return Ok(Err(ChatError::RoomNotFound));
                };
                Ok(Ok((room, s.list_members(&room_id)?)))
            })
            .await??;
        for m in &mut members {
            m.user.is_online = self.registry.is_online(&m.user.id);
        }
        Ok((room, members))
    }

    pub async fn members(&self, room_id: Uuid) -> ChatResult<Vec<Member>> {
        Ok(self.room_detail(room_id).await?.1)
    }

    pub async fn is_participant(&self, room_id: Uuid, user_id: Uuid) -> ChatResult<bool> {
        self.store
            .call(move |s| {
                if active_room(s, &room_id)?.is_none() {
                    return Ok(false);
                }
                Ok(s.find_participant(&room_id, &user_id)?
                    .is_some_and(|p| p.is_active()))
            })
            .await
    }

    /// Fail with `room-not-found` or `not-a-member` unless the user may read the room.
    pub async fn require_member(&self, room_id: Uuid, user_id: Uuid) -> ChatResult<()> {
        self.store
            .call(move |s| {
                if active_room(s, &room_id)?.is_none() {
                    return Ok(Err(ChatError::RoomNotFound));
                }
                match s.find_participant(&room_id, &user_id)? {
                    Some(p) if p.is_active() => Ok(Ok(())),
                    _ => Ok(Err(ChatError::NotAMember)),
                }
            })
            .await?
    }

    /// Rooms whose live updates a fresh connection should receive.
    pub async fn user_rooms(&self, user_id: Uuid) -> ChatResult<Vec<Room>> {
        self.store.call(move |s| s.list_user_rooms(&user_id)).await
    }

    /// Join (or re-join) a room.
    pub async fn join(&self, room_id: Uuid, user: &UserIdentity) -> ChatResult<()> {
        let user_id = user.id;
        let nickname = user.nickname.clone();
        let guard = self.locks.lock(room_id).await;
        let dir = self.clone();
        let outcome = self
            .store
            .call_committed(guard, move |s| {
                if active_room(s, &room_id)?.is_none() {
                    return Ok(Err(ChatError::RoomNotFound));
                }
                Ok(Ok(s.join_participant(&room_id, &user_id, now_millis())?))
            }, move |outcome: &JoinOutcome| {
                if *outcome == JoinOutcome::AlreadyActive {
                    return;
                }
                info!(%room_id, %user_id, rejoined = *outcome == JoinOutcome::Rejoined, "user joined room");
                dir.mirror_join(user_id, room_id);
                dir.router.broadcast(
                    room_id,
                    &ServerEvent::UserJoined(RoomMemberPayload {
                        room_id,
                        user_id,
                        nickname,
                    }),
                );
            })
            .await?;
        if outcome == JoinOutcome::AlreadyActive {
            return Err(ChatError::AlreadyMember);
        }
        Ok(())
    }

    /// Leave a room; the membership row is kept with its leave time.
    pub async fn leave(&self, room_id: Uuid, user: &UserIdentity) -> ChatResult<()> {
        let user_id = user.id;
        let nickname = user.nickname.clone();
        let guard = self.locks.lock(room_id).await;
        let dir = self.clone();
        self.store
            .call_committed(guard, move |s| {
                if active_room(s, &room_id)?.is_none() {
                    return Ok(Err(ChatError::RoomNotFound));
                }
                if !s.leave_participant(&room_id, &user_id, now_millis())? {
                    return Ok(Err(ChatError::NotAMember));
                }
                Ok(Ok(()))
            }, move |_: &()| {
                info!(%room_id, %user_id, "user left room");
                for conn in dir.registry.connections_of(&user_id) {
                    dir.router.unsubscribe(conn, room_id);
                }
                dir.router.broadcast(
                    room_id,
                    &ServerEvent::UserLeft(RoomMemberPayload {
                        room_id,
                        user_id,
                        nickname,
                    }),
                );
            })
            .await
    }

    /// Tombstone a room and cut every live subscription to it.
    pub async fn delete_room(&self, room_id: Uuid, requester_id: Uuid) -> ChatResult<()> {
        let guard = self.locks.lock(room_id).await;
        let router = self.router.clone();
        self.store
            .call_committed(guard, move |s| {
                let Some(room) = active_room(s, &room_id)? else {
                    return Ok(Err(ChatError::RoomNotFound));
                };
                if room.creator_id != requester_id {
                    return Ok(Err(ChatError::NotOwner));
                }
                s.soft_delete_room(&room_id, now_millis())?;
                Ok(Ok(()))
            }, move |_: &()| {
                let reached = router.close_room(room_id, &ServerEvent::RoomDeleted(RoomRef { room_id }));
                info!(%room_id, %requester_id, reached, "room deleted");
            })
            .await
    }

    /// Subscribe one connection to a room its user actively participates in.
    pub async fn subscribe(&self, conn: ConnectionId, user_id: Uuid, room_id: Uuid) -> ChatResult<()> {
        let _room = self.locks.lock(room_id).await;
        if !self.is_participant(room_id, user_id).await? {
            return Err(ChatError::NotAMember);
        }
        self.router.subscribe(conn, room_id);
        Ok(())
    }

    pub fn unsubscribe(&self, conn: ConnectionId, room_id: Uuid) {
        self.router.unsubscribe(conn, room_id);
    }

    fn mirror_join(&self, user_id: Uuid, room_id: Uuid) {
        for conn in self.registry.connections_of(&user_id) {
            self.router.subscribe(conn, room_id);
        }
    }
}
