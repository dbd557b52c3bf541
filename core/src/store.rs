//! Persistence boundary of the core.
//!
//! Store traits are synchronous; the core drives them from the blocking
//! pool with a deadline through [`StoreHandle`].

use crate::error::{ChatError, ChatResult, StoreError};
use crate::model::{JoinOutcome, Member, Message, OrderKey, Participant, Room, UserIdentity};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;

/// Maps an opaque session token to a user.
pub trait SessionStore: Send + Sync + 'static {
    fn validate_token(&self, token: &str) -> StoreResult<Option<UserIdentity>>;
}

pub trait UserStore: Send + Sync + 'static {
    fn find_user(&self, id: &Uuid) -> StoreResult<Option<UserIdentity>>;
    /// Persist the aggregate online flag; `last_seen_at` is only written when going offline.
    fn set_online(&self, id: &Uuid, online: bool, last_seen_at: Option<i64>) -> StoreResult<()>;
}

pub trait RoomStore: Send + Sync + 'static {
    fn insert_room(&self, room: &Room) -> StoreResult<()>;
    /// Find a room regardless of its status.
    fn find_room(&self, id: &Uuid) -> StoreResult<Option<Room>>;
    fn soft_delete_room(&self, id: &Uuid, at: i64) -> StoreResult<()>;
    /// Active rooms, newest first, with their active participant counts.
    fn list_rooms(&self) -> StoreResult<Vec<(Room, u32)>>;
    fn find_participant(&self, room_id: &Uuid, user_id: &Uuid) -> StoreResult<Option<Participant>>;
    /// Atomically create or reactivate the membership row.
    fn join_participant(&self, room_id: &Uuid, user_id: &Uuid, at: i64) -> StoreResult<JoinOutcome>;
    /// Set the leave time of the active row. Returns false if none was active.
    fn leave_participant(&self, room_id: &Uuid, user_id: &Uuid, at: i64) -> StoreResult<bool>;
    /// Active participants in join order.
    fn list_members(&self, room_id: &Uuid) -> StoreResult<Vec<Member>>;
    /// Active rooms the user actively participates in.
    fn list_user_rooms(&self, user_id: &Uuid) -> StoreResult<Vec<Room>>;
}

pub trait MessageStore: Send + Sync + 'static {
    fn insert_message(&self, msg: &Message) -> StoreResult<()>;
    /// Find a message regardless of its status.
    fn find_message(&self, id: &Uuid) -> StoreResult<Option<Message>>;
    fn update_message(&self, msg: &Message) -> StoreResult<()>;
    /// Newest message of the room by ordering key, including deleted ones.
    fn newest_in_room(&self, room_id: &Uuid) -> StoreResult<Option<OrderKey>>;
    /// Newest active message of `sender_id` in the room.
    fn latest_active_by_sender(&self, room_id: &Uuid, sender_id: &Uuid) -> StoreResult<Option<Message>>;
    /// Whether someone other than `sender_id` has an active message ordered after `after`.
    fn has_newer_from_others(&self, room_id: &Uuid, sender_id: &Uuid, after: OrderKey) -> StoreResult<bool>;
    /// Active messages strictly older than `before`, newest first, at most `take`.
    fn page(&self, room_id: &Uuid, before: Option<OrderKey>, take: usize) -> StoreResult<Vec<Message>>;
}

/// Everything the core needs from durable storage.
pub trait Store: UserStore + RoomStore + MessageStore {}

impl<T: UserStore + RoomStore + MessageStore> Store for T {}

/// Runs synchronous store calls off the async executor with a deadline.
pub struct StoreHandle<S: ?Sized> {
    inner: Arc<S>,
    timeout: Duration,
}

impl<S: ?Sized> Clone for StoreHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            timeout: self.timeout,
        }
    }
}

impl<S: ?Sized + Send + Sync + 'static> StoreHandle<S> {
    pub fn new(inner: Arc<S>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Execute `f` on the blocking pool.
    ///
    /// A call that exceeds the deadline reports `ChatError::Timeout`; the
    /// blocking work itself is not cancelled and may still complete. Writes
    /// that must stay serialized go through [`StoreHandle::call_committed`].
    pub async fn call<T, F>(&self, f: F) -> Result<T, ChatError>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> StoreResult<T> + Send + 'static,
    {
        let store = self.inner.clone();
        let task = tokio::task::spawn_blocking(move || f(store.as_ref()));
        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "store call timed out");
                Err(ChatError::Timeout)
            }
            Ok(joined) => settle(joined),
        }
    }

    /// Execute `f` on the blocking pool and run `commit` on its success, both
    /// while `guard` is held.
    ///
    /// Past the deadline the caller gets `ChatError::Timeout` right away, but
    /// `guard` is only released once the blocking work has finished, and a
    /// late success still runs `commit`. A timed-out write therefore never
    /// lands outside the guard and is still published.
    pub async fn call_committed<T, G, F, C>(&self, guard: G, f: F, commit: C) -> ChatResult<T>
    where
        T: Send + 'static,
        G: Send + 'static,
        F: FnOnce(&S) -> StoreResult<ChatResult<T>> + Send + 'static,
        C: FnOnce(&T) + Send + 'static,
    {
        let store = self.inner.clone();
        let mut task = tokio::task::spawn_blocking(move || f(store.as_ref()));
        let deadline = tokio::time::timeout(self.timeout, &mut task).await;
        match deadline {
            Ok(joined) => {
                let out = settle(joined).and_then(|r| r);
                if let Ok(value) = &out {
                    commit(value);
                }
                drop(guard);
                out
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "store call timed out, finishing in background"
                );
                tokio::spawn(async move {
                    if let Ok(value) = settle(task.await).and_then(|r| r) {
                        commit(&value);
                    }
                    drop(guard);
                });
                Err(ChatError::Timeout)
            }
        }
    }
}

fn settle<T>(joined: Result<StoreResult<T>, JoinError>) -> ChatResult<T> {
    match joined {
        Err(join) => {
            tracing::error!(error = %join, "store task failed");
            Err(ChatError::Internal(join.to_string()))
        }
        Ok(res) => res.map_err(|e| {
            tracing::error!(error = %e, "store error");
            ChatError::from(e)
        }),
    }
}
