use crate::error::ChatError;
use crate::model::now_millis;
use crate::store::{Store, StoreHandle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifier of one live transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Edge of a user's aggregate presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Online,
    Offline { last_seen_at: i64 },
}

/// A presence change to be persisted, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: Uuid,
    pub transition: Transition,
}

/// Tracks live connections per user and derives online/offline edges.
///
/// Transitions are computed under the registry lock and forwarded to the
/// persistence queue while still holding it, so the queue sees them in the
/// same order the registry produced them.
pub struct ConnectionRegistry {
    live: Mutex<HashMap<Uuid, HashSet<ConnectionId>>>,
    changes: Option<UnboundedSender<PresenceChange>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            changes: None,
        }
    }

    /// Registry whose transitions are also queued on `changes`.
    pub fn with_changes(changes: UnboundedSender<PresenceChange>) -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            changes: Some(changes),
        }
    }

    /// Register a connection. Returns `Some(Online)` on the 0→1 edge.
    pub fn register(&self, user_id: Uuid, conn: ConnectionId) -> Option<Transition> {
        let mut guard = self.live.lock();
        let set = guard.entry(user_id).or_default();
        if !set.insert(conn) || set.len() != 1 {
            return None;
        }
        let t = Transition::Online;
        self.queue(user_id, t);
        Some(t)
    }

    /// Deregister a connection. Returns `Some(Offline)` on the 1→0 edge.
    pub fn unregister(&self, user_id: Uuid, conn: ConnectionId) -> Option<Transition> {
        let mut guard = self.live.lock();
        let set = guard.get_mut(&user_id)?;
        if !set.remove(&conn) || !set.is_empty() {
            return None;
        }
        guard.remove(&user_id);
        let t = Transition::Offline {
            last_seen_at: now_millis(),
        };
        self.queue(user_id, t);
        Some(t)
    }

    fn queue(&self, user_id: Uuid, transition: Transition) {
        if let Some(tx) = &self.changes {
            if tx.send(PresenceChange { user_id, transition }).is_err() {
                debug!(%user_id, "presence writer gone; change not persisted");
            }
        }
    }

    pub fn is_online(&self, user_id: &Uuid) -> bool {
        self.live.lock().contains_key(user_id)
    }

    pub fn connection_count(&self, user_id: &Uuid) -> usize {
        self.live.lock().get(user_id).map_or(0, HashSet::len)
    }

    pub fn connections_of(&self, user_id: &Uuid) -> Vec<ConnectionId> {
        self.live
            .lock()
            .get(user_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn online_users(&self) -> Vec<Uuid> {
        self.live.lock().keys().copied().collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const WRITE_ATTEMPTS: u32 = 3;

/// Create the queue feeding [`run_presence_writer`].
pub fn presence_queue() -> (UnboundedSender<PresenceChange>, UnboundedReceiver<PresenceChange>) {
    unbounded_channel()
}

/// Persist presence changes one at a time, retrying failed writes.
///
/// A write that outlives the store deadline still finishes before the next
/// one starts, so the stored flag follows transition order. Runs until every
/// sender is dropped. Never blocks connection handling.
pub async fn run_presence_writer(
    store: StoreHandle<dyn Store>,
    mut rx: UnboundedReceiver<PresenceChange>,
    backoff: Duration,
) {
    let order = Arc::new(tokio::sync::Mutex::new(()));
    while let Some(change) = rx.recv().await {
        let (online, last_seen) = match change.transition {
            Transition::Online => (true, None),
            Transition::Offline { last_seen_at } => (false, Some(last_seen_at)),
        };
        let user_id = change.user_id;
        for attempt in 1..=WRITE_ATTEMPTS {
            let turn = order.clone().lock_owned().await;
            let res = store
                .call_committed(turn, move |s| s.set_online(&user_id, online, last_seen).map(Ok), |_: &()| {})
                .await;
            match res {
                Ok(()) => break,
                // still running and holds the turn; retrying would write twice
                Err(ChatError::Timeout) => {
                    warn!(%user_id, online, "presence write outlived its deadline");
                    break;
                }
                Err(e) if attempt < WRITE_ATTEMPTS => {
                    warn!(%user_id, attempt, error = %e, "presence write failed, retrying");
                    tokio::time::sleep(backoff * attempt).await;
                }
                Err(e) => {
                    warn!(%user_id, online, error = %e, "presence write dropped");
                }
            }
        }
    }
}
