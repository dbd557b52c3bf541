use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

type LockMap = Arc<Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>;

/// Per-room serialization point for mutations and their broadcasts.
///
/// Entries only live while a room is locked or awaited.
#[derive(Default)]
pub struct RoomLocks {
    locks: LockMap,
}

impl RoomLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, room_id: Uuid) -> RoomGuard {
        let lock = self.locks.lock().entry(room_id).or_default().clone();
        let guard = lock.clone().lock_owned().await;
        RoomGuard {
            room_id,
            lock,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Held room lock. Dropping the last holder evicts the room's entry.
pub struct RoomGuard {
    room_id: Uuid,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        let mut map = self.locks.lock();
        self.guard.take();
        // the map and this guard; anyone else is waiting for the room
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_room_is_serialized() {
        let locks = Arc::new(RoomLocks::new());
        let room = Uuid::new_v4();
        let guard = locks.lock(room).await;
        let l = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = l.lock(room).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        // other rooms are independent
        let _other = locks.lock(Uuid::new_v4()).await;
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn idle_rooms_are_evicted() {
        let locks = Arc::new(RoomLocks::new());
        let room = Uuid::new_v4();
        drop(locks.lock(room).await);
        assert_eq!(locks.len(), 0);

        let guard = locks.lock(room).await;
        let l = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = l.lock(room).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }
}
