use std::sync::Arc;
use std::time::Duration;

use chat_core::model::{JoinOutcome, Member, Message, OrderKey, Participant, Room, UserIdentity};
use chat_core::{
    ChatError, ChatHub, CoreConfig, MemoryStore, MessageStore, RoomStore, Session, StoreResult, UserStore,
};
use chat_protocol::ServerEvent;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use uuid::Uuid;

/// Memory store with artificial latency on selected calls.
#[derive(Default)]
struct Throttled {
    inner: MemoryStore,
    update_message: Duration,
    user_rooms: Duration,
    going_online: Duration,
}

fn pause(d: Duration) {
    if !d.is_zero() {
        std::thread::sleep(d);
    }
}

impl UserStore for Throttled {
    fn find_user(&self, id: &Uuid) -> StoreResult<Option<UserIdentity>> {
        self.inner.find_user(id)
    }
    fn set_online(&self, id: &Uuid, online: bool, last_seen_at: Option<i64>) -> StoreResult<()> {
        if online {
            pause(self.going_online);
        }
        self.inner.set_online(id, online, last_seen_at)
    }
}

impl RoomStore for Throttled {
    fn insert_room(&self, room: &Room) -> StoreResult<()> {
        self.inner.insert_room(room)
    }
    fn find_room(&self, id: &Uuid) -> StoreResult<Option<Room>> {
        self.inner.find_room(id)
    }
    fn soft_delete_room(&self, id: &Uuid, at: i64) -> StoreResult<()> {
        self.inner.soft_delete_room(id, at)
    }
    fn list_rooms(&self) -> StoreResult<Vec<(Room, u32)>> {
        self.inner.list_rooms()
    }
    fn find_participant(&self, room_id: &Uuid, user_id: &Uuid) -> StoreResult<Option<Participant>> {
        self.inner.find_participant(room_id, user_id)
    }
    fn join_participant(&self, room_id: &Uuid, user_id: &Uuid, at: i64) -> StoreResult<JoinOutcome> {
        self.inner.join_participant(room_id, user_id, at)
    }
    fn leave_participant(&self, room_id: &Uuid, user_id: &Uuid, at: i64) -> StoreResult<bool> {
        self.inner.leave_participant(room_id, user_id, at)
    }
    fn list_members(&self, room_id: &Uuid) -> StoreResult<Vec<Member>> {
        self.inner.list_members(room_id)
    }
    fn list_user_rooms(&self, user_id: &Uuid) -> StoreResult<Vec<Room>> {
        // the answer is stale by the time it is returned
        let rooms = self.inner.list_user_rooms(user_id);
        pause(self.user_rooms);
        rooms
    }
}

impl MessageStore for Throttled {
    fn insert_message(&self, msg: &Message) -> StoreResult<()> {
        self.inner.insert_message(msg)
    }
    fn find_message(&self, id: &Uuid) -> StoreResult<Option<Message>> {
        self.inner.find_message(id)
    }
    fn update_message(&self, msg: &Message) -> StoreResult<()> {
        pause(self.update_message);
        self.inner.update_message(msg)
    }
    fn newest_in_room(&self, room_id: &Uuid) -> StoreResult<Option<OrderKey>> {
        self.inner.newest_in_room(room_id)
    }
    fn latest_active_by_sender(&self, room_id: &Uuid, sender_id: &Uuid) -> StoreResult<Option<Message>> {
        self.inner.latest_active_by_sender(room_id, sender_id)
    }
    fn has_newer_from_others(&self, room_id: &Uuid, sender_id: &Uuid, after: OrderKey) -> StoreResult<bool> {
        self.inner.has_newer_from_others(room_id, sender_id, after)
    }
    fn page(&self, room_id: &Uuid, before: Option<OrderKey>, take: usize) -> StoreResult<Vec<Message>> {
        self.inner.page(room_id, before, take)
    }
}

fn setup(store: Throttled, store_timeout: Duration) -> (Arc<ChatHub>, Arc<Throttled>) {
    let store = Arc::new(store);
    let hub = ChatHub::new(
        Arc::new(MemoryStore::new()),
        store.clone(),
        CoreConfig {
            store_timeout,
            ..CoreConfig::default()
        },
    );
    (hub, store)
}

async fn online(hub: &ChatHub, user: &UserIdentity) -> (Session, UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = unbounded_channel();
    (hub.connect(user.clone(), tx).await.unwrap(), rx)
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[tokio::test]
async fn timed_out_edit_still_precedes_the_next_message() {
    let (hub, store) = setup(
        Throttled {
            update_message: ms(300),
            ..Default::default()
        },
        ms(100),
    );
    let a = store.inner.add_user("alice", "ta");
    let b = store.inner.add_user("bob", "tb");
    let room = hub.rooms().create_room(&a, "general").await.unwrap();
    hub.rooms().join(room.id, &b).await.unwrap();
    let (_b_session, mut b_rx) = online(&hub, &b).await;
    drain(&mut b_rx);

    let mine = hub.messages().create(room.id, a.id, "mine").await.unwrap();
    assert_eq!(
        hub.messages().edit(mine.id, a.id, "edited").await,
        Err(ChatError::Timeout)
    );
    // waits for the room until the late edit has landed
    let spoke = hub.messages().create(room.id, b.id, "bob spoke").await.unwrap();

    let stored = store.find_message(&mine.id).unwrap().unwrap();
    assert!(stored.is_edited);
    assert!(stored.updated_at <= spoke.created_at);
    match drain(&mut b_rx).as_slice() {
        [ServerEvent::MessageNew(first), ServerEvent::MessageUpdated(edit), ServerEvent::MessageNew(last)] => {
            assert_eq!(first.id, mine.id);
            assert_eq!(edit.id, mine.id);
            assert_eq!(edit.content, "edited");
            assert_eq!(last.id, spoke.id);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn leave_while_connecting_is_not_undone() {
    let (hub, store) = setup(
        Throttled {
            user_rooms: ms(80),
            ..Default::default()
        },
        ms(1000),
    );
    let a = store.inner.add_user("alice", "ta");
    let b = store.inner.add_user("bob", "tb");
    let room = hub.rooms().create_room(&a, "general").await.unwrap();
    hub.rooms().join(room.id, &b).await.unwrap();

    let (tx, mut b_rx) = unbounded_channel();
    let connecting = {
        let hub = hub.clone();
        let b = b.clone();
        tokio::spawn(async move { hub.connect(b, tx).await })
    };
    tokio::time::sleep(ms(20)).await;
    hub.rooms().leave(room.id, &b).await.unwrap();
    let session = connecting.await.unwrap().unwrap();

    assert!(!hub.router().is_subscribed(session.connection_id, room.id));
    hub.messages().create(room.id, a.id, "after").await.unwrap();
    let events = drain(&mut b_rx);
    assert!(matches!(events.as_slice(), [ServerEvent::Ready(_)]), "{events:?}");
}

#[tokio::test]
async fn slow_online_write_never_overtakes_offline() {
    let (hub, store) = setup(
        Throttled {
            going_online: ms(150),
            ..Default::default()
        },
        ms(50),
    );
    let a = store.inner.add_user("alice", "ta");
    let (session, _rx) = online(&hub, &a).await;
    hub.disconnect(&session);

    let mut settled = false;
    for _ in 0..60 {
        let stored = store.find_user(&a.id).unwrap().unwrap();
        if !stored.is_online && stored.last_seen_at.is_some() {
            settled = true;
            break;
        }
        tokio::time::sleep(ms(50)).await;
    }
    assert!(settled, "offline never persisted");
    tokio::time::sleep(ms(300)).await;
    assert!(!store.find_user(&a.id).unwrap().unwrap().is_online);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_writers_keep_the_edit_rule() {
    let (hub, store) = setup(Throttled::default(), ms(5000));
    let a = store.inner.add_user("alice", "ta");
    let b = store.inner.add_user("bob", "tb");
    let c = store.inner.add_user("carol", "tc");
    let room = hub.rooms().create_room(&a, "busy").await.unwrap();
    hub.rooms().join(room.id, &b).await.unwrap();
    hub.rooms().join(room.id, &c).await.unwrap();
    let (_c_session, mut c_rx) = online(&hub, &c).await;
    drain(&mut c_rx);
    let (a_id, b_id) = (a.id, b.id);

    let alice = {
        let hub = hub.clone();
        tokio::spawn(async move {
            let mut edits = 0;
            for i in 0..40 {
                let m = hub.messages().create(room.id, a_id, &format!("a{i}")).await.unwrap();
                tokio::task::yield_now().await;
                match hub.messages().edit(m.id, a_id, &format!("a{i}!")).await {
                    Ok(_) => edits += 1,
                    Err(ChatError::Superseded) => {}
                    Err(e) => panic!("unexpected {e:?}"),
                }
            }
            edits
        })
    };
    let bob = {
        let hub = hub.clone();
        tokio::spawn(async move {
            for i in 0..40 {
                hub.messages().create(room.id, b_id, &format!("b{i}")).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    let edits = alice.await.unwrap();
    bob.await.unwrap();

    // replaying one connection's feed must reproduce commit order
    let mut newest: Option<(i64, Uuid)> = None;
    let (mut created, mut updated) = (0, 0);
    for event in drain(&mut c_rx) {
        match event {
            ServerEvent::MessageNew(m) => {
                let key = (m.created_at, m.id);
                assert!(newest.map_or(true, |n| key > n), "out of order: {m:?}");
                newest = Some(key);
                created += 1;
            }
            ServerEvent::MessageUpdated(m) => {
                assert_eq!(newest.map(|n| n.1), Some(m.id), "edited after someone spoke");
                assert_eq!(m.sender_id, a_id);
                updated += 1;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(created, 80);
    assert_eq!(updated, edits);
}
