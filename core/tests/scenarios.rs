use std::{
    io,
    sync::{Arc, Mutex},
};

use chat_core::{ChatError, ChatHub, CoreConfig, MemoryStore, Session, UserIdentity};
use chat_protocol::{RoomRef, ServerEvent};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

struct LogWriter(Arc<Mutex<Vec<u8>>>);
impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
struct MakeLogWriter(Arc<Mutex<Vec<u8>>>);
impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for MakeLogWriter {
    type Writer = LogWriter;
    fn make_writer(&'a self) -> Self::Writer {
        LogWriter(self.0.clone())
    }
}

fn setup() -> (Arc<ChatHub>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let hub = ChatHub::new(store.clone(), store.clone(), CoreConfig::default());
    (hub, store)
}

async fn online(hub: &ChatHub, user: &UserIdentity) -> (Session, UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = unbounded_channel();
    (hub.connect(user.clone(), tx).await.unwrap(), rx)
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[tokio::test]
async fn newer_message_from_another_user_supersedes() {
    let (hub, store) = setup();
    let a = store.add_user("alice", "ta");
    let b = store.add_user("bob", "tb");

    let general = hub.rooms().create_room(&a, "general").await.unwrap();
    hub.rooms().join(general.id, &b).await.unwrap();

    let hi = hub.messages().create(general.id, b.id, "hi").await.unwrap();
    let hello = hub.messages().create(general.id, a.id, "hello").await.unwrap();
    assert!(hello.created_at > hi.created_at);

    assert_eq!(
        hub.messages().edit(hi.id, b.id, "hi there").await,
        Err(ChatError::Superseded)
    );
    let edited = hub.messages().edit(hello.id, a.id, "hello all").await.unwrap();
    assert!(edited.is_edited);
    assert_eq!(edited.created_at, hello.created_at);
}

#[tokio::test]
async fn pages_cover_history_exactly_once() {
    let (hub, store) = setup();
    let a = store.add_user("alice", "ta");
    let room = hub.rooms().create_room(&a, "history").await.unwrap();
    let mut sent = Vec::new();
    for n in 0..23 {
        sent.push(hub.messages().create(room.id, a.id, &format!("m{n}")).await.unwrap().id);
    }

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = hub.messages().list_by_room(room.id, cursor, 5).await.unwrap();
        seen.extend(page.messages.iter().map(|m| m.id));
        if !page.has_more {
            assert_eq!(page.next_cursor, None);
            break;
        }
        cursor = page.next_cursor;
    }
    sent.reverse();
    assert_eq!(seen, sent);
}

#[tokio::test]
async fn members_see_live_traffic_until_room_is_deleted() {
    let (hub, store) = setup();
    let a = store.add_user("alice", "ta");
    let b = store.add_user("bob", "tb");
    let room = hub.rooms().create_room(&a, "general").await.unwrap();
    hub.rooms().join(room.id, &b).await.unwrap();

    let (_a_session, mut a_rx) = online(&hub, &a).await;
    let (_b_session, mut b_rx) = online(&hub, &b).await;
    drain(&mut a_rx);
    drain(&mut b_rx);

    let msg = hub.messages().create(room.id, a.id, "ping").await.unwrap();
    assert!(matches!(drain(&mut b_rx).as_slice(), [ServerEvent::MessageNew(p)] if p.id == msg.id));
    drain(&mut a_rx);

    hub.rooms().delete_room(room.id, a.id).await.unwrap();
    assert_eq!(
        drain(&mut b_rx),
        vec![ServerEvent::RoomDeleted(RoomRef { room_id: room.id })]
    );
    assert_eq!(
        hub.messages().create(room.id, a.id, "after").await,
        Err(ChatError::RoomNotFound)
    );
    assert_eq!(
        hub.messages().edit(msg.id, a.id, "again").await,
        Err(ChatError::MessageNotFound)
    );
    assert!(drain(&mut a_rx)
        .iter()
        .all(|e| !matches!(e, ServerEvent::MessageNew(_) | ServerEvent::MessageUpdated(_))));
    assert!(drain(&mut b_rx).is_empty());
}

#[tokio::test]
async fn room_lifecycle_is_logged() {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(MakeLogWriter(buf.clone()))
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let (hub, store) = setup();
    let a = store.add_user("alice", "ta");
    let room = hub.rooms().create_room(&a, "logged").await.unwrap();
    hub.rooms().delete_room(room.id, a.id).await.unwrap();

    let logs = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
    assert!(logs.contains("room created"), "logs: {logs}");
    assert!(logs.contains("room deleted"), "logs: {logs}");
}
