use crate::presence::ConnectionId;
use chat_protocol::ServerEvent;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use uuid::Uuid;

/// Outbound half of a connection's event queue.
pub type Outbox = UnboundedSender<ServerEvent>;

struct Attached {
    user_id: Uuid,
    outbox: Outbox,
    rooms: HashSet<Uuid>,
    // broadcasts skip connections that are not open yet
    open: bool,
    // rooms left or deleted while pending; `open` must not subscribe them
    dropped: HashSet<Uuid>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Attached>,
    rooms: HashMap<Uuid, HashSet<ConnectionId>>,
}

impl Inner {
    fn send(&self, conn: &ConnectionId, event: &ServerEvent) -> bool {
        match self.connections.get(conn) {
            Some(a) => a.outbox.send(event.clone()).is_ok(),
            None => false,
        }
    }
}

/// Room-scoped fan-out of server events to live connections.
///
/// Every send happens under the router lock into a per-connection FIFO
/// queue, so a single connection observes events in emission order.
#[derive(Default)]
pub struct BroadcastRouter {
    inner: Mutex<Inner>,
}

impl BroadcastRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection that receives broadcasts right away.
    pub fn attach(&self, conn: ConnectionId, user_id: Uuid, outbox: Outbox) {
        self.insert(conn, user_id, outbox, true);
    }

    /// Attach a connection that only receives broadcasts once [`BroadcastRouter::open`] runs.
    ///
    /// Subscriptions can be added while pending.
    pub fn attach_pending(&self, conn: ConnectionId, user_id: Uuid, outbox: Outbox) {
        self.insert(conn, user_id, outbox, false);
    }

    fn insert(&self, conn: ConnectionId, user_id: Uuid, outbox: Outbox, open: bool) {
        self.inner.lock().connections.insert(
            conn,
            Attached {
                user_id,
                outbox,
                rooms: HashSet::new(),
                open,
                dropped: HashSet::new(),
            },
        );
    }

    /// Subscribe a pending connection to `rooms`, deliver `first` and open it.
    ///
    /// Nothing reaches the connection before `first`. Rooms unsubscribed or
    /// closed since the connection was attached are skipped, so a stale
    /// `rooms` snapshot cannot resurrect them.
    pub fn open(&self, conn: ConnectionId, rooms: impl IntoIterator<Item = Uuid>, first: &ServerEvent) -> bool {
        let mut guard = self.inner.lock();
        let Some(a) = guard.connections.get_mut(&conn) else {
            return false;
        };
        let dropped = std::mem::take(&mut a.dropped);
        let rooms: Vec<Uuid> = rooms.into_iter().filter(|r| !dropped.contains(r)).collect();
        a.rooms.extend(rooms.iter().copied());
        a.open = true;
        let delivered = a.outbox.send(first.clone()).is_ok();
        for room in rooms {
            guard.rooms.entry(room).or_default().insert(conn);
        }
        delivered
    }

    /// Drop a connection and all of its subscriptions.
    pub fn detach(&self, conn: ConnectionId) {
        let mut guard = self.inner.lock();
        if let Some(attached) = guard.connections.remove(&conn) {
            for room in attached.rooms {
                if let Some(set) = guard.rooms.get_mut(&room) {
                    set.remove(&conn);
                    if set.is_empty() {
                        guard.rooms.remove(&room);
                    }
                }
            }
        }
    }

    /// Mirror a membership into the transport. Returns false for unknown connections.
    pub fn subscribe(&self, conn: ConnectionId, room_id: Uuid) -> bool {
        let mut guard = self.inner.lock();
        match guard.connections.get_mut(&conn) {
            Some(a) => {
                a.rooms.insert(room_id);
                a.dropped.remove(&room_id);
            }
            None => return false,
        }
        guard.rooms.entry(room_id).or_default().insert(conn);
        true
    }

    pub fn unsubscribe(&self, conn: ConnectionId, room_id: Uuid) {
        let mut guard = self.inner.lock();
        if let Some(a) = guard.connections.get_mut(&conn) {
            a.rooms.remove(&room_id);
            if !a.open {
                a.dropped.insert(room_id);
            }
        }
        if let Some(set) = guard.rooms.get_mut(&room_id) {
            set.remove(&conn);
            if set.is_empty() {
                guard.rooms.remove(&room_id);
            }
        }
    }

    /// Deliver to every subscriber of the room. Returns the number reached.
    pub fn broadcast(&self, room_id: Uuid, event: &ServerEvent) -> usize {
        self.broadcast_where(room_id, event, |_| true)
    }

    /// Deliver to subscribers of the room except connections of `user_id`.
    pub fn broadcast_except_user(&self, room_id: Uuid, user_id: Uuid, event: &ServerEvent) -> usize {
        self.broadcast_where(room_id, event, |owner| owner != user_id)
    }

    fn broadcast_where(&self, room_id: Uuid, event: &ServerEvent, keep: impl Fn(Uuid) -> bool) -> usize {
        let guard = self.inner.lock();
        let Some(subs) = guard.rooms.get(&room_id) else {
            return 0;
        };
        let mut reached = 0;
        for conn in subs {
            let Some(a) = guard.connections.get(conn) else {
                continue;
            };
            if a.open && keep(a.user_id) && a.outbox.send(event.clone()).is_ok() {
                reached += 1;
            }
        }
        debug!(%room_id, event = event.name(), reached, "room broadcast");
        reached
    }

    /// Deliver to every attached connection.
    pub fn broadcast_all(&self, event: &ServerEvent) -> usize {
        let guard = self.inner.lock();
        guard
            .connections
            .values()
            .filter(|a| a.open && a.outbox.send(event.clone()).is_ok())
            .count()
    }

    pub fn send_to(&self, conn: ConnectionId, event: &ServerEvent) -> bool {
        self.inner.lock().send(&conn, event)
    }

    /// Deliver a terminal event, then drop every subscription of the room.
    pub fn close_room(&self, room_id: Uuid, terminal: &ServerEvent) -> usize {
        let mut guard = self.inner.lock();
        for a in guard.connections.values_mut().filter(|a| !a.open) {
            a.dropped.insert(room_id);
        }
        let Some(subs) = guard.rooms.remove(&room_id) else {
            return 0;
        };
        let mut reached = 0;
        for conn in &subs {
            if let Some(a) = guard.connections.get_mut(conn) {
                a.rooms.remove(&room_id);
                if a.open && a.outbox.send(terminal.clone()).is_ok() {
                    reached += 1;
                }
            }
        }
        reached
    }

    pub fn is_subscribed(&self, conn: ConnectionId, room_id: Uuid) -> bool {
        self.inner
            .lock()
            .connections
            .get(&conn)
            .is_some_and(|a| a.rooms.contains(&room_id))
    }

    #[cfg(test)]
    pub(crate) fn subscribers(&self, room_id: Uuid) -> Vec<ConnectionId> {
        self.inner
            .lock()
            .rooms
            .get(&room_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn user_of(&self, conn: ConnectionId) -> Option<Uuid> {
        self.inner.lock().connections.get(&conn).map(|a| a.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_protocol::{MessageDeletedPayload, RoomRef};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn deleted(room_id: Uuid, n: u128) -> ServerEvent {
        ServerEvent::MessageDeleted(MessageDeletedPayload {
            message_id: Uuid::from_u128(n),
            room_id,
        })
    }

    fn attach(router: &BroadcastRouter, user: Uuid) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = unbounded_channel();
        let conn = ConnectionId::new();
        router.attach(conn, user, tx);
        (conn, rx)
    }

    #[test]
    fn delivers_only_to_subscribers_in_order() {
        let router = BroadcastRouter::new();
        let room = Uuid::new_v4();
        let (a, mut rx_a) = attach(&router, Uuid::new_v4());
        let (_b, mut rx_b) = attach(&router, Uuid::new_v4());
        assert!(router.subscribe(a, room));
        for n in 0..5 {
            assert_eq!(router.broadcast(room, &deleted(room, n)), 1);
        }
        for n in 0..5 {
            assert_eq!(rx_a.try_recv().unwrap(), deleted(room, n));
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_and_detach_stop_delivery() {
        let router = BroadcastRouter::new();
        let room = Uuid::new_v4();
        let (a, mut rx_a) = attach(&router, Uuid::new_v4());
        let (b, mut rx_b) = attach(&router, Uuid::new_v4());
        router.subscribe(a, room);
        router.subscribe(b, room);
        router.unsubscribe(a, room);
        router.detach(b);
        assert_eq!(router.broadcast(room, &deleted(room, 1)), 0);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
        assert!(!router.subscribe(b, room));
    }

    #[test]
    fn excludes_every_connection_of_the_sender() {
        let router = BroadcastRouter::new();
        let room = Uuid::new_v4();
        let ann = Uuid::new_v4();
        let (a1, mut rx1) = attach(&router, ann);
        let (a2, mut rx2) = attach(&router, ann);
        let (b, mut rx_b) = attach(&router, Uuid::new_v4());
        for c in [a1, a2, b] {
            router.subscribe(c, room);
        }
        assert_eq!(router.broadcast_except_user(room, ann, &deleted(room, 1)), 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn pending_connections_open_with_first_event() {
        let router = BroadcastRouter::new();
        let room = Uuid::new_v4();
        let (tx, mut rx) = unbounded_channel();
        let conn = ConnectionId::new();
        router.attach_pending(conn, Uuid::new_v4(), tx);
        router.subscribe(conn, room);
        assert_eq!(router.broadcast(room, &deleted(room, 1)), 0);
        let first = ServerEvent::RoomDeleted(RoomRef { room_id: Uuid::nil() });
        assert!(router.open(conn, [room], &first));
        assert_eq!(router.broadcast(room, &deleted(room, 2)), 1);
        assert_eq!(rx.try_recv().unwrap(), first);
        assert_eq!(rx.try_recv().unwrap(), deleted(room, 2));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pending_connections_keep_removals() {
        let router = BroadcastRouter::new();
        let (left, deleted_room, kept) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (tx, mut rx) = unbounded_channel();
        let conn = ConnectionId::new();
        router.attach_pending(conn, Uuid::new_v4(), tx);
        router.unsubscribe(conn, left);
        router.close_room(deleted_room, &deleted(deleted_room, 0));
        let first = ServerEvent::RoomDeleted(RoomRef { room_id: Uuid::nil() });
        assert!(router.open(conn, [left, deleted_room, kept], &first));
        assert!(!router.is_subscribed(conn, left));
        assert!(!router.is_subscribed(conn, deleted_room));
        assert!(router.is_subscribed(conn, kept));
        assert_eq!(rx.try_recv().unwrap(), first);

        // a later join wins over an earlier leave
        let (tx, _rx) = unbounded_channel();
        let other = ConnectionId::new();
        router.attach_pending(other, Uuid::new_v4(), tx);
        router.unsubscribe(other, left);
        router.subscribe(other, left);
        router.open(other, [], &first);
        assert!(router.is_subscribed(other, left));
    }

    #[test]
    fn close_room_is_terminal() {
        let router = BroadcastRouter::new();
        let room = Uuid::new_v4();
        let (a, mut rx) = attach(&router, Uuid::new_v4());
        router.subscribe(a, room);
        let terminal = ServerEvent::RoomDeleted(RoomRef { room_id: room });
        assert_eq!(router.close_room(room, &terminal), 1);
        assert_eq!(router.broadcast(room, &deleted(room, 2)), 0);
        assert_eq!(rx.try_recv().unwrap(), terminal);
        assert!(rx.try_recv().is_err());
        assert!(!router.is_subscribed(a, room));
    }
}
