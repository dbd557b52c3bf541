use crate::model::UserIdentity;
use crate::presence::ConnectionId;
use crate::router::BroadcastRouter;
use chat_protocol::{ServerEvent, TypingPayload};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Relays typing indicators to the other users of a room. Nothing is stored.
#[derive(Clone)]
pub struct TypingRelay {
    router: Arc<BroadcastRouter>,
}

impl TypingRelay {
    pub fn new(router: Arc<BroadcastRouter>) -> Self {
        Self { router }
    }

    pub fn start(&self, conn: ConnectionId, user: &UserIdentity, room_id: Uuid) -> bool {
        self.relay(conn, room_id, ServerEvent::TypingStart(payload(user, room_id)))
    }

    pub fn stop(&self, conn: ConnectionId, user: &UserIdentity, room_id: Uuid) -> bool {
        self.relay(conn, room_id, ServerEvent::TypingStop(payload(user, room_id)))
    }

    // Dropped silently when the connection is not subscribed to the room.
    fn relay(&self, conn: ConnectionId, room_id: Uuid, event: ServerEvent) -> bool {
        if !self.router.is_subscribed(conn, room_id) {
            debug!(%conn, %room_id, event = event.name(), "typing from unsubscribed connection dropped");
            return false;
        }
        let Some(user_id) = self.router.user_of(conn) else {
            return false;
        };
        self.router.broadcast_except_user(room_id, user_id, &event);
        true
    }
}

fn payload(user: &UserIdentity, room_id: Uuid) -> TypingPayload {
    TypingPayload {
        room_id,
        user_id: user.id,
        nickname: user.nickname.clone(),
    }
}
