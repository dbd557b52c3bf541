//! Entry point tying connections, presence, rooms and messages together.

use crate::error::{ChatError, ChatResult};
use crate::locks::RoomLocks;
use crate::messages::MessageEngine;
use crate::model::UserIdentity;
use crate::presence::{presence_queue, run_presence_writer, ConnectionId, ConnectionRegistry, Transition};
use crate::rooms::RoomDirectory;
use crate::router::{BroadcastRouter, Outbox};
use crate::store::{SessionStore, Store, StoreHandle};
use crate::typing::TypingRelay;
use chat_protocol::{ClientEvent, MessagePayload, PresencePayload, ReadyPayload, ServerEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Deadline for a single store call.
    pub store_timeout: Duration,
    /// Base delay between presence write retries.
    pub presence_backoff: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            presence_backoff: Duration::from_millis(100),
        }
    }
}

/// An authenticated live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user: UserIdentity,
}

/// Outcome of a dispatched client event that expects an acknowledgement.
pub type Reply = ChatResult<Option<MessagePayload>>;

pub struct ChatHub {
    sessions: StoreHandle<dyn SessionStore>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<BroadcastRouter>,
    messages: MessageEngine,
    rooms: RoomDirectory,
    typing: TypingRelay,
    // orders presence edges with their broadcasts
    presence_gate: Mutex<()>,
}

impl ChatHub {
    /// Build the hub and spawn the presence writer. Must run inside a tokio runtime.
    pub fn new(sessions: Arc<dyn SessionStore>, store: Arc<dyn Store>, config: CoreConfig) -> Arc<Self> {
        let store = StoreHandle::new(store, config.store_timeout);
        let (tx, rx) = presence_queue();
        tokio::spawn(run_presence_writer(store.clone(), rx, config.presence_backoff));

        let registry = Arc::new(ConnectionRegistry::with_changes(tx));
        let router = Arc::new(BroadcastRouter::new());
        let locks = Arc::new(RoomLocks::new());
        Arc::new(Self {
            sessions: StoreHandle::new(sessions, config.store_timeout),
            messages: MessageEngine::new(store.clone(), router.clone(), locks.clone()),
            rooms: RoomDirectory::new(store, router.clone(), registry.clone(), locks),
            typing: TypingRelay::new(router.clone()),
            registry,
            router,
            presence_gate: Mutex::new(()),
        })
    }

    pub fn messages(&self) -> &MessageEngine {
        &self.messages
    }

    pub fn rooms(&self) -> &RoomDirectory {
        &self.rooms
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }

    /// Resolve a bearer token to its user.
    pub async fn authenticate(&self, token: &str) -> ChatResult<UserIdentity> {
        if token.is_empty() {
            return Err(ChatError::Unauthenticated);
        }
        let token = token.to_owned();
        self.sessions
            .call(move |s| s.validate_token(&token))
            .await?
            .ok_or(ChatError::Unauthenticated)
    }

    /// Attach a live connection for an authenticated user.
    ///
    /// The connection is subscribed to every room the user participates in
    /// and receives `ready` before any other event.
    pub async fn connect(&self, user: UserIdentity, outbox: Outbox) -> ChatResult<Session> {
        let conn = ConnectionId::new();
        let user_id = user.id;
        // pending until its rooms are subscribed so Ready is always first
        self.router.attach_pending(conn, user_id, outbox);
        {
            let _gate = self.presence_gate.lock();
            if self.registry.register(user_id, conn) == Some(Transition::Online) {
                self.router.broadcast_all(&ServerEvent::Presence(PresencePayload {
                    user_id,
                    nickname: user.nickname.clone(),
                    is_online: true,
                    last_seen_at: None,
                }));
            }
        }
        let mut session = Session {
            connection_id: conn,
            user,
        };
        // attached first so joins and leaves racing this read are still mirrored
        let rooms = match self.rooms.user_rooms(user_id).await {
            Ok(rooms) => rooms,
            Err(e) => {
                self.disconnect(&session);
                return Err(e);
            }
        };
        self.router.open(
            conn,
            rooms.iter().map(|r| r.id),
            &ServerEvent::Ready(ReadyPayload {
                user_id,
                nickname: session.user.nickname.clone(),
            }),
        );

        session.user.is_online = true;
        info!(%conn, %user_id, rooms = rooms.len(), "connection attached");
        Ok(session)
    }

    /// Tear down a connection. Safe to call more than once.
    pub fn disconnect(&self, session: &Session) {
        let conn = session.connection_id;
        let user_id = session.user.id;
        self.router.detach(conn);
        let _gate = self.presence_gate.lock();
        if let Some(Transition::Offline { last_seen_at }) = self.registry.unregister(user_id, conn) {
            self.router.broadcast_all(&ServerEvent::Presence(PresencePayload {
                user_id,
                nickname: session.user.nickname.clone(),
                is_online: false,
                last_seen_at: Some(last_seen_at),
            }));
        }
        info!(%conn, %user_id, "connection detached");
    }

    /// Handle one decoded client event.
    ///
    /// Returns `None` for fire-and-forget events.
    pub async fn dispatch(&self, session: &Session, event: ClientEvent) -> Option<Reply> {
        let conn = session.connection_id;
        let user = &session.user;
        let reply: Reply = match event {
            ClientEvent::JoinRoom(r) => self.rooms.subscribe(conn, user.id, r.room_id).await.map(|_| None),
            ClientEvent::LeaveRoom(r) => {
                self.rooms.unsubscribe(conn, r.room_id);
                Ok(None)
            }
            ClientEvent::SendMessage(m) => self
                .messages
                .create(m.room_id, user.id, &m.content)
                .await
                .map(|msg| Some(msg.to_payload())),
            ClientEvent::EditMessage(m) => self
                .messages
                .edit_in_room(m.room_id, m.message_id, user.id, &m.content)
                .await
                .map(|msg| Some(msg.to_payload())),
            ClientEvent::DeleteMessage(m) => self
                .messages
                .delete_in_room(m.room_id, m.message_id, user.id)
                .await
                .map(|_| None),
            ClientEvent::TypingStart(r) => {
                self.typing.start(conn, user, r.room_id);
                return None;
            }
            ClientEvent::TypingStop(r) => {
                self.typing.stop(conn, user, r.room_id);
                return None;
            }
        };
        if let Err(e) = &reply {
            warn!(%conn, user_id = %user.id, code = e.code(), "client event rejected");
        }
        Some(reply)
    }
}
