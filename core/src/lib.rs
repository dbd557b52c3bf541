//! Real-time chat core: connection presence, room fan-out, message
//! mutation rules and typing relay, independent of any transport.

pub mod error;
pub mod hub;
pub mod locks;
pub mod memory;
pub mod messages;
pub mod model;
pub mod presence;
pub mod rooms;
pub mod router;
pub mod store;
pub mod typing;

pub use error::{ChatError, ChatResult, StoreError};
pub use hub::{ChatHub, CoreConfig, Reply, Session};
pub use memory::MemoryStore;
pub use messages::{MessageEngine, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
pub use model::{Member, Message, MessagePage, Room, UserIdentity};
pub use presence::{ConnectionId, ConnectionRegistry};
pub use rooms::RoomDirectory;
pub use router::{BroadcastRouter, Outbox};
pub use store::{MessageStore, RoomStore, SessionStore, Store, StoreHandle, StoreResult, UserStore};
