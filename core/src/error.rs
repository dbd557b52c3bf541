use thiserror::Error;

/// Failures reported by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn backend(e: impl std::fmt::Display) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Errors surfaced to callers of the chat core.
///
/// Everything except `Timeout` and `Internal` is an expected outcome of
/// validation and is reported back to the client as a structured result.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("missing or invalid session token")]
    Unauthenticated,
    #[error("not a member of this room")]
    NotAMember,
    #[error("room not found")]
    RoomNotFound,
    #[error("message not found")]
    MessageNotFound,
    #[error("only the owner may do this")]
    NotOwner,
    #[error("only your last message can be edited")]
    NotLastMessage,
    #[error("another user has sent a message after yours")]
    Superseded,
    #[error("already a member of this room")]
    AlreadyMember,
    #[error("invalid input: {0}")]
    Validation(String),
    /// The store missed its deadline. The outcome is unknown to the caller;
    /// a write that still lands is broadcast like any other.
    #[error("store call timed out")]
    Timeout,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Unauthenticated => "unauthenticated",
            ChatError::NotAMember => "not-a-member",
            ChatError::RoomNotFound => "room-not-found",
            ChatError::MessageNotFound => "message-not-found",
            ChatError::NotOwner => "not-owner",
            ChatError::NotLastMessage => "not-last-message",
            ChatError::Superseded => "superseded",
            ChatError::AlreadyMember => "already-member",
            ChatError::Validation(_) => "validation",
            ChatError::Timeout => "timeout",
            ChatError::Internal(_) => "internal",
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ChatError::Validation(msg.into())
    }
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        ChatError::Internal(e.to_string())
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
