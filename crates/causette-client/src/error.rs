use thiserror::Error;

use causette_net::NetError;
use causette_shared::{ConversationId, MessageId};
use causette_store::StoreError;

/// Errors surfaced to callers of the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Message text was empty after trimming.
    #[error("Message text is empty")]
    EmptyMessage,

    /// A required parameter was missing or malformed.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("Conversation {0} not found")]
    ConversationNotFound(ConversationId),

    #[error("Message {0} not found")]
    MessageNotFound(MessageId),

    /// The group's settings forbid this operation for the current user.
    #[error("Operation not permitted by group settings")]
    NotPermitted,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Net(#[from] NetError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
