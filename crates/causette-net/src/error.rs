use thiserror::Error;

/// Errors produced by the realtime collaborators.
#[derive(Error, Debug)]
pub enum NetError {
    /// A relay frame failed to encode or decode.
    #[error("Frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The presence session was already torn down.
    #[error("Presence session disconnected")]
    Disconnected,

    /// No push registration exists for the target user.
    #[error("No push registration for user")]
    NotRegistered,

    /// A shared-state lock was poisoned by a panicking writer.
    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetError>;
