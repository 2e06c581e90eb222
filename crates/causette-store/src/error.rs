use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A read or batch op referenced a conversation or message that does not
    /// exist.
    #[error("Record not found")]
    NotFound,

    /// A write would violate a document invariant.
    #[error("Invalid write: {0}")]
    InvalidWrite(String),

    /// The state lock was poisoned by a panicking writer.
    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
