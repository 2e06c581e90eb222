//! # causette-store
//!
//! The document-store collaborator behind the conversation engine.
//!
//! [`ConversationStore`] is the narrow interface the engine writes through:
//! point reads, participant-filtered realtime snapshots, and atomic
//! [`WriteBatch`] commits expressed as typed field operations.  The compound
//! send-message transition (insert + summary update + unread bumps) is one
//! batch, so readers only ever observe it as a single state change.
//!
//! [`MemoryStore`] is the in-process reference implementation used by tests
//! and the demo; a hosted document database adapter implements the same
//! trait.

pub mod memory;
pub mod ops;
pub mod store;

mod error;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use ops::{ConversationOp, MessageOp, NewConversation, NewMessage, WriteBatch, WriteOp};
pub use store::ConversationStore;
