//! # causette-shared
//!
//! Domain model, relay protocol and subscription primitives shared by every
//! causette crate.
//!
//! The conversation and message documents live here so the store, the network
//! collaborators and the client engine all agree on one shape.  Everything
//! derives `Serialize`/`Deserialize` so snapshots can be handed straight to a
//! UI layer.

pub mod constants;
pub mod model;
pub mod protocol;
pub mod subscription;
pub mod types;

pub use model::*;
pub use protocol::RelayEvent;
pub use subscription::{Subscription, TaskGuard};
pub use types::{ConversationId, MessageId, UserId};
