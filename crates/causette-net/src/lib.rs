// Realtime collaborators: presence store, notification relay, push gateway.

pub mod presence;
pub mod push;
pub mod relay;

mod error;

pub use error::{NetError, Result};
pub use presence::{MemoryPresence, PresenceSession, PresenceStore};
pub use push::{MemoryPushGateway, Platform, PushGateway, PushMessage, PushToken};
pub use relay::{MemoryRelay, Relay};
