//! # causette-client
//!
//! The conversation engine behind the Causette UI: session lifecycle,
//! conversation and message synchronization, presence, typing, composition,
//! and notification dispatch.  Every external surface (store, relay,
//! presence, push, identity, notification sink) is an injected collaborator,
//! so the whole engine runs in-process against the memory backends.

pub mod client;
pub mod compose;
pub mod config;
pub mod notify;
pub mod presence;
pub mod session;
pub mod sync;
pub mod typing;

mod error;

pub use client::{Backends, ChatClient};
pub use compose::Composer;
pub use config::ClientConfig;
pub use error::{EngineError, Result};
pub use notify::{
    LogSink, NoWindows, Notification, NotificationDispatcher, NotificationSink, WindowBridge,
};
pub use presence::PresenceTracker;
pub use session::{AuthEvent, IdentityProvider, MemoryIdentity, Session, SessionContext};
pub use sync::{
    ConversationList, ConversationSummary, ConversationSynchronizer, ConversationView,
    DetailState, MessageState, OpenConversation,
};
pub use typing::TypingCoordinator;

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber. Call once, early.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("causette_client=debug,causette_store=info,causette_net=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
