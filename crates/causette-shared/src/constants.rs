use std::time::Duration;

/// Application name
pub const APP_NAME: &str = "Causette";

/// Freshness window for a typing stamp, in milliseconds. A stamp older than
/// this reads as "not typing" even without an explicit clear.
pub const TYPING_WINDOW_MS: u64 = 5_000;

/// [`TYPING_WINDOW_MS`] as a `Duration`.
pub const TYPING_WINDOW: Duration = Duration::from_millis(TYPING_WINDOW_MS);

/// Text substituted for a soft-deleted message. Immutable once applied.
pub const DELETED_MESSAGE_PLACEHOLDER: &str = "This message was deleted";

/// Pub/sub channel all relay notifications travel on.
pub const RELAY_CHANNEL: &str = "chat-notifications";

/// Buffer size for snapshot subscription channels (mpsc).
pub const SUBSCRIPTION_BUFFER: usize = 64;

/// Buffer size for in-memory fan-out channels (broadcast).
pub const BROADCAST_BUFFER: usize = 256;
