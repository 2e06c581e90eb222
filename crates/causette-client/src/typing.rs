//! Local typing transitions with debounced auto-expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::AbortHandle;
use tracing::{debug, warn};

use causette_shared::protocol::TypingEvent;
use causette_shared::{ConversationId, RelayEvent};
use causette_store::{ConversationOp, WriteBatch};

use crate::session::SessionContext;

struct ArmedTimer {
    seq: u64,
    handle: AbortHandle,
}

/// Publishes the local user's typing state and clears it automatically when
/// the window elapses without another keystroke.
///
/// All writes here are best-effort: a failed typing write is logged and
/// dropped, never surfaced, and never blocks the caller.
pub struct TypingCoordinator {
    ctx: SessionContext,
    timers: Arc<Mutex<HashMap<ConversationId, ArmedTimer>>>,
    seq: AtomicU64,
}

impl TypingCoordinator {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            timers: Arc::new(Mutex::new(HashMap::new())),
            seq: AtomicU64::new(0),
        }
    }

    /// Record a typing transition for the open conversation.
    ///
    /// `true` stamps the store and re-arms the expiry timer; each keystroke
    /// extends the window. `false` clears immediately (message sent, input
    /// emptied) and disarms the timer.
    pub async fn notify_typing(&self, conversation: ConversationId, is_typing: bool) {
        publish_state(&self.ctx, conversation, is_typing).await;

        if is_typing {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
            let ctx = self.ctx.clone();
            let timers = Arc::clone(&self.timers);
            let window = self.ctx.config.typing_window;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(window).await;
                // Only the newest timer for the conversation may clear;
                // a re-arm bumped the sequence and owns the entry now.
                let expired = match timers.lock() {
                    Ok(mut timers) => match timers.get(&conversation) {
                        Some(armed) if armed.seq == seq => {
                            timers.remove(&conversation);
                            true
                        }
                        _ => false,
                    },
                    Err(_) => false,
                };
                if expired {
                    debug!(conversation = %conversation, "Typing window expired");
                    publish_state(&ctx, conversation, false).await;
                }
            });
            let abort = handle.abort_handle();
            match self.timers.lock() {
                Ok(mut timers) => {
                    if let Some(prior) = timers.insert(conversation, ArmedTimer { seq, handle: abort }) {
                        prior.handle.abort();
                    }
                }
                Err(_) => handle.abort(),
            }
        } else if let Ok(mut timers) = self.timers.lock() {
            if let Some(prior) = timers.remove(&conversation) {
                prior.handle.abort();
            }
        }
    }

    /// Abort every armed timer without writing a clear.  On shutdown the
    /// indicator is left to lapse via the freshness window; a late write
    /// from a dead session is worse than a stale timestamp.
    pub fn shutdown(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            for (_, armed) in timers.drain() {
                armed.handle.abort();
            }
        }
    }
}

impl Drop for TypingCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn publish_state(ctx: &SessionContext, conversation: ConversationId, is_typing: bool) {
    let op = if is_typing {
        ConversationOp::TypingRefresh(ctx.user.id)
    } else {
        ConversationOp::TypingClear(ctx.user.id)
    };
    let mut batch = WriteBatch::new();
    batch.conversation(conversation, op);
    if let Err(error) = ctx.store.commit(batch).await {
        warn!(conversation = %conversation, %error, "Typing write failed");
    }

    let event = RelayEvent::Typing(TypingEvent {
        conversation,
        user: ctx.user.id,
        is_typing,
    });
    if let Err(error) = ctx.relay.publish(event).await {
        debug!(%error, "Typing relay publish failed");
    }
}
