//! Notification dispatch from the relay and the push gateway.
//!
//! Two loops feed one suppression policy: nothing is shown for the user's
//! own activity or for the conversation currently on screen.  Remote chat
//! actions are folded into the local store here as well, so a peer's
//! archive/delete/mark-read lands without a round-trip through the backend.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use causette_shared::protocol::{ChatActionEvent, ChatActionKind};
use causette_shared::{ConversationId, RelayEvent, TaskGuard, UserSummary};
use causette_store::{ConversationOp, ConversationStore, WriteBatch};

use crate::session::SessionContext;

/// A user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Platform surfaces coalesce notifications that share a tag.
    pub tag: ConversationId,
    /// Background notifications stay on screen until dismissed.
    pub require_interaction: bool,
}

/// Platform surface that renders notifications.
pub trait NotificationSink: Send + Sync {
    fn show(&self, notification: Notification);
}

/// Window management hooks for notification activation.
pub trait WindowBridge: Send + Sync {
    /// Focus an existing window on the conversation; `false` if none is open.
    fn focus(&self, conversation: ConversationId) -> bool;
    /// Open a new window on the conversation.
    fn open(&self, conversation: ConversationId);
}

/// Sink that logs notifications instead of rendering them.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn show(&self, notification: Notification) {
        info!(
            conversation = %notification.tag,
            title = %notification.title,
            "Notification"
        );
    }
}

/// Bridge for headless runs with no windows to manage.
pub struct NoWindows;

impl WindowBridge for NoWindows {
    fn focus(&self, _conversation: ConversationId) -> bool {
        false
    }

    fn open(&self, conversation: ConversationId) {
        debug!(conversation = %conversation, "Window requested");
    }
}

/// Consumes relay events and push deliveries for the session.
pub struct NotificationDispatcher {
    ctx: SessionContext,
    sink: Arc<dyn NotificationSink>,
    windows: Arc<dyn WindowBridge>,
    focused: Arc<Mutex<Option<ConversationId>>>,
    roster: Arc<Mutex<Vec<UserSummary>>>,
    loops: Mutex<Vec<TaskGuard>>,
}

impl NotificationDispatcher {
    pub fn new(
        ctx: SessionContext,
        sink: Arc<dyn NotificationSink>,
        windows: Arc<dyn WindowBridge>,
    ) -> Self {
        Self {
            ctx,
            sink,
            windows,
            focused: Arc::new(Mutex::new(None)),
            roster: Arc::new(Mutex::new(Vec::new())),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the relay and push consumption loops.
    pub fn start(&self) {
        let relay = {
            let ctx = self.ctx.clone();
            let sink = self.sink.clone();
            let focused = self.focused.clone();
            let roster = self.roster.clone();
            tokio::spawn(async move {
                let mut events = ctx.relay.subscribe();
                debug!(user = %ctx.user.id, "Relay notification loop started");
                while let Some(event) = events.recv().await {
                    handle_relay_event(&ctx, &sink, &focused, &roster, event).await;
                }
                debug!(user = %ctx.user.id, "Relay notification loop ended");
            })
        };
        let push = {
            let ctx = self.ctx.clone();
            let sink = self.sink.clone();
            let focused = self.focused.clone();
            tokio::spawn(async move {
                let mut incoming = ctx.push.incoming(ctx.user.id);
                while let Some(message) = incoming.recv().await {
                    if message.sender == ctx.user.id {
                        continue;
                    }
                    if current_focus(&focused) == Some(message.conversation) {
                        continue;
                    }
                    sink.show(Notification {
                        title: message.title,
                        body: message.body,
                        tag: message.conversation,
                        require_interaction: true,
                    });
                }
            })
        };
        if let Ok(mut loops) = self.loops.lock() {
            loops.push(TaskGuard::new(relay));
            loops.push(TaskGuard::new(push));
        }
    }

    /// Abort both loops.
    pub fn stop(&self) {
        if let Ok(mut loops) = self.loops.lock() {
            loops.clear();
        }
    }

    /// Mark a conversation as on screen; its notifications are suppressed.
    pub fn set_focused(&self, conversation: Option<ConversationId>) {
        if let Ok(mut focused) = self.focused.lock() {
            *focused = conversation;
        }
    }

    pub fn focused(&self) -> Option<ConversationId> {
        current_focus(&self.focused)
    }

    /// Roster from the last `users:active` broadcast.
    pub fn active_users(&self) -> Vec<UserSummary> {
        self.roster.lock().map(|roster| roster.clone()).unwrap_or_default()
    }

    /// Notification activation: focus the existing window on the
    /// conversation, or open a new one.
    pub fn activate(&self, conversation: ConversationId) {
        if !self.windows.focus(conversation) {
            self.windows.open(conversation);
        }
    }
}

fn current_focus(focused: &Mutex<Option<ConversationId>>) -> Option<ConversationId> {
    focused.lock().ok().and_then(|focused| *focused)
}

async fn handle_relay_event(
    ctx: &SessionContext,
    sink: &Arc<dyn NotificationSink>,
    focused: &Arc<Mutex<Option<ConversationId>>>,
    roster: &Arc<Mutex<Vec<UserSummary>>>,
    event: RelayEvent,
) {
    let me = ctx.user.id;
    match event {
        RelayEvent::Join(user) => {
            debug!(user = %user.id, "Peer joined the relay");
        }
        RelayEvent::ActiveUsers(users) => {
            if let Ok(mut roster) = roster.lock() {
                *roster = users;
            }
        }
        RelayEvent::NewMessage(event) => {
            if event.sender == me {
                return;
            }
            if current_focus(focused) == Some(event.conversation) {
                debug!(
                    conversation = %event.conversation,
                    "Notification suppressed for focused conversation"
                );
                return;
            }
            sink.show(Notification {
                title: format!("New message from {}", event.sender_name),
                body: event.text,
                tag: event.conversation,
                require_interaction: false,
            });
        }
        RelayEvent::ChatAction(event) => {
            if event.user == me {
                return;
            }
            apply_chat_action(&*ctx.store, &event).await;
        }
        // Typing indicators are derived from store snapshots, not the relay.
        RelayEvent::Typing(_) => {}
    }
}

/// Fold a peer's chat action into the local store. Every mapped operation is
/// idempotent, and none of them bumps an unread counter, so replays and
/// echoes are harmless.
async fn apply_chat_action(store: &dyn ConversationStore, event: &ChatActionEvent) {
    let op = match event.action {
        ChatActionKind::Archive => ConversationOp::Archive(event.user),
        ChatActionKind::Unarchive => ConversationOp::Unarchive(event.user),
        ChatActionKind::Delete => ConversationOp::MarkDeleted(event.user),
        ChatActionKind::MarkRead => ConversationOp::ResetUnread(event.user),
    };
    let mut batch = WriteBatch::new();
    batch.conversation(event.conversation, op);
    if let Err(error) = store.commit(batch).await {
        // Unknown conversation or a store hiccup; the snapshot stream will
        // reconcile whatever state we missed.
        debug!(conversation = %event.conversation, %error, "Chat action ingest skipped");
    }
}
