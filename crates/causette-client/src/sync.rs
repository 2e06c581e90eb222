//! Conversation synchronization: realtime snapshots reconciled into view
//! state.
//!
//! The synchronizer never mutates state a snapshot already reflects; it
//! derives.  The two exceptions are the viewing side effects (unread reset
//! and read receipts), which are written fire-and-forget as snapshots arrive
//! and converge because the store suppresses no-op rebroadcasts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use causette_shared::constants::SUBSCRIPTION_BUFFER;
use causette_shared::{
    Conversation, ConversationId, GroupSettings, LastMessage, Message, ParticipantSummary,
    Subscription, TaskGuard, UserId,
};
use causette_store::{ConversationOp, WriteBatch};

use crate::compose::mark_read_from;
use crate::session::SessionContext;

// ---------------------------------------------------------------------------
// View state
// ---------------------------------------------------------------------------

/// One conversation row in the list view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub is_group: bool,
    pub group_name: Option<String>,
    /// The other side of a 1:1 conversation, with their cached details.
    /// `None` until the counterpart's presence has filled the cache in;
    /// render a placeholder until then.
    pub counterpart: Option<(UserId, ParticipantSummary)>,
    pub member_count: usize,
    pub last_message: Option<LastMessage>,
    pub last_message_time: DateTime<Utc>,
    pub unread_count: u32,
    pub archived: bool,
}

/// Full snapshot for the conversation list. A subscription error degrades
/// the list to empty with the flag set; the stream itself keeps going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationList {
    pub conversations: Vec<ConversationSummary>,
    pub error: bool,
}

/// Snapshot state of the open conversation document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetailState {
    Ready(ConversationView),
    /// The document does not exist (or was deleted upstream); distinguishable
    /// from a failure so the caller can close the view instead of retrying.
    NotFound,
    Failed,
}

/// Derived view of the open conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationView {
    pub conversation: Conversation,
    pub counterpart: Option<(UserId, ParticipantSummary)>,
    /// Every participant with their cached details, the viewer included.
    pub members: Vec<(UserId, Option<ParticipantSummary>)>,
    /// Someone other than the viewer typed within the freshness window,
    /// as of this snapshot.
    pub typing: bool,
    pub archived: bool,
    pub unread_count: u32,
    pub group_settings: Option<GroupSettings>,
}

/// Snapshot state of the open conversation's message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageState {
    Ready(Vec<Message>),
    Failed,
}

/// The stream pair for an opened conversation.
pub struct OpenConversation {
    pub detail: Subscription<DetailState>,
    pub messages: Subscription<MessageState>,
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ActiveStreams {
    /// List feeders; several list subscribers may be live at once.
    feeders: Vec<AbortHandle>,
    detail: Option<AbortHandle>,
    messages: Option<AbortHandle>,
    open: Option<ConversationId>,
}

/// Owns the snapshot streams for the signed-in user.
///
/// At most one conversation is open at a time: opening another aborts the
/// previous detail and message feeders before starting new ones, so their
/// viewing side effects can never race against the wrong conversation.
pub struct ConversationSynchronizer {
    ctx: SessionContext,
    active: Arc<Mutex<ActiveStreams>>,
}

impl ConversationSynchronizer {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            active: Arc::new(Mutex::new(ActiveStreams::default())),
        }
    }

    /// Stream of list snapshots: visible conversations only (soft-deleted
    /// ones are filtered out), newest activity first.
    pub fn conversation_list(&self) -> Subscription<ConversationList> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let me = self.ctx.user.id;
        let mut source = self.ctx.store.watch_conversations(me);
        let handle = tokio::spawn(async move {
            while let Some(item) = source.recv().await {
                let list = match item {
                    Ok(conversations) => ConversationList {
                        conversations: conversations
                            .iter()
                            .filter(|conv| conv.visible_to(me))
                            .map(|conv| derive_summary(conv, me))
                            .collect(),
                        error: false,
                    },
                    Err(error) => {
                        warn!(%error, "Conversation list stream degraded");
                        ConversationList {
                            conversations: Vec::new(),
                            error: true,
                        }
                    }
                };
                if tx.send(list).await.is_err() {
                    break;
                }
            }
        });
        let abort = handle.abort_handle();
        if let Ok(mut active) = self.active.lock() {
            active.feeders.retain(|feeder| !feeder.is_finished());
            active.feeders.push(abort);
        }
        Subscription::new(rx, TaskGuard::new(handle))
    }

    /// Open a conversation, replacing whichever one was open before.
    pub fn open_conversation(&self, id: ConversationId) -> OpenConversation {
        self.close_streams();
        let detail = self.spawn_detail(id);
        let messages = self.spawn_messages(id);
        if let Ok(mut active) = self.active.lock() {
            active.open = Some(id);
        }
        debug!(conversation = %id, "Conversation opened");
        OpenConversation { detail, messages }
    }

    pub fn close_conversation(&self) {
        self.close_streams();
        if let Ok(mut active) = self.active.lock() {
            active.open = None;
        }
    }

    /// The currently open conversation, if any.
    pub fn open(&self) -> Option<ConversationId> {
        self.active.lock().ok().and_then(|active| active.open)
    }

    /// Abort every live stream.
    pub fn shutdown(&self) {
        if let Ok(mut active) = self.active.lock() {
            for feeder in active.feeders.drain(..) {
                feeder.abort();
            }
            if let Some(detail) = active.detail.take() {
                detail.abort();
            }
            if let Some(messages) = active.messages.take() {
                messages.abort();
            }
            active.open = None;
        }
    }

    fn close_streams(&self) {
        if let Ok(mut active) = self.active.lock() {
            if let Some(detail) = active.detail.take() {
                detail.abort();
            }
            if let Some(messages) = active.messages.take() {
                messages.abort();
            }
        }
    }

    fn spawn_detail(&self, id: ConversationId) -> Subscription<DetailState> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let ctx = self.ctx.clone();
        let mut source = self.ctx.store.watch_conversation(id);
        let handle = tokio::spawn(async move {
            let me = ctx.user.id;
            while let Some(item) = source.recv().await {
                let state = match item {
                    Ok(Some(conv)) => {
                        // Viewing counts as reading: clear the counter when
                        // the snapshot shows a backlog. The store swallows
                        // the rebroadcast when nothing changed, so this
                        // cannot loop.
                        if conv.unread_for(me) > 0 {
                            let mut batch = WriteBatch::new();
                            batch.conversation(id, ConversationOp::ResetUnread(me));
                            if let Err(error) = ctx.store.commit(batch).await {
                                warn!(conversation = %id, %error, "Unread reset failed");
                            }
                        }
                        DetailState::Ready(derive_view(&conv, me, ctx.config.typing_window))
                    }
                    Ok(None) => DetailState::NotFound,
                    Err(error) => {
                        warn!(conversation = %id, %error, "Conversation stream degraded");
                        DetailState::Failed
                    }
                };
                if tx.send(state).await.is_err() {
                    break;
                }
            }
        });
        let abort = handle.abort_handle();
        if let Ok(mut active) = self.active.lock() {
            active.detail = Some(abort);
        }
        Subscription::new(rx, TaskGuard::new(handle))
    }

    fn spawn_messages(&self, id: ConversationId) -> Subscription<MessageState> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let ctx = self.ctx.clone();
        let mut source = self.ctx.store.watch_messages(id);
        let handle = tokio::spawn(async move {
            let me = ctx.user.id;
            while let Some(item) = source.recv().await {
                let state = match item {
                    Ok(messages) => {
                        // Receipt stamping rides on snapshot delivery; the
                        // receipts show up in the next snapshot.
                        mark_read_from(&*ctx.store, id, me, &messages).await;
                        MessageState::Ready(messages)
                    }
                    Err(error) => {
                        warn!(conversation = %id, %error, "Message stream degraded");
                        MessageState::Failed
                    }
                };
                if tx.send(state).await.is_err() {
                    break;
                }
            }
        });
        let abort = handle.abort_handle();
        if let Ok(mut active) = self.active.lock() {
            active.messages = Some(abort);
        }
        Subscription::new(rx, TaskGuard::new(handle))
    }
}

impl Drop for ConversationSynchronizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

fn derive_summary(conv: &Conversation, viewer: UserId) -> ConversationSummary {
    ConversationSummary {
        id: conv.id,
        is_group: conv.is_group,
        group_name: conv.group_name.clone(),
        counterpart: derive_counterpart(conv, viewer),
        member_count: conv.participants.len(),
        last_message: conv.last_message.clone(),
        last_message_time: conv.last_message_time,
        unread_count: conv.unread_for(viewer),
        archived: conv.archived_for(viewer),
    }
}

fn derive_counterpart(
    conv: &Conversation,
    viewer: UserId,
) -> Option<(UserId, ParticipantSummary)> {
    let other = conv.counterpart_of(viewer)?;
    let details = conv.participant_details.get(&other)?.clone();
    Some((other, details))
}

fn derive_view(conv: &Conversation, viewer: UserId, window: Duration) -> ConversationView {
    ConversationView {
        counterpart: derive_counterpart(conv, viewer),
        members: conv
            .participants
            .iter()
            .map(|member| (*member, conv.participant_details.get(member).cloned()))
            .collect(),
        typing: conv.typing_active(viewer, Utc::now(), window),
        archived: conv.archived_for(viewer),
        unread_count: conv.unread_for(viewer),
        group_settings: conv.group_settings.clone(),
        conversation: conv.clone(),
    }
}


#[cfg(test)]
mod stream_tests {
    use super::*;

    use causette_net::{MemoryPresence, MemoryPushGateway, MemoryRelay};
    use causette_shared::UserSummary;
    use causette_store::{ConversationStore, MemoryStore};

    use crate::compose::Composer;
    use crate::config::ClientConfig;

    fn user(name: &str) -> UserSummary {
        UserSummary {
            id: UserId::new(),
            display_name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            photo_url: None,
        }
    }

    fn ctx_on(store: &Arc<MemoryStore>, user: &UserSummary) -> SessionContext {
        SessionContext {
            user: user.clone(),
            store: store.clone(),
            relay: Arc::new(MemoryRelay::new()),
            presence: Arc::new(MemoryPresence::new()),
            push: Arc::new(MemoryPushGateway::new()),
            config: ClientConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_open_conversation_clears_unread_and_stamps_receipts() {
        let store = Arc::new(MemoryStore::new());
        let ada = user("Ada");
        let grace = user("Grace");
        let composer = Composer::new(ctx_on(&store, &ada));
        let conv = composer
            .create_or_reuse_conversation(&[grace.id], None)
            .await
            .unwrap();
        composer.send_message(conv.id, "one", None).await.unwrap();
        composer.send_message(conv.id, "two", None).await.unwrap();

        let sync = ConversationSynchronizer::new(ctx_on(&store, &grace));
        let mut opened = sync.open_conversation(conv.id);

        // The stream converges on a view with the backlog cleared.
        let mut cleared = false;
        for _ in 0..10 {
            match opened.detail.recv().await {
                Some(DetailState::Ready(view)) if view.unread_count == 0 => {
                    cleared = true;
                    break;
                }
                Some(DetailState::Ready(_)) => continue,
                other => panic!("Detail state mismatch: {:?}", other),
            }
        }
        assert!(cleared, "unread backlog never cleared");

        let mut receipts = false;
        for _ in 0..10 {
            match opened.messages.recv().await {
                Some(MessageState::Ready(messages))
                    if messages.len() == 2
                        && messages.iter().all(|m| m.read_by_user(grace.id)) =>
                {
                    receipts = true;
                    break;
                }
                Some(MessageState::Ready(_)) => continue,
                other => panic!("Message state mismatch: {:?}", other),
            }
        }
        assert!(receipts, "read receipts never landed");

        let stored = store.get_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.unread_for(grace.id), 0);
        assert_eq!(stored.unread_for(ada.id), 0, "the sender's counter stays untouched");
    }

    #[tokio::test]
    async fn test_opening_another_conversation_ends_the_first_stream() {
        let store = Arc::new(MemoryStore::new());
        let ada = user("Ada");
        let composer = Composer::new(ctx_on(&store, &ada));
        let first = composer
            .create_or_reuse_conversation(&[UserId::new()], None)
            .await
            .unwrap();
        let second = composer
            .create_or_reuse_conversation(&[UserId::new()], None)
            .await
            .unwrap();

        let sync = ConversationSynchronizer::new(ctx_on(&store, &ada));
        let mut opened_first = sync.open_conversation(first.id);
        assert!(opened_first.messages.recv().await.is_some());

        let _opened_second = sync.open_conversation(second.id);
        assert_eq!(sync.open(), Some(second.id));

        // The aborted feeder drops its sender; the old stream drains to None.
        let drained = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while opened_first.messages.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "first stream never ended");
    }

    #[tokio::test]
    async fn test_detail_reports_missing_conversation() {
        let store = Arc::new(MemoryStore::new());
        let ada = user("Ada");
        let sync = ConversationSynchronizer::new(ctx_on(&store, &ada));

        let mut opened = sync.open_conversation(ConversationId::new());
        assert_eq!(opened.detail.recv().await, Some(DetailState::NotFound));
    }

    #[tokio::test]
    async fn test_list_hides_soft_deleted_and_flags_archived() {
        let store = Arc::new(MemoryStore::new());
        let ada = user("Ada");
        let composer = Composer::new(ctx_on(&store, &ada));
        let kept = composer
            .create_or_reuse_conversation(&[UserId::new()], None)
            .await
            .unwrap();
        let dropped = composer
            .create_or_reuse_conversation(&[UserId::new()], None)
            .await
            .unwrap();

        composer.soft_delete_conversation(dropped.id).await.unwrap();
        composer.toggle_archive(kept.id).await.unwrap();

        let sync = ConversationSynchronizer::new(ctx_on(&store, &ada));
        let mut list = sync.conversation_list();
        let snapshot = list.recv().await.expect("initial snapshot");

        assert!(!snapshot.error);
        assert_eq!(snapshot.conversations.len(), 1);
        assert_eq!(snapshot.conversations[0].id, kept.id);
        assert!(snapshot.conversations[0].archived);
    }

    #[tokio::test]
    async fn test_close_conversation_clears_open_marker() {
        let store = Arc::new(MemoryStore::new());
        let ada = user("Ada");
        let composer = Composer::new(ctx_on(&store, &ada));
        let conv = composer
            .create_or_reuse_conversation(&[UserId::new()], None)
            .await
            .unwrap();

        let sync = ConversationSynchronizer::new(ctx_on(&store, &ada));
        let _opened = sync.open_conversation(conv.id);
        assert_eq!(sync.open(), Some(conv.id));

        sync.close_conversation();
        assert_eq!(sync.open(), None);
    }
}
