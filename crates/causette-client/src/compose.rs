//! Compound conversation and message mutations for the signed-in user.

use std::collections::BTreeSet;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use causette_shared::protocol::{ChatActionEvent, ChatActionKind, NewMessageEvent};
use causette_shared::{
    Conversation, ConversationId, DeletionInfo, GroupSettings, Message, MessageId, RelayEvent,
    Sender, UserId,
};
use causette_store::{
    ConversationOp, ConversationStore, MessageOp, NewConversation, NewMessage, StoreError,
    WriteBatch,
};

use crate::error::{EngineError, Result};
use crate::session::SessionContext;

/// Performs the user-intent state transitions: sending, deleting, reacting,
/// archiving, and group management.
///
/// Store writes that carry user intent propagate their errors to the caller;
/// the relay mirror of each action is best-effort and only logged.
#[derive(Clone)]
pub struct Composer {
    ctx: SessionContext,
}

impl Composer {
    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }

    fn me(&self) -> UserId {
        self.ctx.user.id
    }

    async fn require_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.ctx
            .store
            .get_conversation(id)
            .await?
            .ok_or(EngineError::ConversationNotFound(id))
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Send a message: one atomic batch inserts the document and updates the
    /// conversation's denormalized summary, unread counters, and archive
    /// state, so no reader ever sees the message without its side effects.
    pub async fn send_message(
        &self,
        conversation: ConversationId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::EmptyMessage);
        }
        let conv = self.require_conversation(conversation).await?;

        let message_id = MessageId::new();
        let mut batch = WriteBatch::new();
        batch.insert_message(
            conversation,
            NewMessage {
                id: message_id,
                text: text.to_string(),
                sender: Sender {
                    id: self.me(),
                    display_name: self.ctx.user.display_name.clone(),
                },
                reply_to,
            },
        );
        batch.conversation(
            conversation,
            ConversationOp::SetLastMessage {
                text: text.to_string(),
                sender: self.me(),
            },
        );
        batch.conversation(conversation, ConversationOp::TouchLastMessageTime);
        if !conv.archived_by.is_empty() {
            // A new message resurfaces the thread for everyone who archived it.
            batch.conversation(conversation, ConversationOp::ClearArchived);
        }
        for participant in conv.participants.iter().copied() {
            if participant != self.me() {
                batch.conversation(conversation, ConversationOp::BumpUnread(participant));
            }
        }
        self.ctx.store.commit(batch).await?;
        info!(conversation = %conversation, message = %message_id, "Message sent");

        let event = RelayEvent::NewMessage(NewMessageEvent {
            conversation,
            sender: self.me(),
            sender_name: self.ctx.user.display_name.clone(),
            text: text.to_string(),
        });
        if let Err(error) = self.ctx.relay.publish(event).await {
            warn!(conversation = %conversation, %error, "Message announcement failed");
        }
        Ok(message_id)
    }

    /// Soft-delete a message: the text becomes a fixed placeholder and the
    /// original content moves into the audit record. Deleting an already
    /// deleted message is a no-op.
    pub async fn delete_message(
        &self,
        conversation: ConversationId,
        message: MessageId,
    ) -> Result<()> {
        let current = self
            .ctx
            .store
            .get_message(conversation, message)
            .await?
            .ok_or(EngineError::MessageNotFound(message))?;
        if current.deleted {
            debug!(message = %message, "Message already deleted");
            return Ok(());
        }

        let info = DeletionInfo {
            deleted_at: Utc::now(),
            deleted_by: self.me(),
            original_content: current.text,
        };
        let mut batch = WriteBatch::new();
        batch.message(conversation, message, MessageOp::Delete(info));
        self.ctx.store.commit(batch).await?;
        info!(conversation = %conversation, message = %message, "Message deleted");
        Ok(())
    }

    pub async fn add_reaction(
        &self,
        conversation: ConversationId,
        message: MessageId,
        emoji: &str,
    ) -> Result<()> {
        self.react(conversation, message, emoji, true).await
    }

    /// Removing a reaction the user never added is a no-op.
    pub async fn remove_reaction(
        &self,
        conversation: ConversationId,
        message: MessageId,
        emoji: &str,
    ) -> Result<()> {
        self.react(conversation, message, emoji, false).await
    }

    async fn react(
        &self,
        conversation: ConversationId,
        message: MessageId,
        emoji: &str,
        add: bool,
    ) -> Result<()> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(EngineError::InvalidParameter("emoji"));
        }
        let op = if add {
            MessageOp::AddReaction {
                emoji: emoji.to_string(),
                user: self.me(),
            }
        } else {
            MessageOp::RemoveReaction {
                emoji: emoji.to_string(),
                user: self.me(),
            }
        };
        let mut batch = WriteBatch::new();
        batch.message(conversation, message, op);
        match self.ctx.store.commit(batch).await {
            Err(StoreError::NotFound) => Err(EngineError::MessageNotFound(message)),
            other => Ok(other?),
        }
    }

    /// Stamp a read receipt on every message in the conversation the user has
    /// not read yet, their own included. Each receipt commits independently;
    /// a failed one is logged and the rest proceed, so a retry converges.
    /// Returns the number of receipts written.
    pub async fn mark_as_read(&self, conversation: ConversationId) -> Result<usize> {
        let messages = self.ctx.store.list_messages(conversation).await?;
        Ok(mark_read_from(&*self.ctx.store, conversation, self.me(), &messages).await)
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    /// Create a conversation, or return the existing one that matches.
    ///
    /// A 1:1 conversation matches on the counterpart alone; a group matches
    /// on the exact participant set and name. A match the user had
    /// soft-deleted is restored and resurfaced instead of duplicated.
    pub async fn create_or_reuse_conversation(
        &self,
        others: &[UserId],
        group_name: Option<&str>,
    ) -> Result<Conversation> {
        if others.is_empty() {
            return Err(EngineError::InvalidParameter("participants"));
        }
        if others.contains(&self.me()) {
            return Err(EngineError::InvalidParameter("participants include self"));
        }
        let others: Vec<UserId> = {
            let mut seen = BTreeSet::new();
            others.iter().copied().filter(|user| seen.insert(*user)).collect()
        };
        let is_group = others.len() > 1 || group_name.is_some();

        let mine = self.ctx.store.list_conversations(self.me()).await?;
        let found = if is_group {
            let wanted: BTreeSet<UserId> = others.iter().copied().chain([self.me()]).collect();
            mine.into_iter().find(|conv| {
                let members: BTreeSet<UserId> = conv.participants.iter().copied().collect();
                conv.is_group && members == wanted && conv.group_name.as_deref() == group_name
            })
        } else {
            let target = others[0];
            mine.into_iter()
                .find(|conv| conv.participants.len() == 2 && conv.participants.contains(&target))
        };

        if let Some(conv) = found {
            if conv.deleted_by.contains(&self.me()) {
                let mut batch = WriteBatch::new();
                batch.conversation(conv.id, ConversationOp::Restore(self.me()));
                batch.conversation(conv.id, ConversationOp::TouchLastMessageTime);
                self.ctx.store.commit(batch).await?;
                info!(conversation = %conv.id, "Conversation restored");
                return self.require_conversation(conv.id).await;
            }
            debug!(conversation = %conv.id, "Existing conversation reused");
            return Ok(conv);
        }

        let participants: Vec<UserId> =
            std::iter::once(self.me()).chain(others.iter().copied()).collect();
        let conv = self
            .ctx
            .store
            .create_conversation(NewConversation {
                participants,
                is_group,
                group_name: group_name.map(str::to_string),
                group_settings: is_group.then(GroupSettings::default),
            })
            .await?;
        info!(conversation = %conv.id, group = is_group, "Conversation created");
        Ok(conv)
    }

    /// Clear the unread counter without announcing it; used while the
    /// conversation is on screen.
    pub async fn reset_unread(&self, conversation: ConversationId) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.conversation(conversation, ConversationOp::ResetUnread(self.me()));
        self.ctx.store.commit(batch).await?;
        Ok(())
    }

    /// Menu action: clear the unread counter and mirror it over the relay.
    pub async fn mark_conversation_read(&self, conversation: ConversationId) -> Result<()> {
        self.reset_unread(conversation).await?;
        self.mirror_action(conversation, ChatActionKind::MarkRead).await;
        Ok(())
    }

    /// Flip the archive flag for the current user; returns the new state.
    pub async fn toggle_archive(&self, conversation: ConversationId) -> Result<bool> {
        let conv = self.require_conversation(conversation).await?;
        let archived = conv.archived_for(self.me());
        let (op, action) = if archived {
            (ConversationOp::Unarchive(self.me()), ChatActionKind::Unarchive)
        } else {
            (ConversationOp::Archive(self.me()), ChatActionKind::Archive)
        };
        let mut batch = WriteBatch::new();
        batch.conversation(conversation, op);
        self.ctx.store.commit(batch).await?;
        self.mirror_action(conversation, action).await;
        info!(conversation = %conversation, archived = !archived, "Archive toggled");
        Ok(!archived)
    }

    /// Hide the conversation for the current user. The document and its
    /// messages survive for the other participants.
    pub async fn soft_delete_conversation(&self, conversation: ConversationId) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.conversation(conversation, ConversationOp::MarkDeleted(self.me()));
        match self.ctx.store.commit(batch).await {
            Err(StoreError::NotFound) => {
                return Err(EngineError::ConversationNotFound(conversation))
            }
            other => other?,
        }
        self.mirror_action(conversation, ChatActionKind::Delete).await;
        info!(conversation = %conversation, "Conversation hidden");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Group management
    // -----------------------------------------------------------------------

    /// Add members to a group, carrying their cached profile slice when the
    /// directory knows them. Users already present are skipped.
    pub async fn add_members(
        &self,
        conversation: ConversationId,
        users: &[UserId],
    ) -> Result<()> {
        if users.is_empty() {
            return Err(EngineError::InvalidParameter("users"));
        }
        let conv = self.require_conversation(conversation).await?;
        let settings = group_settings(&conv)?;
        if !settings.can_add_members {
            return Err(EngineError::NotPermitted);
        }

        let mut batch = WriteBatch::new();
        let mut added = 0;
        for user in users.iter().copied() {
            if conv.participants.contains(&user) {
                continue;
            }
            let details = self
                .ctx
                .store
                .get_profile(user)
                .await?
                .map(|profile| profile.participant_summary());
            batch.conversation(conversation, ConversationOp::AddParticipant { user, details });
            added += 1;
        }
        if added == 0 {
            return Ok(());
        }
        self.ctx.store.commit(batch).await?;
        info!(conversation = %conversation, added, "Group members added");
        Ok(())
    }

    /// Leave a group, dropping the user's per-member entries with them.
    pub async fn leave_group(&self, conversation: ConversationId) -> Result<()> {
        let conv = self.require_conversation(conversation).await?;
        let settings = group_settings(&conv)?;
        if !settings.can_leave_group {
            return Err(EngineError::NotPermitted);
        }
        if !conv.participants.contains(&self.me()) {
            return Ok(());
        }

        let mut batch = WriteBatch::new();
        batch.conversation(conversation, ConversationOp::RemoveParticipant(self.me()));
        self.ctx.store.commit(batch).await?;
        info!(conversation = %conversation, "Left group");
        Ok(())
    }

    pub async fn rename_group(&self, conversation: ConversationId, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidParameter("name"));
        }
        let conv = self.require_conversation(conversation).await?;
        let settings = group_settings(&conv)?;
        if !settings.can_change_group_name {
            return Err(EngineError::NotPermitted);
        }

        let mut batch = WriteBatch::new();
        batch.conversation(conversation, ConversationOp::SetGroupName(name.to_string()));
        self.ctx.store.commit(batch).await?;
        info!(conversation = %conversation, "Group renamed");
        Ok(())
    }

    async fn mirror_action(&self, conversation: ConversationId, action: ChatActionKind) {
        let event = RelayEvent::ChatAction(ChatActionEvent {
            conversation,
            action,
            user: self.me(),
        });
        if let Err(error) = self.ctx.relay.publish(event).await {
            debug!(conversation = %conversation, %error, "Chat action mirror failed");
        }
    }
}

/// Write read receipts for `reader` against an already-fetched message slice.
/// Used both by the explicit mark-as-read operation and by the message stream
/// on snapshot delivery.
pub(crate) async fn mark_read_from(
    store: &dyn ConversationStore,
    conversation: ConversationId,
    reader: UserId,
    messages: &[Message],
) -> usize {
    let pending: Vec<MessageId> = messages
        .iter()
        .filter(|message| !message.read_by_user(reader))
        .map(|message| message.id)
        .collect();
    if pending.is_empty() {
        return 0;
    }

    let commits = pending.iter().map(|id| {
        let mut batch = WriteBatch::new();
        batch.message(conversation, *id, MessageOp::MarkRead(reader));
        store.commit(batch)
    });
    let mut updated = 0;
    for (id, result) in pending.iter().zip(join_all(commits).await) {
        match result {
            Ok(()) => updated += 1,
            Err(error) => warn!(message = %id, %error, "Read receipt write failed"),
        }
    }
    if updated > 0 {
        debug!(conversation = %conversation, updated, "Read receipts stamped");
    }
    updated
}

fn group_settings(conv: &Conversation) -> Result<GroupSettings> {
    if !conv.is_group {
        return Err(EngineError::InvalidParameter("not a group conversation"));
    }
    // Groups created before settings existed get the permissive defaults.
    Ok(conv.group_settings.clone().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use causette_net::{MemoryPresence, MemoryPushGateway, MemoryRelay, Relay};
    use causette_shared::constants::DELETED_MESSAGE_PLACEHOLDER;
    use causette_shared::{MessageStatus, UserProfile, UserSummary};
    use causette_store::MemoryStore;

    use crate::config::ClientConfig;

    struct Harness {
        store: Arc<MemoryStore>,
        relay: Arc<MemoryRelay>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                relay: Arc::new(MemoryRelay::new()),
            }
        }

        fn composer(&self, user: &UserSummary) -> Composer {
            Composer::new(SessionContext {
                user: user.clone(),
                store: self.store.clone(),
                relay: self.relay.clone(),
                presence: Arc::new(MemoryPresence::new()),
                push: Arc::new(MemoryPushGateway::new()),
                config: ClientConfig::default(),
            })
        }

        async fn conversation(&self, id: ConversationId) -> Conversation {
            self.store.get_conversation(id).await.unwrap().unwrap()
        }

        async fn messages(&self, id: ConversationId) -> Vec<Message> {
            self.store.list_messages(id).await.unwrap()
        }
    }

    fn user(name: &str) -> UserSummary {
        UserSummary {
            id: UserId::new(),
            display_name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            photo_url: None,
        }
    }

    #[tokio::test]
    async fn test_send_rejects_whitespace_only_text() {
        let harness = Harness::new();
        let composer = harness.composer(&user("Ada"));
        let result = composer.send_message(ConversationId::new(), "   \n", None).await;
        assert!(matches!(result, Err(EngineError::EmptyMessage)));
    }

    #[tokio::test]
    async fn test_send_to_missing_conversation_fails() {
        let harness = Harness::new();
        let composer = harness.composer(&user("Ada"));
        let result = composer.send_message(ConversationId::new(), "hello", None).await;
        assert!(matches!(result, Err(EngineError::ConversationNotFound(_))));
    }

    #[tokio::test]
    async fn test_send_updates_summary_and_unread_counters() {
        let harness = Harness::new();
        let ada = user("Ada");
        let grace = user("Grace");
        let composer = harness.composer(&ada);
        let conv = composer
            .create_or_reuse_conversation(&[grace.id], None)
            .await
            .unwrap();

        composer.send_message(conv.id, "  hello  ", None).await.unwrap();

        let messages = harness.messages(conv.id).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "hello", "text is trimmed");
        assert_eq!(messages[0].sender.id, ada.id);

        let updated = harness.conversation(conv.id).await;
        let last = updated.last_message.as_ref().expect("last message summary");
        assert_eq!(last.text, "hello");
        assert_eq!(last.sender, ada.id);
        assert_eq!(updated.unread_for(grace.id), 1);
        assert_eq!(updated.unread_for(ada.id), 0, "sender is never bumped");
        assert!(updated.last_message_time >= updated.created_at);
    }

    #[tokio::test]
    async fn test_send_resurfaces_archived_thread() {
        let harness = Harness::new();
        let ada = user("Ada");
        let grace = user("Grace");
        let ada_composer = harness.composer(&ada);
        let grace_composer = harness.composer(&grace);

        let conv = ada_composer
            .create_or_reuse_conversation(&[grace.id], None)
            .await
            .unwrap();
        assert!(grace_composer.toggle_archive(conv.id).await.unwrap());

        ada_composer.send_message(conv.id, "ping", None).await.unwrap();
        let updated = harness.conversation(conv.id).await;
        assert!(updated.archived_by.is_empty());
    }

    #[tokio::test]
    async fn test_send_announces_over_the_relay() {
        let harness = Harness::new();
        let ada = user("Ada");
        let composer = harness.composer(&ada);
        let conv = composer
            .create_or_reuse_conversation(&[UserId::new()], None)
            .await
            .unwrap();

        let mut events = harness.relay.subscribe();
        composer.send_message(conv.id, "hello", None).await.unwrap();

        match events.recv().await {
            Some(RelayEvent::NewMessage(event)) => {
                assert_eq!(event.conversation, conv.id);
                assert_eq!(event.sender, ada.id);
                assert_eq!(event.sender_name, "Ada");
                assert_eq!(event.text, "hello");
            }
            other => panic!("Relay event mismatch: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reaction_requires_emoji() {
        let harness = Harness::new();
        let composer = harness.composer(&user("Ada"));
        let result = composer
            .add_reaction(ConversationId::new(), MessageId::new(), "  ")
            .await;
        assert!(matches!(result, Err(EngineError::InvalidParameter("emoji"))));
    }

    #[tokio::test]
    async fn test_reactions_round_trip_across_users() {
        let harness = Harness::new();
        let ada = user("Ada");
        let grace = user("Grace");
        let ada_composer = harness.composer(&ada);
        let grace_composer = harness.composer(&grace);

        let conv = ada_composer
            .create_or_reuse_conversation(&[grace.id], None)
            .await
            .unwrap();
        let message = ada_composer.send_message(conv.id, "hello", None).await.unwrap();

        ada_composer.add_reaction(conv.id, message, "🎉").await.unwrap();
        grace_composer.add_reaction(conv.id, message, "🎉").await.unwrap();

        let stored = &harness.messages(conv.id).await[0];
        assert_eq!(stored.reactions["🎉"].len(), 2);

        ada_composer.remove_reaction(conv.id, message, "🎉").await.unwrap();
        let stored = &harness.messages(conv.id).await[0];
        assert!(stored.reactions["🎉"].contains(&grace.id));

        grace_composer.remove_reaction(conv.id, message, "🎉").await.unwrap();
        // Removing a reaction that was never added stays a no-op.
        grace_composer.remove_reaction(conv.id, message, "🎉").await.unwrap();
        let stored = &harness.messages(conv.id).await[0];
        assert!(stored.reactions.is_empty(), "empty emoji keys are dropped");
    }

    #[tokio::test]
    async fn test_delete_message_is_idempotent_and_keeps_audit() {
        let harness = Harness::new();
        let ada = user("Ada");
        let composer = harness.composer(&ada);
        let conv = composer
            .create_or_reuse_conversation(&[UserId::new()], None)
            .await
            .unwrap();
        let message = composer.send_message(conv.id, "secret", None).await.unwrap();

        composer.delete_message(conv.id, message).await.unwrap();
        let first = harness.messages(conv.id).await[0].clone();
        assert!(first.deleted);
        assert_eq!(first.text, DELETED_MESSAGE_PLACEHOLDER);
        let info = first.deletion_info.clone().expect("audit record");
        assert_eq!(info.original_content, "secret");
        assert_eq!(info.deleted_by, ada.id);

        composer.delete_message(conv.id, message).await.unwrap();
        let second = harness.messages(conv.id).await[0].clone();
        assert_eq!(second.deletion_info, first.deletion_info);
    }

    #[tokio::test]
    async fn test_conversation_participants_validated() {
        let harness = Harness::new();
        let ada = user("Ada");
        let me = ada.id;
        let composer = harness.composer(&ada);

        let empty = composer.create_or_reuse_conversation(&[], None).await;
        assert!(matches!(empty, Err(EngineError::InvalidParameter(_))));

        let with_self = composer.create_or_reuse_conversation(&[me], None).await;
        assert!(matches!(with_self, Err(EngineError::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn test_one_to_one_reuse_matches_from_both_sides() {
        let harness = Harness::new();
        let ada = user("Ada");
        let grace = user("Grace");
        let ada_composer = harness.composer(&ada);
        let grace_composer = harness.composer(&grace);

        let first = ada_composer
            .create_or_reuse_conversation(&[grace.id], None)
            .await
            .unwrap();
        let again = ada_composer
            .create_or_reuse_conversation(&[grace.id], None)
            .await
            .unwrap();
        let from_grace = grace_composer
            .create_or_reuse_conversation(&[ada.id], None)
            .await
            .unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(first.id, from_grace.id);
    }

    #[tokio::test]
    async fn test_reuse_restores_soft_deleted_conversation() {
        let harness = Harness::new();
        let ada = user("Ada");
        let grace = user("Grace");
        let composer = harness.composer(&ada);

        let conv = composer
            .create_or_reuse_conversation(&[grace.id], None)
            .await
            .unwrap();
        composer.soft_delete_conversation(conv.id).await.unwrap();
        let hidden = harness.conversation(conv.id).await;
        assert!(hidden.deleted_by.contains(&ada.id));

        let restored = composer
            .create_or_reuse_conversation(&[grace.id], None)
            .await
            .unwrap();
        assert_eq!(restored.id, conv.id);
        assert!(restored.deleted_by.is_empty());
        assert!(restored.last_message_time >= hidden.last_message_time);
    }

    #[tokio::test]
    async fn test_group_reuse_requires_exact_set_and_name() {
        let harness = Harness::new();
        let ada = user("Ada");
        let composer = harness.composer(&ada);
        let b = UserId::new();
        let c = UserId::new();

        let ops = composer
            .create_or_reuse_conversation(&[b, c], Some("Ops"))
            .await
            .unwrap();
        let same = composer
            .create_or_reuse_conversation(&[c, b], Some("Ops"))
            .await
            .unwrap();
        assert_eq!(ops.id, same.id, "member order is irrelevant");

        let renamed = composer
            .create_or_reuse_conversation(&[b, c], Some("Oncall"))
            .await
            .unwrap();
        assert_ne!(ops.id, renamed.id, "a different name is a different group");

        let smaller = composer
            .create_or_reuse_conversation(&[b], Some("Ops"))
            .await
            .unwrap();
        assert_ne!(ops.id, smaller.id, "a different set is a different group");
    }

    #[tokio::test]
    async fn test_single_counterpart_with_name_creates_named_group() {
        let harness = Harness::new();
        let composer = harness.composer(&user("Ada"));
        let conv = composer
            .create_or_reuse_conversation(&[UserId::new()], Some("Pair"))
            .await
            .unwrap();
        assert!(conv.is_group);
        assert_eq!(conv.group_name.as_deref(), Some("Pair"));
        assert!(conv.group_settings.is_some());
    }

    #[tokio::test]
    async fn test_mark_as_read_stamps_only_missing_receipts() {
        let harness = Harness::new();
        let ada = user("Ada");
        let grace = user("Grace");
        let ada_composer = harness.composer(&ada);
        let grace_composer = harness.composer(&grace);

        let conv = ada_composer
            .create_or_reuse_conversation(&[grace.id], None)
            .await
            .unwrap();
        ada_composer.send_message(conv.id, "one", None).await.unwrap();
        ada_composer.send_message(conv.id, "two", None).await.unwrap();

        assert_eq!(grace_composer.mark_as_read(conv.id).await.unwrap(), 2);
        assert_eq!(grace_composer.mark_as_read(conv.id).await.unwrap(), 0);

        for message in harness.messages(conv.id).await {
            assert!(message.read_by_user(grace.id));
            assert_eq!(message.status, MessageStatus::Read);
        }
    }

    #[tokio::test]
    async fn test_mark_conversation_read_mirrors_the_action() {
        let harness = Harness::new();
        let ada = user("Ada");
        let grace = user("Grace");
        let ada_composer = harness.composer(&ada);
        let grace_composer = harness.composer(&grace);

        let conv = ada_composer
            .create_or_reuse_conversation(&[grace.id], None)
            .await
            .unwrap();
        ada_composer.send_message(conv.id, "hello", None).await.unwrap();

        let mut events = harness.relay.subscribe();
        grace_composer.mark_conversation_read(conv.id).await.unwrap();

        assert_eq!(harness.conversation(conv.id).await.unread_for(grace.id), 0);
        match events.recv().await {
            Some(RelayEvent::ChatAction(event)) => {
                assert_eq!(event.conversation, conv.id);
                assert_eq!(event.action, ChatActionKind::MarkRead);
                assert_eq!(event.user, grace.id);
            }
            other => panic!("Relay event mismatch: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_archive_toggle_round_trip() {
        let harness = Harness::new();
        let ada = user("Ada");
        let composer = harness.composer(&ada);
        let conv = composer
            .create_or_reuse_conversation(&[UserId::new()], None)
            .await
            .unwrap();

        assert!(composer.toggle_archive(conv.id).await.unwrap());
        assert!(harness.conversation(conv.id).await.archived_for(ada.id));
        assert!(!composer.toggle_archive(conv.id).await.unwrap());
        assert!(!harness.conversation(conv.id).await.archived_for(ada.id));
    }

    #[tokio::test]
    async fn test_group_settings_gate_management_operations() {
        let harness = Harness::new();
        let ada = user("Ada");
        let composer = harness.composer(&ada);
        let b = UserId::new();
        let c = UserId::new();

        let conv = harness
            .store
            .create_conversation(NewConversation {
                participants: vec![ada.id, b, c],
                is_group: true,
                group_name: Some("Locked".to_string()),
                group_settings: Some(GroupSettings {
                    can_add_members: false,
                    can_change_group_name: true,
                    can_leave_group: false,
                }),
            })
            .await
            .unwrap();

        let add = composer.add_members(conv.id, &[UserId::new()]).await;
        assert!(matches!(add, Err(EngineError::NotPermitted)));
        let leave = composer.leave_group(conv.id).await;
        assert!(matches!(leave, Err(EngineError::NotPermitted)));

        composer.rename_group(conv.id, "Unlocked").await.unwrap();
        let renamed = harness.conversation(conv.id).await;
        assert_eq!(renamed.group_name.as_deref(), Some("Unlocked"));
    }

    #[tokio::test]
    async fn test_group_management_rejected_for_one_to_one() {
        let harness = Harness::new();
        let composer = harness.composer(&user("Ada"));
        let conv = composer
            .create_or_reuse_conversation(&[UserId::new()], None)
            .await
            .unwrap();

        let result = composer.rename_group(conv.id, "Nope").await;
        assert!(matches!(result, Err(EngineError::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn test_add_members_carries_known_profiles() {
        let harness = Harness::new();
        let ada = user("Ada");
        let composer = harness.composer(&ada);
        let b = UserId::new();
        let conv = composer
            .create_or_reuse_conversation(&[b], Some("Ops"))
            .await
            .unwrap();

        let known = user("Grace");
        harness
            .store
            .upsert_profile(UserProfile {
                id: known.id,
                display_name: known.display_name.clone(),
                email: known.email.clone(),
                photo_url: None,
                online: true,
                last_seen: None,
            })
            .await
            .unwrap();
        let unknown = UserId::new();

        composer.add_members(conv.id, &[known.id, unknown, b]).await.unwrap();

        let updated = harness.conversation(conv.id).await;
        assert_eq!(updated.participants.len(), 4, "existing members are skipped");
        assert_eq!(
            updated.participant_details.get(&known.id).map(|d| d.display_name.as_str()),
            Some("Grace")
        );
        assert!(!updated.participant_details.contains_key(&unknown));
    }

    #[tokio::test]
    async fn test_leave_group_drops_member() {
        let harness = Harness::new();
        let ada = user("Ada");
        let grace = user("Grace");
        let ada_composer = harness.composer(&ada);
        let grace_composer = harness.composer(&grace);

        let conv = ada_composer
            .create_or_reuse_conversation(&[grace.id, UserId::new()], Some("Ops"))
            .await
            .unwrap();
        grace_composer.leave_group(conv.id).await.unwrap();

        let updated = harness.conversation(conv.id).await;
        assert!(!updated.participants.contains(&grace.id));
        // Leaving again is a quiet no-op.
        grace_composer.leave_group(conv.id).await.unwrap();
    }
}
