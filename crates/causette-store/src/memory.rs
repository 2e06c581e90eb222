//! In-memory reference implementation of [`ConversationStore`].
//!
//! State lives behind one mutex; commits validate every op before mutating so
//! a bad batch fails without partial effects. Watchers are fed by tasks that
//! listen on a broadcast of change notices and re-snapshot the affected
//! slice. A notice is only broadcast when a commit actually changed state,
//! so idempotent re-writes (unread resets, repeated read receipts) cannot
//! feed a snapshot loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use causette_shared::constants::{BROADCAST_BUFFER, DELETED_MESSAGE_PLACEHOLDER, SUBSCRIPTION_BUFFER};
use causette_shared::{
    Conversation, ConversationId, LastMessage, Message, MessageId, MessageStatus, Subscription,
    TaskGuard, UserId, UserProfile,
};

use crate::error::{Result, StoreError};
use crate::ops::{ConversationOp, MessageOp, NewConversation, NewMessage, WriteBatch, WriteOp};
use crate::store::ConversationStore;

/// Which slice of state a commit touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Conversations,
    Messages(ConversationId),
    Profiles,
}

struct Stored {
    /// Insertion sequence, breaks timestamp ties.
    seq: u64,
    message: Message,
}

#[derive(Default)]
struct State {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Stored>>,
    profiles: HashMap<UserId, UserProfile>,
    seq: u64,
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    changes: broadcast::Sender<Change>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(BROADCAST_BUFFER);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            changes,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Batch application
// ---------------------------------------------------------------------------

/// Check the op's target exists so a later apply pass cannot fail mid-batch.
fn validate(state: &State, op: &WriteOp) -> Result<()> {
    match op {
        WriteOp::InsertMessage { conversation, .. } => {
            if !state.conversations.contains_key(conversation) {
                return Err(StoreError::NotFound);
            }
        }
        WriteOp::Conversation { id, .. } => {
            if !state.conversations.contains_key(id) {
                return Err(StoreError::NotFound);
            }
        }
        WriteOp::Message {
            conversation, id, ..
        } => {
            let present = state
                .messages
                .get(conversation)
                .map(|msgs| msgs.iter().any(|s| s.message.id == *id))
                .unwrap_or(false);
            if !present {
                return Err(StoreError::NotFound);
            }
        }
    }
    Ok(())
}

/// Apply one op. Returns the touched slice iff state actually changed.
fn apply(state: &mut State, op: WriteOp, now: DateTime<Utc>) -> Option<Change> {
    match op {
        WriteOp::InsertMessage {
            conversation,
            message,
        } => {
            state.seq += 1;
            let seq = state.seq;
            let msgs = state.messages.entry(conversation).or_default();
            if msgs.iter().any(|s| s.message.id == message.id) {
                debug!(message = %message.id, "Duplicate message id, insert ignored");
                return None;
            }
            let NewMessage {
                id,
                text,
                sender,
                reply_to,
            } = message;
            msgs.push(Stored {
                seq,
                message: Message {
                    id,
                    text,
                    sender,
                    timestamp: now,
                    reply_to,
                    reactions: BTreeMap::new(),
                    read_by: BTreeMap::new(),
                    status: MessageStatus::Sent,
                    deleted: false,
                    deletion_info: None,
                },
            });
            Some(Change::Messages(conversation))
        }

        WriteOp::Conversation { id, op } => {
            let conv = state.conversations.get_mut(&id)?;
            apply_conversation(conv, op, now).then_some(Change::Conversations)
        }

        WriteOp::Message {
            conversation,
            id,
            op,
        } => {
            let stored = state
                .messages
                .get_mut(&conversation)?
                .iter_mut()
                .find(|s| s.message.id == id)?;
            apply_message(&mut stored.message, op, now).then_some(Change::Messages(conversation))
        }
    }
}

fn apply_conversation(conv: &mut Conversation, op: ConversationOp, now: DateTime<Utc>) -> bool {
    match op {
        ConversationOp::SetLastMessage { text, sender } => {
            conv.last_message = Some(LastMessage {
                text,
                sender,
                timestamp: now,
            });
            true
        }
        ConversationOp::TouchLastMessageTime => {
            conv.last_message_time = now;
            true
        }
        ConversationOp::ClearArchived => {
            let had_any = !conv.archived_by.is_empty();
            conv.archived_by.clear();
            had_any
        }
        ConversationOp::Archive(user) => conv.archived_by.insert(user),
        ConversationOp::Unarchive(user) => conv.archived_by.remove(&user),
        ConversationOp::MarkDeleted(user) => conv.deleted_by.insert(user),
        ConversationOp::Restore(user) => conv.deleted_by.remove(&user),
        ConversationOp::BumpUnread(user) => {
            *conv.unread.entry(user).or_insert(0) += 1;
            true
        }
        ConversationOp::ResetUnread(user) => match conv.unread.get_mut(&user) {
            Some(count) if *count != 0 => {
                *count = 0;
                true
            }
            _ => false,
        },
        ConversationOp::TypingRefresh(user) => {
            conv.typing.insert(user, Some(now));
            true
        }
        ConversationOp::TypingClear(user) => {
            let prior = conv.typing.insert(user, None);
            prior != Some(None)
        }
        ConversationOp::PutParticipantDetails { user, details } => {
            if !conv.participants.contains(&user) {
                return false;
            }
            if conv.participant_details.get(&user) == Some(&details) {
                return false;
            }
            conv.participant_details.insert(user, details);
            true
        }
        ConversationOp::AddParticipant { user, details } => {
            if conv.participants.contains(&user) {
                return false;
            }
            conv.participants.push(user);
            if let Some(details) = details {
                conv.participant_details.insert(user, details);
            }
            true
        }
        ConversationOp::RemoveParticipant(user) => {
            let was_member = conv.participants.contains(&user);
            conv.participants.retain(|p| *p != user);
            conv.participant_details.remove(&user);
            conv.unread.remove(&user);
            conv.typing.remove(&user);
            conv.archived_by.remove(&user);
            conv.deleted_by.remove(&user);
            was_member
        }
        ConversationOp::SetGroupName(name) => {
            if conv.group_name.as_deref() == Some(name.as_str()) {
                return false;
            }
            conv.group_name = Some(name);
            true
        }
    }
}

fn apply_message(message: &mut Message, op: MessageOp, now: DateTime<Utc>) -> bool {
    match op {
        MessageOp::MarkRead(user) => {
            if message.read_by.contains_key(&user) {
                return false;
            }
            message.read_by.insert(user, now);
            message.status = MessageStatus::Read;
            true
        }
        MessageOp::AddReaction { emoji, user } => {
            message.reactions.entry(emoji).or_default().insert(user)
        }
        MessageOp::RemoveReaction { emoji, user } => {
            let (removed, now_empty) = match message.reactions.get_mut(&emoji) {
                Some(users) => (users.remove(&user), users.is_empty()),
                None => (false, false),
            };
            if removed && now_empty {
                message.reactions.remove(&emoji);
            }
            removed
        }
        MessageOp::Delete(info) => {
            if message.deleted {
                return false;
            }
            message.deleted = true;
            message.text = DELETED_MESSAGE_PLACEHOLDER.to_string();
            message.deletion_info = Some(info);
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

fn conversations_snapshot(
    state: &Mutex<State>,
    participant: UserId,
) -> Result<Vec<Conversation>> {
    let state = state.lock().map_err(|_| StoreError::LockPoisoned)?;
    let mut list: Vec<Conversation> = state
        .conversations
        .values()
        .filter(|conv| conv.participants.contains(&participant))
        .cloned()
        .collect();
    list.sort_by(|a, b| {
        b.last_message_time
            .cmp(&a.last_message_time)
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(list)
}

fn conversation_snapshot(
    state: &Mutex<State>,
    id: ConversationId,
) -> Result<Option<Conversation>> {
    let state = state.lock().map_err(|_| StoreError::LockPoisoned)?;
    Ok(state.conversations.get(&id).cloned())
}

fn messages_snapshot(state: &Mutex<State>, conversation: ConversationId) -> Result<Vec<Message>> {
    let state = state.lock().map_err(|_| StoreError::LockPoisoned)?;
    let mut stored: Vec<(u64, Message)> = state
        .messages
        .get(&conversation)
        .map(|msgs| {
            msgs.iter()
                .map(|s| (s.seq, s.message.clone()))
                .collect()
        })
        .unwrap_or_default();
    stored.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp).then_with(|| a.0.cmp(&b.0)));
    Ok(stored.into_iter().map(|(_, message)| message).collect())
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation> {
        if new.participants.is_empty() {
            return Err(StoreError::InvalidWrite(
                "a conversation needs at least one participant".to_string(),
            ));
        }
        let unique: std::collections::BTreeSet<_> = new.participants.iter().collect();
        if unique.len() != new.participants.len() {
            return Err(StoreError::InvalidWrite(
                "duplicate participants".to_string(),
            ));
        }
        if !new.is_group && new.participants.len() != 2 {
            return Err(StoreError::InvalidWrite(
                "a direct conversation needs exactly two participants".to_string(),
            ));
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: ConversationId::new(),
            participants: new.participants,
            participant_details: BTreeMap::new(),
            is_group: new.is_group,
            group_name: new.group_name,
            last_message: None,
            last_message_time: now,
            unread: BTreeMap::new(),
            archived_by: Default::default(),
            deleted_by: Default::default(),
            typing: BTreeMap::new(),
            group_settings: new.group_settings,
            created_at: now,
        };

        {
            let mut state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
            state
                .conversations
                .insert(conversation.id, conversation.clone());
        }
        let _ = self.changes.send(Change::Conversations);

        debug!(conversation = %conversation.id, group = conversation.is_group, "Conversation created");
        Ok(conversation)
    }

    async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        conversation_snapshot(&self.state, id)
    }

    async fn list_conversations(&self, participant: UserId) -> Result<Vec<Conversation>> {
        conversations_snapshot(&self.state, participant)
    }

    async fn list_messages(&self, conversation: ConversationId) -> Result<Vec<Message>> {
        messages_snapshot(&self.state, conversation)
    }

    async fn get_message(
        &self,
        conversation: ConversationId,
        id: MessageId,
    ) -> Result<Option<Message>> {
        let state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state
            .messages
            .get(&conversation)
            .and_then(|msgs| msgs.iter().find(|s| s.message.id == id))
            .map(|s| s.message.clone()))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let changes = {
            let mut state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
            for op in batch.ops() {
                validate(&state, op)?;
            }
            let now = Utc::now();
            let mut changes: Vec<Change> = Vec::new();
            for op in batch.into_ops() {
                if let Some(change) = apply(&mut state, op, now) {
                    if !changes.contains(&change) {
                        changes.push(change);
                    }
                }
            }
            changes
        };
        for change in changes {
            let _ = self.changes.send(change);
        }
        Ok(())
    }

    async fn upsert_profile(&self, profile: UserProfile) -> Result<()> {
        let changed = {
            let mut state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
            let changed = state.profiles.get(&profile.id) != Some(&profile);
            if changed {
                state.profiles.insert(profile.id, profile);
            }
            changed
        };
        if changed {
            let _ = self.changes.send(Change::Profiles);
        }
        Ok(())
    }

    async fn get_profile(&self, id: UserId) -> Result<Option<UserProfile>> {
        let state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state.profiles.get(&id).cloned())
    }

    async fn list_profiles(&self) -> Result<Vec<UserProfile>> {
        let state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut profiles: Vec<UserProfile> = state.profiles.values().cloned().collect();
        profiles.sort_by(|a, b| a.display_name.cmp(&b.display_name).then_with(|| a.id.cmp(&b.id)));
        Ok(profiles)
    }

    fn watch_conversations(
        &self,
        participant: UserId,
    ) -> Subscription<Result<Vec<Conversation>>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let state = Arc::clone(&self.state);
        let mut changes = self.changes.subscribe();

        let handle = tokio::spawn(async move {
            if tx.send(conversations_snapshot(&state, participant)).await.is_err() {
                return;
            }
            loop {
                let relevant = match changes.recv().await {
                    Ok(Change::Conversations) => true,
                    Ok(_) => false,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Conversation watcher lagged, resyncing");
                        true
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if relevant
                    && tx.send(conversations_snapshot(&state, participant)).await.is_err()
                {
                    break;
                }
            }
        });

        Subscription::new(rx, TaskGuard::new(handle))
    }

    fn watch_conversation(
        &self,
        id: ConversationId,
    ) -> Subscription<Result<Option<Conversation>>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let state = Arc::clone(&self.state);
        let mut changes = self.changes.subscribe();

        let handle = tokio::spawn(async move {
            if tx.send(conversation_snapshot(&state, id)).await.is_err() {
                return;
            }
            loop {
                let relevant = match changes.recv().await {
                    Ok(Change::Conversations) => true,
                    Ok(_) => false,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Conversation watcher lagged, resyncing");
                        true
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if relevant && tx.send(conversation_snapshot(&state, id)).await.is_err() {
                    break;
                }
            }
        });

        Subscription::new(rx, TaskGuard::new(handle))
    }

    fn watch_messages(
        &self,
        conversation: ConversationId,
    ) -> Subscription<Result<Vec<Message>>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let state = Arc::clone(&self.state);
        let mut changes = self.changes.subscribe();

        let handle = tokio::spawn(async move {
            if tx.send(messages_snapshot(&state, conversation)).await.is_err() {
                return;
            }
            loop {
                let relevant = match changes.recv().await {
                    Ok(Change::Messages(changed)) => changed == conversation,
                    Ok(_) => false,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Message watcher lagged, resyncing");
                        true
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if relevant && tx.send(messages_snapshot(&state, conversation)).await.is_err() {
                    break;
                }
            }
        });

        Subscription::new(rx, TaskGuard::new(handle))
    }
}
