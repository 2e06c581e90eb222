//! The document-store collaborator interface.

use async_trait::async_trait;

use causette_shared::{
    Conversation, ConversationId, Message, MessageId, Subscription, UserId, UserProfile,
};

use crate::error::Result;
use crate::ops::{NewConversation, WriteBatch};

/// Narrow interface to the conversation document store.
///
/// The `watch_*` methods return realtime snapshot streams: a full snapshot on
/// subscribe, then a fresh one on every underlying change. Stream items carry
/// errors in-band so a subscription failure degrades the consumer instead of
/// tearing it down; dropping the [`Subscription`] unsubscribes.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation>;

    async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>>;

    /// Every conversation the user participates in, including ones they
    /// soft-deleted (the reuse scan needs those), newest first.
    async fn list_conversations(&self, participant: UserId) -> Result<Vec<Conversation>>;

    /// Messages ascending by timestamp, insertion order breaking ties.
    async fn list_messages(&self, conversation: ConversationId) -> Result<Vec<Message>>;

    async fn get_message(
        &self,
        conversation: ConversationId,
        id: MessageId,
    ) -> Result<Option<Message>>;

    /// Apply a batch atomically under one server timestamp. Either every op
    /// lands or none do; partial application is never observable.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    async fn upsert_profile(&self, profile: UserProfile) -> Result<()>;

    async fn get_profile(&self, id: UserId) -> Result<Option<UserProfile>>;

    async fn list_profiles(&self) -> Result<Vec<UserProfile>>;

    /// Conversations the user participates in, sorted by `last_message_time`
    /// descending, re-emitted in full on every change.
    fn watch_conversations(
        &self,
        participant: UserId,
    ) -> Subscription<Result<Vec<Conversation>>>;

    /// One conversation document. `Ok(None)` is the distinguishable state for
    /// a document that does not exist or was deleted upstream.
    fn watch_conversation(
        &self,
        id: ConversationId,
    ) -> Subscription<Result<Option<Conversation>>>;

    /// The conversation's ordered message list, re-emitted on every change.
    fn watch_messages(&self, conversation: ConversationId)
        -> Subscription<Result<Vec<Message>>>;
}
