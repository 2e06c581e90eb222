//! Typed write operations batched into atomic commits.
//!
//! A [`WriteBatch`] is applied all-or-nothing under a single server
//! timestamp: every timestamp-bearing effect in one commit (message insert,
//! last-message-time touch, typing refresh) observes the same `now`.

use causette_shared::{
    ConversationId, DeletionInfo, GroupSettings, MessageId, ParticipantSummary, Sender, UserId,
};

/// Payload for a message insert. The store assigns the timestamp and the
/// initial empty reaction/read maps when the batch commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub id: MessageId,
    pub text: String,
    pub sender: Sender,
    pub reply_to: Option<MessageId>,
}

/// Payload for creating a conversation document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub participants: Vec<UserId>,
    pub is_group: bool,
    pub group_name: Option<String>,
    pub group_settings: Option<GroupSettings>,
}

/// Field-level update on a conversation document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationOp {
    /// Replace the denormalized last-message summary (timestamp = commit now).
    SetLastMessage { text: String, sender: UserId },
    /// Refresh the list sort key to the commit timestamp.
    TouchLastMessageTime,
    /// Drop every archive marker. Sending a message un-archives for everyone.
    ClearArchived,
    Archive(UserId),
    Unarchive(UserId),
    /// Hide the conversation for this user (soft delete).
    MarkDeleted(UserId),
    /// Undo a soft delete for this user.
    Restore(UserId),
    /// Increment the unread counter, defaulting a missing entry to 0 first.
    BumpUnread(UserId),
    ResetUnread(UserId),
    /// Stamp the typing entry with the commit timestamp.
    TypingRefresh(UserId),
    /// Write an explicit `None` typing entry.
    TypingClear(UserId),
    /// Refresh the cached profile slice for a current participant.
    PutParticipantDetails {
        user: UserId,
        details: ParticipantSummary,
    },
    AddParticipant {
        user: UserId,
        details: Option<ParticipantSummary>,
    },
    /// Drop the participant together with their details, unread, typing and
    /// archive/delete markers.
    RemoveParticipant(UserId),
    SetGroupName(String),
}

/// Field-level update on a message document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOp {
    /// Record a read receipt if absent, and flip the status to read.
    /// A present receipt is left untouched.
    MarkRead(UserId),
    AddReaction { emoji: String, user: UserId },
    RemoveReaction { emoji: String, user: UserId },
    /// Soft delete: replace the text with the fixed placeholder and attach
    /// the audit record. A second delete is a no-op.
    Delete(DeletionInfo),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    InsertMessage {
        conversation: ConversationId,
        message: NewMessage,
    },
    Conversation {
        id: ConversationId,
        op: ConversationOp,
    },
    Message {
        conversation: ConversationId,
        id: MessageId,
        op: MessageOp,
    },
}

/// An ordered list of operations committed atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_message(&mut self, conversation: ConversationId, message: NewMessage) -> &mut Self {
        self.ops.push(WriteOp::InsertMessage {
            conversation,
            message,
        });
        self
    }

    pub fn conversation(&mut self, id: ConversationId, op: ConversationOp) -> &mut Self {
        self.ops.push(WriteOp::Conversation { id, op });
        self
    }

    pub fn message(&mut self, conversation: ConversationId, id: MessageId, op: MessageOp) -> &mut Self {
        self.ops.push(WriteOp::Message {
            conversation,
            id,
            op,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}
