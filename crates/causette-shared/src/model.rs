//! Domain documents synchronized through the conversation store.
//!
//! Every struct derives `Serialize` and `Deserialize` so snapshots can be
//! handed directly to a UI layer.  Map and set fields use the `BTree`
//! collections so serialized documents and test assertions are deterministic.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MessageId, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A known user profile as stored in the user directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    /// Human-readable display name shown next to messages.
    pub display_name: String,
    pub email: String,
    /// Optional avatar URL.
    pub photo_url: Option<String>,
    /// Mirrored from the presence store so the directory can be listed
    /// without a presence lookup per user.
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl UserProfile {
    /// The wire-facing slice of this profile.
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            display_name: self.display_name.clone(),
            email: self.email.clone(),
            photo_url: self.photo_url.clone(),
        }
    }

    /// Cacheable participant slice of this profile.
    pub fn participant_summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            display_name: self.display_name.clone(),
            email: self.email.clone(),
            photo_url: self.photo_url.clone(),
            online: self.online,
            last_seen: self.last_seen,
        }
    }
}

/// The identity slice that travels over the relay and into sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSummary {
    pub id: UserId,
    pub display_name: String,
    pub email: String,
    pub photo_url: Option<String>,
}

impl UserSummary {
    /// Cacheable participant slice with the given presence state.
    pub fn participant_summary(
        &self,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) -> ParticipantSummary {
        ParticipantSummary {
            display_name: self.display_name.clone(),
            email: self.email.clone(),
            photo_url: self.photo_url.clone(),
            online,
            last_seen,
        }
    }
}

/// Per-conversation cached copy of a participant's profile.
///
/// Kept inside the conversation document so list rendering needs no join;
/// refreshed by the presence tracker when the participant connects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantSummary {
    pub display_name: String,
    pub email: String,
    pub photo_url: Option<String>,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Denormalized copy of the newest message, kept on the conversation so the
/// list view never has to read the message collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastMessage {
    pub text: String,
    pub sender: UserId,
    pub timestamp: DateTime<Utc>,
}

/// Group permissions. Absent on 1:1 conversations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupSettings {
    pub can_add_members: bool,
    pub can_change_group_name: bool,
    pub can_leave_group: bool,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            can_add_members: true,
            can_change_group_name: true,
            can_leave_group: true,
        }
    }
}

/// A 1:1 or group conversation document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    /// Non-empty, unique. Exactly two entries for a 1:1 conversation.
    pub participants: Vec<UserId>,
    /// Cached profile slices, keyed by participant. May lag behind
    /// `participants`: a missing entry means the profile is not known yet.
    pub participant_details: BTreeMap<UserId, ParticipantSummary>,
    pub is_group: bool,
    pub group_name: Option<String>,
    pub last_message: Option<LastMessage>,
    /// Sort key for the conversation list, newest first.
    pub last_message_time: DateTime<Utc>,
    /// Per-participant unread counters. Keys are a subset of `participants`.
    pub unread: BTreeMap<UserId, u32>,
    /// Users who archived this conversation. Cleared for everyone when a new
    /// message arrives.
    pub archived_by: BTreeSet<UserId>,
    /// Users who soft-deleted this conversation; it stays hidden for them
    /// until it is restored.
    pub deleted_by: BTreeSet<UserId>,
    /// Last-keystroke stamp per participant, `None` after an explicit clear.
    pub typing: BTreeMap<UserId, Option<DateTime<Utc>>>,
    pub group_settings: Option<GroupSettings>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// A conversation is visible to a user iff they participate and have not
    /// soft-deleted it.
    pub fn visible_to(&self, user: UserId) -> bool {
        self.participants.contains(&user) && !self.deleted_by.contains(&user)
    }

    pub fn archived_for(&self, user: UserId) -> bool {
        self.archived_by.contains(&user)
    }

    /// The other participant of a 1:1 conversation.
    pub fn counterpart_of(&self, user: UserId) -> Option<UserId> {
        if self.participants.len() != 2 {
            return None;
        }
        self.participants.iter().copied().find(|p| *p != user)
    }

    pub fn unread_for(&self, user: UserId) -> u32 {
        self.unread.get(&user).copied().unwrap_or(0)
    }

    /// Whether anyone other than `viewer` typed within the freshness window.
    ///
    /// Pure over the snapshot: a stamp older than the window counts as "not
    /// typing" even if no explicit clear was ever written.
    pub fn typing_active(&self, viewer: UserId, now: DateTime<Utc>, window: Duration) -> bool {
        let limit = window.as_millis() as i64;
        self.typing.iter().any(|(user, stamp)| {
            *user != viewer
                && stamp
                    .map(|ts| now.signed_duration_since(ts).num_milliseconds() < limit)
                    .unwrap_or(false)
        })
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Sender slice embedded in each message so rendering needs no profile join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sender {
    pub id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Read,
}

/// Audit record attached to a soft-deleted message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletionInfo {
    pub deleted_at: DateTime<Utc>,
    pub deleted_by: UserId,
    /// Text as it was before the placeholder replaced it.
    pub original_content: String,
}

/// A single chat message. Messages are never hard-deleted: a delete replaces
/// the text with a placeholder and records [`DeletionInfo`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub sender: Sender,
    /// Assigned by the store when the insert commits.
    pub timestamp: DateTime<Utc>,
    pub reply_to: Option<MessageId>,
    /// emoji -> identities who reacted with it. Sets never hold duplicates;
    /// an emoji key disappears when its set empties.
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    pub read_by: BTreeMap<UserId, DateTime<Utc>>,
    pub status: MessageStatus,
    pub deleted: bool,
    pub deletion_info: Option<DeletionInfo>,
}

impl Message {
    pub fn read_by_user(&self, user: UserId) -> bool {
        self.read_by.contains_key(&user)
    }

    pub fn reacted_with(&self, user: UserId, emoji: &str) -> bool {
        self.reactions
            .get(emoji)
            .map(|users| users.contains(&user))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// Presence record kept by the realtime presence store, keyed by user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceRecord {
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl PresenceRecord {
    pub fn online(now: DateTime<Utc>) -> Self {
        Self {
            online: true,
            last_seen: Some(now),
        }
    }

    pub fn offline(now: DateTime<Utc>) -> Self {
        Self {
            online: false,
            last_seen: Some(now),
        }
    }
}

impl Default for PresenceRecord {
    fn default() -> Self {
        Self {
            online: false,
            last_seen: None,
        }
    }
}
