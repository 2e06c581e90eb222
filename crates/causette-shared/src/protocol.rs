//! Events exchanged over the notification relay.
//!
//! Frames are JSON: `{"event": <name>, "data": <payload>}`, matching the
//! channel layout used by hosted pub/sub relays so a real transport can be
//! substituted for the in-memory broker without touching the engine.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::model::UserSummary;
use crate::types::{ConversationId, UserId};

/// All notification events carried by the relay channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum RelayEvent {
    /// An identity announced itself after connecting.
    #[serde(rename = "user:join")]
    Join(UserSummary),

    /// A message was committed to a conversation.
    #[serde(rename = "new-message")]
    NewMessage(NewMessageEvent),

    /// A conversation-management action (archive, delete, mark read).
    #[serde(rename = "chat_action")]
    ChatAction(ChatActionEvent),

    /// Low-latency typing transition, alongside the store write.
    #[serde(rename = "typing")]
    Typing(TypingEvent),

    /// Roster of currently-connected identities, sent on membership change.
    #[serde(rename = "users:active")]
    ActiveUsers(Vec<UserSummary>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessageEvent {
    pub conversation: ConversationId,
    pub sender: UserId,
    pub sender_name: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatActionEvent {
    pub conversation: ConversationId,
    pub action: ChatActionKind,
    pub user: UserId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatActionKind {
    Archive,
    Unarchive,
    Delete,
    MarkRead,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingEvent {
    pub conversation: ConversationId,
    pub user: UserId,
    pub is_typing: bool,
}

impl RelayEvent {
    /// Serialize to a JSON frame.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Deserialize from a JSON frame.
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// The wire name of this event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::Join(_) => "user:join",
            RelayEvent::NewMessage(_) => "new-message",
            RelayEvent::ChatAction(_) => "chat_action",
            RelayEvent::Typing(_) => "typing",
            RelayEvent::ActiveUsers(_) => "users:active",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_event_roundtrip() {
        let event = RelayEvent::NewMessage(NewMessageEvent {
            conversation: ConversationId::new(),
            sender: UserId::new(),
            sender_name: "Ada".to_string(),
            text: "bonjour".to_string(),
        });

        let bytes = event.to_bytes().unwrap();
        let restored = RelayEvent::from_bytes(&bytes).unwrap();

        if let (RelayEvent::NewMessage(orig), RelayEvent::NewMessage(rest)) = (&event, &restored) {
            assert_eq!(orig.conversation, rest.conversation);
            assert_eq!(orig.sender, rest.sender);
            assert_eq!(orig.text, rest.text);
        } else {
            panic!("Event type mismatch");
        }
    }

    #[test]
    fn test_chat_action_wire_names() {
        let event = RelayEvent::ChatAction(ChatActionEvent {
            conversation: ConversationId::new(),
            action: ChatActionKind::MarkRead,
            user: UserId::new(),
        });

        let json: serde_json::Value = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(json["event"], "chat_action");
        assert_eq!(json["data"]["action"], "mark_read");
        assert_eq!(event.name(), "chat_action");
    }
}
