//! Domain types shared by the core.

use chrono::{DateTime, Utc};
use courier_protocol::{ClientMessage, MessageEnvelope, MessageId, MessageStatus};
use serde::{Deserialize, Serialize};

/// Stable username supplied by the identity verifier.
pub type Identity = String;

/// Opaque chat-room identifier.
pub type ChatId = String;

/// Generate a chat id: 32 lowercase hex characters.
#[must_use]
pub fn generate_chat_id() -> ChatId {
    uuid::Uuid::new_v4().simple().to_string()
}

/// The two members of a chat. Immutable once the chat exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMembers {
    pub chat_id: ChatId,
    pub user1: Identity,
    pub user2: Identity,
}

impl ChatMembers {
    /// Whether `identity` is one of the two members.
    #[must_use]
    pub fn contains(&self, identity: &str) -> bool {
        self.user1 == identity || self.user2 == identity
    }

    /// The other member, if `identity` is a member.
    #[must_use]
    pub fn peer_of(&self, identity: &str) -> Option<&str> {
        if self.user1 == identity {
            Some(self.user2.as_str())
        } else if self.user2 == identity {
            Some(self.user1.as_str())
        } else {
            None
        }
    }
}

/// A message about to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub sender: Identity,
    pub body: String,
    pub file_url: Option<String>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    /// Build a message submitted by `sender`. The client timestamp is kept
    /// when present so retries of the same submission compare equal.
    #[must_use]
    pub fn from_client(chat_id: &str, sender: &str, incoming: ClientMessage) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            sender: sender.to_string(),
            body: incoming.message,
            file_url: incoming.file_url,
            status: MessageStatus::Sent,
            created_at: incoming.created_at.unwrap_or_else(Utc::now),
        }
    }

    /// Whether `message` is the same submission as this one.
    #[must_use]
    pub fn is_duplicate_of(&self, message: &Message) -> bool {
        self.chat_id == message.chat_id
            && self.sender == message.sender
            && self.body == message.body
            && self.created_at == message.created_at
    }
}

/// A durable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender: Identity,
    pub body: String,
    pub file_url: Option<String>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Assign a durable id to a new message.
    #[must_use]
    pub fn from_new(id: MessageId, new: NewMessage) -> Self {
        Self {
            id,
            chat_id: new.chat_id,
            sender: new.sender,
            body: new.body,
            file_url: new.file_url,
            status: new.status,
            created_at: new.created_at,
        }
    }

    /// The enriched wire form pushed to both parties.
    #[must_use]
    pub fn envelope(&self, profile_picture: &str, receiver: &str) -> MessageEnvelope {
        MessageEnvelope {
            id: self.id,
            chat_id: self.chat_id.clone(),
            message: self.body.clone(),
            username: self.sender.clone(),
            file_url: self.file_url.clone(),
            status: self.status,
            profile_picture: profile_picture.to_string(),
            receiver: receiver.to_string(),
            created_at: self.created_at,
        }
    }
}

/// Latest message of a chat, for previews.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessage {
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// One row of a member's inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    /// The other member.
    pub user: Identity,
    /// Messages the owner has not read yet.
    pub unread_count: u64,
    pub last_message: String,
    pub last_message_time: Option<DateTime<Utc>>,
    /// The other member's picture.
    pub profile_picture: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_of() {
        let chat = ChatMembers {
            chat_id: "R123".into(),
            user1: "alice".into(),
            user2: "bob".into(),
        };
        assert_eq!(chat.peer_of("alice"), Some("bob"));
        assert_eq!(chat.peer_of("bob"), Some("alice"));
        assert_eq!(chat.peer_of("mallory"), None);
        assert!(!chat.contains("mallory"));
    }

    #[test]
    fn test_generated_chat_id() {
        let id = generate_chat_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_chat_id());
    }

    #[test]
    fn test_duplicate_detection() {
        let at = Utc::now();
        let new =
            NewMessage::from_client("R1", "alice", ClientMessage::text("hi").with_timestamp(at));
        let stored = Message::from_new(9, new.clone());
        assert!(new.is_duplicate_of(&stored));

        let later = at + chrono::Duration::seconds(1);
        let retry_later =
            NewMessage::from_client("R1", "alice", ClientMessage::text("hi").with_timestamp(later));
        assert!(!retry_later.is_duplicate_of(&stored));
    }
}
