//! Frame types for the Courier protocol.
//!
//! Chat connections carry `ClientMessage` inbound and `ChatFrame` outbound.
//! Notification connections only receive `ChatNotice` or `FollowNotice`, and
//! the active-user feed receives arrays of `ActiveUser`.

use crate::status::MessageStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable message identifier, assigned by persistence on insert.
pub type MessageId = i64;

/// A message written by a sender on its chat connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Message body.
    pub message: String,
    /// Optional attachment reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// Client-side timestamp, used for duplicate detection of retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ClientMessage {
    /// Create a plain text message.
    #[must_use]
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file_url: None,
            created_at: None,
        }
    }

    /// Attach a file reference.
    #[must_use]
    pub fn with_file(mut self, file_url: impl Into<String>) -> Self {
        self.file_url = Some(file_url.into());
        self
    }

    /// Pin the client timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// The full, enriched message pushed to both parties after persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: MessageId,
    pub chat_id: String,
    pub message: String,
    pub username: String,
    pub file_url: Option<String>,
    pub status: MessageStatus,
    pub profile_picture: String,
    pub receiver: String,
    pub created_at: DateTime<Utc>,
}

/// Typed events sent on chat connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatEvent {
    /// Durable id of a just-persisted message, sent to its author.
    #[serde(rename = "MESSAGE_ID")]
    MessageId {
        id: MessageId,
        status: MessageStatus,
    },

    /// Status change of specific messages.
    #[serde(rename = "STATUS_UPDATE")]
    StatusUpdate {
        chat_id: String,
        status: MessageStatus,
        message_ids: Vec<MessageId>,
        /// Author of the affected messages.
        username: String,
    },

    /// A reader opened the chat and read everything inbound.
    #[serde(rename = "STATUS_UPDATE_READ")]
    StatusUpdateRead {
        chat_id: String,
        status: MessageStatus,
        message_ids: Vec<MessageId>,
        /// The reader.
        username: String,
    },

    /// A message was deleted by its author.
    #[serde(rename = "MESSAGE_DELETED")]
    MessageDeleted {
        message_id: MessageId,
        chat_id: String,
        last_message: String,
        last_message_time: Option<DateTime<Utc>>,
        status: MessageStatus,
        total_unread_count: u64,
    },

    /// A whole chat was deleted.
    #[serde(rename = "CHAT_DELETED")]
    ChatDeleted { chat_id: String },
}

impl ChatEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ChatEvent::MessageId { .. } => "MESSAGE_ID",
            ChatEvent::StatusUpdate { .. } => "STATUS_UPDATE",
            ChatEvent::StatusUpdateRead { .. } => "STATUS_UPDATE_READ",
            ChatEvent::MessageDeleted { .. } => "MESSAGE_DELETED",
            ChatEvent::ChatDeleted { .. } => "CHAT_DELETED",
        }
    }

    /// Create a status update for messages written by `author`.
    #[must_use]
    pub fn status_update(
        chat_id: impl Into<String>,
        status: MessageStatus,
        message_ids: Vec<MessageId>,
        author: impl Into<String>,
    ) -> Self {
        ChatEvent::StatusUpdate {
            chat_id: chat_id.into(),
            status,
            message_ids,
            username: author.into(),
        }
    }

    /// Create a read confirmation issued by `reader`.
    #[must_use]
    pub fn read_confirmation(
        chat_id: impl Into<String>,
        message_ids: Vec<MessageId>,
        reader: impl Into<String>,
    ) -> Self {
        ChatEvent::StatusUpdateRead {
            chat_id: chat_id.into(),
            status: MessageStatus::Read,
            message_ids,
            username: reader.into(),
        }
    }
}

/// Anything written to a chat connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatFrame {
    Event(ChatEvent),
    Message(MessageEnvelope),
}

impl From<ChatEvent> for ChatFrame {
    fn from(event: ChatEvent) -> Self {
        ChatFrame::Event(event)
    }
}

impl From<MessageEnvelope> for ChatFrame {
    fn from(envelope: MessageEnvelope) -> Self {
        ChatFrame::Message(envelope)
    }
}

/// Notification pushed when a message lands while its recipient is outside the chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatNotice {
    /// Recipient identity.
    pub user_id: String,
    pub chat_id: String,
    /// Unread messages in this chat.
    pub unread_count: u64,
    /// Unread messages across all chats.
    pub total_unread_count: u64,
    /// Preview of the new message.
    pub message: String,
    pub recipient: String,
    pub user: String,
    /// Sender's profile picture.
    pub profile_picture: String,
    pub sender: String,
    pub last_message_time: DateTime<Utc>,
    pub last_message: String,
}

/// Notification pushed when someone follows the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowNotice {
    pub unread_notification_count: u64,
    pub sender: String,
    pub receiver: String,
}

/// One entry of the active-user feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActiveUser {
    pub username: String,
    pub profile_picture: String,
}

impl ActiveUser {
    #[must_use]
    pub fn new(username: impl Into<String>, profile_picture: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            profile_picture: profile_picture.into(),
        }
    }
}
