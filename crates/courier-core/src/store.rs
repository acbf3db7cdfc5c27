//! Persistence seam.
//!
//! The durable store is the system of record for chats, messages and unread
//! rows. The core only reads and writes through this trait; in-memory state is
//! never authoritative for anything persisted here.

use crate::message::{ChatMembers, LastMessage, Message, NewMessage};
use async_trait::async_trait;
use courier_protocol::{MessageId, MessageStatus};
use thiserror::Error;

/// Persistence errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A write violated a constraint.
    #[error("Constraint violated: {0}")]
    Constraint(String),
}

/// Durable store for chats, messages and unread counters.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create the chat between two users, or return the existing one.
    async fn create_chat(&self, user1: &str, user2: &str) -> Result<ChatMembers, StoreError>;

    /// The chat between two users, in either order.
    async fn find_chat(&self, user1: &str, user2: &str)
        -> Result<Option<ChatMembers>, StoreError>;

    /// Look up a chat.
    async fn chat(&self, chat_id: &str) -> Result<Option<ChatMembers>, StoreError>;

    /// Every chat `identity` is a member of.
    async fn chats_for(&self, identity: &str) -> Result<Vec<ChatMembers>, StoreError>;

    /// Delete every message and unread row of a chat. The chat itself stays
    /// addressable but is hidden from both members until the next message.
    async fn delete_chat(&self, chat_id: &str) -> Result<(), StoreError>;

    /// Hide a chat and every message currently in it from `identity` only.
    /// Returns how many messages were newly hidden.
    async fn delete_messages_for(&self, chat_id: &str, identity: &str)
        -> Result<usize, StoreError>;

    /// Whether `identity` has hidden the chat since its last message.
    async fn chat_hidden_for(&self, chat_id: &str, identity: &str) -> Result<bool, StoreError>;

    /// Id of an already stored message with the same room, sender, body and
    /// timestamp.
    async fn find_duplicate(&self, message: &NewMessage) -> Result<Option<MessageId>, StoreError>;

    /// Persist a message and assign its id. Unhides the chat for both members.
    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// Look up a message.
    async fn message(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    /// Messages of a chat visible to `viewer`, oldest first.
    async fn history(
        &self,
        chat_id: &str,
        viewer: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// The newest message of a chat visible to `viewer`.
    async fn last_message(
        &self,
        chat_id: &str,
        viewer: &str,
    ) -> Result<Option<LastMessage>, StoreError>;

    /// Move every message `author` wrote in `chat_id` that can legally reach
    /// `to`. Rows that cannot legally advance are left untouched. Returns the
    /// ids actually moved, in id order.
    async fn advance_from_author(
        &self,
        chat_id: &str,
        author: &str,
        to: MessageStatus,
    ) -> Result<Vec<MessageId>, StoreError>;

    /// Delete a message. Returns `false` if it did not exist.
    async fn delete_message(&self, id: MessageId) -> Result<bool, StoreError>;

    /// Record an unread row for `recipient`.
    async fn add_chat_notification(
        &self,
        recipient: &str,
        chat_id: &str,
        message_id: MessageId,
        body: &str,
    ) -> Result<(), StoreError>;

    /// Drop the unread row for one message. Returns `false` if there was none.
    async fn remove_chat_notification(
        &self,
        recipient: &str,
        message_id: MessageId,
    ) -> Result<bool, StoreError>;

    /// Drop every unread row of `recipient` in `chat_id`. Returns how many.
    async fn clear_chat_notifications(
        &self,
        recipient: &str,
        chat_id: &str,
    ) -> Result<usize, StoreError>;

    /// Unread messages for `recipient` in `chat_id`.
    async fn unread_count(&self, recipient: &str, chat_id: &str) -> Result<u64, StoreError>;

    /// Unread messages for `recipient` across all chats.
    async fn total_unread_count(&self, recipient: &str) -> Result<u64, StoreError>;

    /// Unread general (follow-type) notifications for `identity`.
    async fn unread_notification_count(&self, identity: &str) -> Result<u64, StoreError>;

    /// Display picture of `identity`; empty when unknown.
    async fn profile_picture(&self, identity: &str) -> Result<String, StoreError>;
}
