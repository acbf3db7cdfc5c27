//! In-process [`Store`] implementation.
//!
//! Backs the server when no external database is configured and every test in
//! the workspace. All state sits behind one async mutex so multi-row updates
//! are atomic with respect to each other.

use crate::message::{generate_chat_id, ChatMembers, LastMessage, Message, NewMessage};
use crate::status::advance;
use crate::store::{Store, StoreError};
use async_trait::async_trait;
use courier_protocol::{MessageId, MessageStatus};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::trace;

#[derive(Debug, Clone)]
struct ChatNotificationRow {
    recipient: String,
    chat_id: String,
    message_id: MessageId,
}

#[derive(Debug, Default)]
struct State {
    next_message_id: MessageId,
    chats: HashMap<String, ChatMembers>,
    messages: BTreeMap<MessageId, Message>,
    hidden_chats: HashMap<String, HashSet<String>>,
    hidden_messages: HashMap<MessageId, HashSet<String>>,
    chat_notifications: Vec<ChatNotificationRow>,
    general_notifications: HashMap<String, u64>,
    profile_pictures: HashMap<String, String>,
}

impl State {
    fn find_chat(&self, user1: &str, user2: &str) -> Option<&ChatMembers> {
        self.chats.values().find(|chat| {
            (chat.user1 == user1 && chat.user2 == user2)
                || (chat.user1 == user2 && chat.user2 == user1)
        })
    }

    fn visible<'a>(
        &'a self,
        chat_id: &'a str,
        viewer: &'a str,
    ) -> impl DoubleEndedIterator<Item = &'a Message> + 'a {
        self.messages.values().filter(move |message| {
            message.chat_id == chat_id
                && !self
                    .hidden_messages
                    .get(&message.id)
                    .is_some_and(|hidden| hidden.contains(viewer))
        })
    }
}

/// A [`Store`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Set the display picture of `identity`.
    pub async fn set_profile_picture(&self, identity: &str, url: &str) {
        self.state
            .lock()
            .await
            .profile_pictures
            .insert(identity.to_string(), url.to_string());
    }

    /// Record an unread general notification (follows, likes) for `identity`.
    pub async fn add_notification(&self, identity: &str) -> u64 {
        let mut state = self.state.lock().await;
        let count = state
            .general_notifications
            .entry(identity.to_string())
            .or_insert(0);
        *count += 1;
        *count
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_chat(&self, user1: &str, user2: &str) -> Result<ChatMembers, StoreError> {
        self.check()?;
        if user1 == user2 {
            return Err(StoreError::Constraint("a chat needs two distinct members".into()));
        }

        let mut state = self.state.lock().await;
        if let Some(chat) = state.find_chat(user1, user2) {
            return Ok(chat.clone());
        }

        let chat = ChatMembers {
            chat_id: generate_chat_id(),
            user1: user1.to_string(),
            user2: user2.to_string(),
        };
        state.chats.insert(chat.chat_id.clone(), chat.clone());
        Ok(chat)
    }

    async fn find_chat(
        &self,
        user1: &str,
        user2: &str,
    ) -> Result<Option<ChatMembers>, StoreError> {
        self.check()?;
        Ok(self.state.lock().await.find_chat(user1, user2).cloned())
    }

    async fn chat(&self, chat_id: &str) -> Result<Option<ChatMembers>, StoreError> {
        self.check()?;
        Ok(self.state.lock().await.chats.get(chat_id).cloned())
    }

    async fn chats_for(&self, identity: &str) -> Result<Vec<ChatMembers>, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        let mut chats: Vec<_> = state
            .chats
            .values()
            .filter(|chat| chat.contains(identity))
            .cloned()
            .collect();
        chats.sort_by(|a, b| a.chat_id.cmp(&b.chat_id));
        Ok(chats)
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let State {
            messages,
            hidden_messages,
            ..
        } = &mut *state;
        messages.retain(|id, message| {
            let keep = message.chat_id != chat_id;
            if !keep {
                hidden_messages.remove(id);
            }
            keep
        });
        state.chat_notifications.retain(|row| row.chat_id != chat_id);

        if let Some(chat) = state.chats.get(chat_id).cloned() {
            state
                .hidden_chats
                .insert(chat.chat_id, HashSet::from([chat.user1, chat.user2]));
        }
        Ok(())
    }

    async fn delete_messages_for(
        &self,
        chat_id: &str,
        identity: &str,
    ) -> Result<usize, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        if !state.chats.contains_key(chat_id) {
            return Err(StoreError::Constraint(format!("unknown chat {chat_id}")));
        }

        let ids: Vec<MessageId> = state
            .messages
            .values()
            .filter(|message| message.chat_id == chat_id)
            .map(|message| message.id)
            .collect();
        let mut hidden = 0;
        for id in ids {
            if state
                .hidden_messages
                .entry(id)
                .or_default()
                .insert(identity.to_string())
            {
                hidden += 1;
            }
        }
        state
            .hidden_chats
            .entry(chat_id.to_string())
            .or_default()
            .insert(identity.to_string());
        trace!(chat = chat_id, user = identity, hidden, "Hid chat");
        Ok(hidden)
    }

    async fn chat_hidden_for(&self, chat_id: &str, identity: &str) -> Result<bool, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .hidden_chats
            .get(chat_id)
            .is_some_and(|hidden| hidden.contains(identity)))
    }

    async fn find_duplicate(&self, message: &NewMessage) -> Result<Option<MessageId>, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .messages
            .values()
            .find(|existing| message.is_duplicate_of(existing))
            .map(|existing| existing.id))
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        if !state.chats.contains_key(&message.chat_id) {
            return Err(StoreError::Constraint(format!(
                "unknown chat {}",
                message.chat_id
            )));
        }

        state.hidden_chats.remove(&message.chat_id);
        state.next_message_id += 1;
        let stored = Message::from_new(state.next_message_id, message);
        state.messages.insert(stored.id, stored.clone());
        trace!(id = stored.id, chat = %stored.chat_id, "Inserted message");
        Ok(stored)
    }

    async fn message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        self.check()?;
        Ok(self.state.lock().await.messages.get(&id).cloned())
    }

    async fn history(
        &self,
        chat_id: &str,
        viewer: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .visible(chat_id, viewer)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn last_message(
        &self,
        chat_id: &str,
        viewer: &str,
    ) -> Result<Option<LastMessage>, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        let last = state
            .visible(chat_id, viewer)
            .next_back()
            .map(|message| LastMessage {
                body: message.body.clone(),
                created_at: message.created_at,
            });
        Ok(last)
    }

    async fn advance_from_author(
        &self,
        chat_id: &str,
        author: &str,
        to: MessageStatus,
    ) -> Result<Vec<MessageId>, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let mut moved = Vec::new();
        for message in state.messages.values_mut() {
            if message.chat_id != chat_id || message.sender != author {
                continue;
            }
            if let Ok(next) = advance(message.status, to) {
                message.status = next;
                moved.push(message.id);
            }
        }
        Ok(moved)
    }

    async fn delete_message(&self, id: MessageId) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        state.hidden_messages.remove(&id);
        Ok(state.messages.remove(&id).is_some())
    }

    async fn add_chat_notification(
        &self,
        recipient: &str,
        chat_id: &str,
        message_id: MessageId,
        body: &str,
    ) -> Result<(), StoreError> {
        self.check()?;
        trace!(recipient, chat = chat_id, message_id, preview = body, "Unread row");
        self.state
            .lock()
            .await
            .chat_notifications
            .push(ChatNotificationRow {
                recipient: recipient.to_string(),
                chat_id: chat_id.to_string(),
                message_id,
            });
        Ok(())
    }

    async fn remove_chat_notification(
        &self,
        recipient: &str,
        message_id: MessageId,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let before = state.chat_notifications.len();
        state
            .chat_notifications
            .retain(|row| !(row.recipient == recipient && row.message_id == message_id));
        Ok(state.chat_notifications.len() < before)
    }

    async fn clear_chat_notifications(
        &self,
        recipient: &str,
        chat_id: &str,
    ) -> Result<usize, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let before = state.chat_notifications.len();
        state
            .chat_notifications
            .retain(|row| !(row.recipient == recipient && row.chat_id == chat_id));
        Ok(before - state.chat_notifications.len())
    }

    async fn unread_count(&self, recipient: &str, chat_id: &str) -> Result<u64, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .chat_notifications
            .iter()
            .filter(|row| row.recipient == recipient && row.chat_id == chat_id)
            .count() as u64)
    }

    async fn total_unread_count(&self, recipient: &str) -> Result<u64, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .chat_notifications
            .iter()
            .filter(|row| row.recipient == recipient)
            .count() as u64)
    }

    async fn unread_notification_count(&self, identity: &str) -> Result<u64, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .general_notifications
            .get(identity)
            .copied()
            .unwrap_or(0))
    }

    async fn profile_picture(&self, identity: &str) -> Result<String, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .profile_pictures
            .get(identity)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::ClientMessage;

    async fn seeded() -> (MemoryStore, ChatMembers) {
        let store = MemoryStore::new();
        let chat = store.create_chat("alice", "bob").await.unwrap();
        (store, chat)
    }

    fn text(chat: &ChatMembers, sender: &str, body: &str) -> NewMessage {
        NewMessage::from_client(&chat.chat_id, sender, ClientMessage::text(body))
    }

    #[tokio::test]
    async fn test_create_chat_is_idempotent_per_pair() {
        let (store, chat) = seeded().await;
        let again = store.create_chat("bob", "alice").await.unwrap();
        assert_eq!(again.chat_id, chat.chat_id);
        assert!(store.create_chat("alice", "alice").await.is_err());
        assert_eq!(store.chats_for("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let (store, chat) = seeded().await;
        let first = store.insert_message(text(&chat, "alice", "one")).await.unwrap();
        let second = store.insert_message(text(&chat, "alice", "two")).await.unwrap();
        assert!(second.id > first.id);

        let history = store.history(&chat.chat_id, "bob", 10, 0).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].body, "one");

        let last = store.last_message(&chat.chat_id, "bob").await.unwrap().unwrap();
        assert_eq!(last.body, "two");
    }

    #[tokio::test]
    async fn test_insert_into_unknown_chat_fails() {
        let store = MemoryStore::new();
        let message = NewMessage::from_client("nope", "alice", ClientMessage::text("hi"));
        assert!(matches!(
            store.insert_message(message).await,
            Err(StoreError::Constraint(_))
        ));
    }

    #[tokio::test]
    async fn test_find_duplicate() {
        let (store, chat) = seeded().await;
        let message = text(&chat, "alice", "hi");
        let stored = store.insert_message(message.clone()).await.unwrap();
        assert_eq!(store.find_duplicate(&message).await.unwrap(), Some(stored.id));

        let other = text(&chat, "alice", "hello");
        assert_eq!(store.find_duplicate(&other).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transitions_never_regress() {
        let (store, chat) = seeded().await;
        let message = store.insert_message(text(&chat, "alice", "hi")).await.unwrap();

        let moved = store
            .advance_from_author(&chat.chat_id, "alice", MessageStatus::Read)
            .await
            .unwrap();
        assert_eq!(moved, vec![message.id]);

        let moved = store
            .advance_from_author(&chat.chat_id, "alice", MessageStatus::Delivered)
            .await
            .unwrap();
        assert!(moved.is_empty());

        let stored = store.message(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_advance_from_author_only_touches_author() {
        let (store, chat) = seeded().await;
        let a = store.insert_message(text(&chat, "alice", "a")).await.unwrap();
        let b = store.insert_message(text(&chat, "bob", "b")).await.unwrap();

        let moved = store
            .advance_from_author(&chat.chat_id, "alice", MessageStatus::Delivered)
            .await
            .unwrap();
        assert_eq!(moved, vec![a.id]);
        assert_eq!(
            store.message(b.id).await.unwrap().unwrap().status,
            MessageStatus::Sent
        );

        let moved = store
            .advance_from_author(&chat.chat_id, "alice", MessageStatus::Delivered)
            .await
            .unwrap();
        assert!(moved.is_empty());
    }

    #[tokio::test]
    async fn test_unread_rows() {
        let (store, chat) = seeded().await;
        let a = store.insert_message(text(&chat, "alice", "a")).await.unwrap();
        let b = store.insert_message(text(&chat, "alice", "b")).await.unwrap();
        store.add_chat_notification("bob", &chat.chat_id, a.id, "a").await.unwrap();
        store.add_chat_notification("bob", &chat.chat_id, b.id, "b").await.unwrap();

        assert_eq!(store.unread_count("bob", &chat.chat_id).await.unwrap(), 2);
        assert!(store.remove_chat_notification("bob", a.id).await.unwrap());
        assert!(!store.remove_chat_notification("bob", a.id).await.unwrap());
        assert_eq!(store.total_unread_count("bob").await.unwrap(), 1);

        assert_eq!(store.clear_chat_notifications("bob", &chat.chat_id).await.unwrap(), 1);
        assert_eq!(store.total_unread_count("bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_chat_drops_history_and_unread() {
        let (store, chat) = seeded().await;
        let a = store.insert_message(text(&chat, "alice", "a")).await.unwrap();
        store.add_chat_notification("bob", &chat.chat_id, a.id, "a").await.unwrap();

        store.delete_chat(&chat.chat_id).await.unwrap();
        assert!(store.history(&chat.chat_id, "alice", 10, 0).await.unwrap().is_empty());
        assert_eq!(store.total_unread_count("bob").await.unwrap(), 0);
        assert!(store.chat(&chat.chat_id).await.unwrap().is_some());
        assert!(store.chat_hidden_for(&chat.chat_id, "alice").await.unwrap());
        assert!(store.chat_hidden_for(&chat.chat_id, "bob").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_messages_for_one_member() {
        let (store, chat) = seeded().await;
        store.insert_message(text(&chat, "alice", "a")).await.unwrap();
        store.insert_message(text(&chat, "bob", "b")).await.unwrap();

        assert_eq!(store.delete_messages_for(&chat.chat_id, "alice").await.unwrap(), 2);
        assert_eq!(store.delete_messages_for(&chat.chat_id, "alice").await.unwrap(), 0);
        assert!(store.history(&chat.chat_id, "alice", 10, 0).await.unwrap().is_empty());
        assert!(store.last_message(&chat.chat_id, "alice").await.unwrap().is_none());
        assert_eq!(store.history(&chat.chat_id, "bob", 10, 0).await.unwrap().len(), 2);
        assert!(store.chat_hidden_for(&chat.chat_id, "alice").await.unwrap());
        assert!(!store.chat_hidden_for(&chat.chat_id, "bob").await.unwrap());

        store.insert_message(text(&chat, "bob", "again")).await.unwrap();
        assert!(!store.chat_hidden_for(&chat.chat_id, "alice").await.unwrap());
        let history = store.history(&chat.chat_id, "alice", 10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "again");

        assert!(matches!(
            store.delete_messages_for("nope", "alice").await,
            Err(StoreError::Constraint(_))
        ));
    }

    #[tokio::test]
    async fn test_find_chat_either_order() {
        let (store, chat) = seeded().await;
        assert_eq!(store.find_chat("bob", "alice").await.unwrap(), Some(chat.clone()));
        assert_eq!(store.find_chat("alice", "carol").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let (store, chat) = seeded().await;
        store.set_unavailable(true);
        assert!(matches!(
            store.chat(&chat.chat_id).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.chat(&chat.chat_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_profile_and_general_notifications() {
        let store = MemoryStore::new();
        assert_eq!(store.profile_picture("alice").await.unwrap(), "");
        store.set_profile_picture("alice", "https://img/a.png").await;
        assert_eq!(store.profile_picture("alice").await.unwrap(), "https://img/a.png");

        assert_eq!(store.add_notification("alice").await, 1);
        assert_eq!(store.unread_notification_count("alice").await.unwrap(), 1);
    }
}
