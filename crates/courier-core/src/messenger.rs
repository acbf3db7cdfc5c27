//! The message status state machine.
//!
//! [`Messenger`] owns the process-wide registries and drives every message
//! through `sent -> {delivered | read}`. Each chat has its own async lock,
//! held from persistence through broadcast, so a chat's status events reach
//! subscribers in the order they were applied. Frames are only ever queued
//! with `try_send`, so holding the lock never waits on a slow peer.

use crate::directory::{ActiveUserDirectory, PresenceEvent};
use crate::handle::{ConnectionHandle, ConnectionId};
use crate::hub::ChatHub;
use crate::message::{ChatId, ChatMembers, ChatSummary, Identity, Message, NewMessage};
use crate::notify::NotificationHub;
use crate::room::ChatPresence;
use crate::status::initial_status;
use crate::store::{Store, StoreError};
use chrono::Utc;
use courier_protocol::{
    codec, ChatEvent, ChatFrame, ChatNotice, ClientMessage, FollowNotice, MessageEnvelope,
    MessageId, MessageStatus, ProtocolError,
};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Failures of a single messaging operation.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Chat not found: {0}")]
    ChatNotFound(ChatId),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("{identity} is not a member of chat {chat_id}")]
    NotMember { chat_id: ChatId, identity: Identity },

    #[error("{identity} did not write message {message_id}")]
    NotAuthor {
        message_id: MessageId,
        identity: Identity,
    },

    #[error("{identity} may only look up their own chats")]
    NotParticipant { identity: Identity },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A member's view of a chat: who they are and who is on the other side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatContext {
    pub chat_id: ChatId,
    pub me: Identity,
    pub peer: Identity,
}

impl ChatContext {
    fn from_members(chat: &ChatMembers, identity: &str) -> Option<Self> {
        chat.peer_of(identity).map(|peer| Self {
            chat_id: chat.chat_id.clone(),
            me: identity.to_string(),
            peer: peer.to_string(),
        })
    }
}

/// Exclusive hold on one chat. Releasing the last hold drops the chat's lock
/// entry.
struct RoomGuard<'a> {
    locks: &'a DashMap<ChatId, Arc<Mutex<()>>>,
    chat_id: ChatId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RoomGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone of the lock, so a count of one means
        // the map holds the only reference.
        self.locks
            .remove_if(&self.chat_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Messaging core shared by every connection worker and HTTP handler.
pub struct Messenger {
    store: Arc<dyn Store>,
    chats: ChatHub,
    presence: ChatPresence,
    chat_notifications: NotificationHub,
    notifications: NotificationHub,
    directory: Arc<ActiveUserDirectory>,
    room_locks: DashMap<ChatId, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("chat_connections", &self.chats.len())
            .field("rooms", &self.presence.room_count())
            .finish_non_exhaustive()
    }
}

impl Messenger {
    /// Create a messenger with fresh registries over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, directory: Arc<ActiveUserDirectory>) -> Self {
        Self {
            store,
            chats: ChatHub::new(),
            presence: ChatPresence::new(),
            chat_notifications: NotificationHub::new("chat-notifications"),
            notifications: NotificationHub::new("notifications"),
            directory,
            room_locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    #[must_use]
    pub fn chat_hub(&self) -> &ChatHub {
        &self.chats
    }

    #[must_use]
    pub fn presence(&self) -> &ChatPresence {
        &self.presence
    }

    /// Registry for chat-originated notices.
    #[must_use]
    pub fn chat_notifications(&self) -> &NotificationHub {
        &self.chat_notifications
    }

    /// Registry for general notices such as follows.
    #[must_use]
    pub fn notifications(&self) -> &NotificationHub {
        &self.notifications
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<ActiveUserDirectory> {
        &self.directory
    }

    /// Create the chat between two identities, reusing an existing one.
    ///
    /// # Errors
    ///
    /// Fails if both identities are the same or the store is unavailable.
    pub async fn create_chat(&self, me: &str, other: &str) -> Result<ChatMembers, RelayError> {
        let chat = self.store.create_chat(me, other).await?;
        debug!(chat = %chat.chat_id, user1 = %chat.user1, user2 = %chat.user2, "Chat ready");
        Ok(chat)
    }

    /// Resolve `identity`'s view of a chat.
    ///
    /// # Errors
    ///
    /// Fails for unknown chats and for identities outside the chat.
    pub async fn open_chat(&self, chat_id: &str, identity: &str) -> Result<ChatContext, RelayError> {
        let chat = self
            .store
            .chat(chat_id)
            .await?
            .ok_or_else(|| RelayError::ChatNotFound(chat_id.to_string()))?;

        ChatContext::from_members(&chat, identity).ok_or_else(|| RelayError::NotMember {
            chat_id: chat_id.to_string(),
            identity: identity.to_string(),
        })
    }

    /// Register a chat connection and mark its owner present in the room.
    pub fn join(&self, ctx: &ChatContext, handle: ConnectionHandle) {
        let id = handle.id().clone();
        self.chats.add(&ctx.me, handle);
        self.presence.join(&ctx.chat_id, &ctx.me, &id);
    }

    /// Undo [`join`](Self::join). A connection that has since been
    /// superseded leaves its replacement untouched.
    pub fn leave(&self, ctx: &ChatContext, connection_id: &ConnectionId) {
        self.presence.leave(&ctx.chat_id, &ctx.me, connection_id);
        self.chats.remove(connection_id);
    }

    /// Persist and fan out one message written by `ctx.me`.
    ///
    /// Returns `None` when the submission is a retry of a message already
    /// stored. Notification failures are logged and never fail the send.
    ///
    /// # Errors
    ///
    /// Fails when persistence fails; nothing is broadcast in that case.
    pub async fn submit(
        &self,
        ctx: &ChatContext,
        sender: &ConnectionHandle,
        incoming: ClientMessage,
    ) -> Result<Option<Message>, RelayError> {
        let _room = self.lock_room(&ctx.chat_id).await;

        let new = NewMessage::from_client(&ctx.chat_id, &ctx.me, incoming);
        if let Some(existing) = self.store.find_duplicate(&new).await? {
            debug!(chat = %ctx.chat_id, user = %ctx.me, id = existing, "Dropped duplicate submission");
            return Ok(None);
        }

        let mut message = self.store.insert_message(new).await?;
        let ack = ChatFrame::from(ChatEvent::MessageId {
            id: message.id,
            status: message.status,
        });
        if let Err(e) = sender.send(codec::encode(&ack)?) {
            debug!(connection = %sender.id(), error = %e, "Could not ack message");
        }

        let recipient_in_room = self.presence.is_present(&ctx.chat_id, &ctx.peer);
        if initial_status(recipient_in_room) == MessageStatus::Read {
            // Everything pending from this sender is read along with the new
            // message, matching the unread rows cleared below.
            let moved = self
                .advance_locked(&ctx.chat_id, &ctx.me, MessageStatus::Read)
                .await?;
            if moved.contains(&message.id) {
                message.status = MessageStatus::Read;
            }
            if let Err(e) = self.store.clear_chat_notifications(&ctx.peer, &ctx.chat_id).await {
                warn!(chat = %ctx.chat_id, user = %ctx.peer, error = %e, "Failed to clear unread rows");
            }
        } else if self.directory.is_reachable(&ctx.peer).await {
            let moved = self
                .advance_locked(&ctx.chat_id, &ctx.me, MessageStatus::Delivered)
                .await?;
            if moved.contains(&message.id) {
                message.status = MessageStatus::Delivered;
            }
        }

        let profile_picture = self.profile_picture(&ctx.me).await;
        let echo = codec::encode(&ChatFrame::from(message.envelope(&profile_picture, &ctx.peer)))?;
        self.chats.send_to(&ctx.peer, &echo);
        if let Err(e) = sender.send(echo) {
            debug!(connection = %sender.id(), error = %e, "Could not echo message");
        }

        if !recipient_in_room {
            if let Err(e) = self.notify_unread(ctx, &message, &profile_picture).await {
                warn!(chat = %ctx.chat_id, user = %ctx.peer, error = %e, "Chat notification failed");
            }
        }

        info!(chat = %ctx.chat_id, id = message.id, status = %message.status, "Message submitted");
        Ok(Some(message))
    }

    /// Move the peer's `sent` messages in `chat_id` to `delivered` if
    /// `recipient` is reachable. Returns the ids moved.
    ///
    /// # Errors
    ///
    /// Fails on persistence errors or if `recipient` is not a member.
    pub async fn deliver_pending(
        &self,
        chat_id: &str,
        recipient: &str,
    ) -> Result<Vec<MessageId>, RelayError> {
        if !self.directory.is_reachable(recipient).await {
            return Ok(Vec::new());
        }
        let ctx = self.open_chat(chat_id, recipient).await?;
        let _room = self.lock_room(chat_id).await;
        self.advance_locked(chat_id, &ctx.peer, MessageStatus::Delivered)
            .await
    }

    /// [`deliver_pending`](Self::deliver_pending) across every chat of
    /// `recipient`. Returns how many messages moved.
    ///
    /// # Errors
    ///
    /// Fails if the recipient's chats cannot be listed. Per-chat failures are
    /// logged and skipped.
    pub async fn deliver_all(&self, recipient: &str) -> Result<usize, RelayError> {
        let mut delivered = 0;
        for chat in self.store.chats_for(recipient).await? {
            match self.deliver_pending(&chat.chat_id, recipient).await {
                Ok(moved) => delivered += moved.len(),
                Err(e) => {
                    warn!(chat = %chat.chat_id, user = %recipient, error = %e, "Deferred delivery failed");
                }
            }
        }
        if delivered > 0 {
            debug!(user = %recipient, delivered, "Delivered pending messages");
        }
        Ok(delivered)
    }

    /// Run deferred delivery whenever the directory reports an identity
    /// coming online.
    pub fn spawn_delivery_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let messenger = Arc::clone(self);
        let mut events = self.directory.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PresenceEvent::Online(identity)) => {
                        if let Err(e) = messenger.deliver_all(&identity).await {
                            warn!(user = %identity, error = %e, "Deferred delivery failed");
                        }
                    }
                    Ok(PresenceEvent::Offline(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Delivery worker lagged behind presence events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Delivery worker stopped");
        })
    }

    /// `reader` opened the chat: mark everything inbound read and clear
    /// their unread rows. Returns the ids that changed.
    ///
    /// # Errors
    ///
    /// Fails for non-members and on persistence errors.
    pub async fn mark_read(
        &self,
        chat_id: &str,
        reader: &str,
    ) -> Result<Vec<MessageId>, RelayError> {
        let ctx = self.open_chat(chat_id, reader).await?;
        let _room = self.lock_room(chat_id).await;

        let moved = self
            .store
            .advance_from_author(chat_id, &ctx.peer, MessageStatus::Read)
            .await?;
        let cleared = self.store.clear_chat_notifications(reader, chat_id).await?;

        self.broadcast(&ChatEvent::read_confirmation(chat_id, moved.clone(), reader))?;
        debug!(chat = %chat_id, user = %reader, read = moved.len(), cleared, "Chat marked read");
        Ok(moved)
    }

    /// Delete a message on behalf of its author.
    ///
    /// # Errors
    ///
    /// Fails for unknown messages, for anyone but the author and on
    /// persistence errors.
    pub async fn delete_message(&self, id: MessageId, requester: &str) -> Result<(), RelayError> {
        let message = self.authored_message(id, requester).await?;
        let ctx = self.open_chat(&message.chat_id, requester).await?;
        let _room = self.lock_room(&ctx.chat_id).await;

        // Status may have moved while waiting for the room.
        let message = self.authored_message(id, requester).await?;
        if !self.store.delete_message(id).await? {
            return Err(RelayError::MessageNotFound(id));
        }
        if message.status.is_unread() {
            self.store.remove_chat_notification(&ctx.peer, id).await?;
        }

        let last = self.store.last_message(&ctx.chat_id, &ctx.peer).await?;
        let total_unread_count = self.store.total_unread_count(&ctx.peer).await?;
        let event = ChatEvent::MessageDeleted {
            message_id: id,
            chat_id: ctx.chat_id.clone(),
            last_message: last.as_ref().map(|m| m.body.clone()).unwrap_or_default(),
            last_message_time: last.map(|m| m.created_at),
            status: message.status,
            total_unread_count,
        };

        self.broadcast(&event)?;
        self.chat_notifications.notify(&ctx.peer, &event)?;
        info!(chat = %ctx.chat_id, id, user = %requester, "Message deleted");
        Ok(())
    }

    /// Delete a chat's history on behalf of one of its members.
    ///
    /// # Errors
    ///
    /// Fails for non-members and on persistence errors.
    pub async fn delete_chat(&self, chat_id: &str, requester: &str) -> Result<(), RelayError> {
        let ctx = self.open_chat(chat_id, requester).await?;
        let _room = self.lock_room(chat_id).await;

        self.store.delete_chat(chat_id).await?;

        let event = ChatEvent::ChatDeleted {
            chat_id: chat_id.to_string(),
        };
        self.broadcast(&event)?;
        self.chat_notifications.notify(&ctx.peer, &event)?;
        info!(chat = %chat_id, user = %requester, "Chat deleted");
        Ok(())
    }

    /// Hide a chat and its current messages from `requester` only. The peer
    /// keeps the full history, and the next message makes the chat visible
    /// again. Returns how many messages were hidden.
    ///
    /// # Errors
    ///
    /// Fails for non-members and on persistence errors.
    pub async fn delete_messages_for(
        &self,
        chat_id: &str,
        requester: &str,
    ) -> Result<usize, RelayError> {
        self.open_chat(chat_id, requester).await?;
        let _room = self.lock_room(chat_id).await;

        let hidden = self.store.delete_messages_for(chat_id, requester).await?;
        info!(chat = %chat_id, user = %requester, hidden, "Chat cleared for one member");
        Ok(hidden)
    }

    /// The chat between `user1` and `user2`, if any. Only one of the two may
    /// ask.
    ///
    /// # Errors
    ///
    /// Fails when `requester` is neither user and on persistence errors.
    pub async fn find_chat(
        &self,
        requester: &str,
        user1: &str,
        user2: &str,
    ) -> Result<Option<ChatId>, RelayError> {
        if requester != user1 && requester != user2 {
            return Err(RelayError::NotParticipant {
                identity: requester.to_string(),
            });
        }
        Ok(self
            .store
            .find_chat(user1, user2)
            .await?
            .map(|chat| chat.chat_id))
    }

    /// Every chat of `identity` that they have not hidden, most recent
    /// activity first.
    ///
    /// # Errors
    ///
    /// Fails on persistence errors.
    pub async fn inbox(&self, identity: &str) -> Result<Vec<ChatSummary>, RelayError> {
        let mut summaries = Vec::new();
        for chat in self.store.chats_for(identity).await? {
            if self.store.chat_hidden_for(&chat.chat_id, identity).await? {
                continue;
            }
            let Some(peer) = chat.peer_of(identity) else {
                continue;
            };
            let last = self.store.last_message(&chat.chat_id, identity).await?;
            summaries.push(ChatSummary {
                unread_count: self.store.unread_count(identity, &chat.chat_id).await?,
                profile_picture: self.profile_picture(peer).await,
                user: peer.to_string(),
                last_message_time: last.as_ref().map(|m| m.created_at),
                last_message: last.map(|m| m.body).unwrap_or_default(),
                chat_id: chat.chat_id.clone(),
            });
        }
        summaries.sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
        Ok(summaries)
    }

    /// Tell `following` that `follower` followed them. Returns whether a
    /// notification connection received it.
    ///
    /// # Errors
    ///
    /// Fails if the unread notification count cannot be read.
    pub async fn notify_follow(&self, follower: &str, following: &str) -> Result<bool, RelayError> {
        let notice = FollowNotice {
            unread_notification_count: self.store.unread_notification_count(following).await?,
            sender: follower.to_string(),
            receiver: following.to_string(),
        };
        Ok(self.notifications.notify(following, &notice)?)
    }

    /// Unread chat messages of `identity` across all chats.
    ///
    /// # Errors
    ///
    /// Fails on persistence errors.
    pub async fn unread_total(&self, identity: &str) -> Result<u64, RelayError> {
        Ok(self.store.total_unread_count(identity).await?)
    }

    /// A page of the history `identity` can see, oldest first, in the same
    /// enriched form pushed live.
    ///
    /// # Errors
    ///
    /// Fails for non-members and on persistence errors.
    pub async fn history(
        &self,
        chat_id: &str,
        identity: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MessageEnvelope>, RelayError> {
        let ctx = self.open_chat(chat_id, identity).await?;
        let messages = self.store.history(chat_id, identity, limit, offset).await?;

        let my_picture = self.store.profile_picture(&ctx.me).await?;
        let peer_picture = self.store.profile_picture(&ctx.peer).await?;
        Ok(messages
            .iter()
            .map(|m| {
                if m.sender == ctx.me {
                    m.envelope(&my_picture, &ctx.peer)
                } else {
                    m.envelope(&peer_picture, &ctx.me)
                }
            })
            .collect())
    }

    async fn authored_message(&self, id: MessageId, requester: &str) -> Result<Message, RelayError> {
        let message = self
            .store
            .message(id)
            .await?
            .ok_or(RelayError::MessageNotFound(id))?;
        if message.sender != requester {
            return Err(RelayError::NotAuthor {
                message_id: id,
                identity: requester.to_string(),
            });
        }
        Ok(message)
    }

    async fn lock_room(&self, chat_id: &str) -> RoomGuard<'_> {
        let lock = self
            .room_locks
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        RoomGuard {
            locks: &self.room_locks,
            chat_id: chat_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Advance `author`'s messages in a chat and broadcast the ones that
    /// moved. Caller holds the room lock.
    async fn advance_locked(
        &self,
        chat_id: &str,
        author: &str,
        to: MessageStatus,
    ) -> Result<Vec<MessageId>, RelayError> {
        let moved = self.store.advance_from_author(chat_id, author, to).await?;
        if !moved.is_empty() {
            self.broadcast(&ChatEvent::status_update(chat_id, to, moved.clone(), author))?;
        }
        Ok(moved)
    }

    fn broadcast(&self, event: &ChatEvent) -> Result<usize, ProtocolError> {
        let frame = codec::encode(&ChatFrame::from(event.clone()))?;
        let sent = self.chats.broadcast(&frame);
        debug!(event = event.kind(), recipients = sent, "Broadcast chat event");
        Ok(sent)
    }

    async fn notify_unread(
        &self,
        ctx: &ChatContext,
        message: &Message,
        profile_picture: &str,
    ) -> Result<bool, RelayError> {
        self.store
            .add_chat_notification(&ctx.peer, &ctx.chat_id, message.id, &message.body)
            .await?;
        if !self.chat_notifications.contains(&ctx.peer) {
            return Ok(false);
        }

        let unread_count = self.store.unread_count(&ctx.peer, &ctx.chat_id).await?;
        let total_unread_count = self.store.total_unread_count(&ctx.peer).await?;
        let last = self.store.last_message(&ctx.chat_id, &ctx.peer).await?;

        let notice = ChatNotice {
            user_id: ctx.peer.clone(),
            chat_id: ctx.chat_id.clone(),
            unread_count,
            total_unread_count,
            message: message.body.clone(),
            recipient: ctx.peer.clone(),
            user: ctx.me.clone(),
            profile_picture: profile_picture.to_string(),
            sender: ctx.me.clone(),
            last_message_time: last.as_ref().map_or_else(Utc::now, |m| m.created_at),
            last_message: last.map(|m| m.body).unwrap_or_default(),
        };
        Ok(self.chat_notifications.notify(&ctx.peer, &notice)?)
    }

    async fn profile_picture(&self, identity: &str) -> String {
        match self.store.profile_picture(identity).await {
            Ok(url) => url,
            Err(e) => {
                debug!(user = %identity, error = %e, "No profile picture");
                String::new()
            }
        }
    }
}
