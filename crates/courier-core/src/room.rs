//! Per-room presence tracking.
//!
//! A user is "in" a room while it holds a chat connection opened for that
//! room. Membership records which connection owns it, so the cleanup of a
//! superseded connection cannot evict the connection that replaced it.

use crate::handle::ConnectionId;
use crate::message::{ChatId, Identity};
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::debug;

/// Tracks which identities are currently inside which rooms.
#[derive(Debug, Default)]
pub struct ChatPresence {
    rooms: DashMap<ChatId, HashMap<Identity, ConnectionId>>,
}

impl ChatPresence {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `identity` present in `room`, owned by `connection`.
    ///
    /// Idempotent: joining again only moves ownership to `connection`.
    /// Returns `true` if the identity was not present before.
    pub fn join(&self, room: &str, identity: &str, connection: &ConnectionId) -> bool {
        let mut members = self.rooms.entry(room.to_string()).or_default();
        let is_new = members
            .insert(identity.to_string(), connection.clone())
            .is_none();

        if is_new {
            debug!(chat = %room, user = %identity, "Joined room");
        }
        is_new
    }

    /// Remove `identity` from `room` if `connection` still owns the membership.
    ///
    /// Empty rooms are pruned. Leaving a room one is not in is a no-op.
    pub fn leave(&self, room: &str, identity: &str, connection: &ConnectionId) -> bool {
        self.remove_member(room, identity, Some(connection))
    }

    /// Remove `identity` from `room` regardless of which connection owns it.
    pub fn evict(&self, room: &str, identity: &str) -> bool {
        self.remove_member(room, identity, None)
    }

    fn remove_member(&self, room: &str, identity: &str, owner: Option<&ConnectionId>) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(mut members) => {
                let owned = match (members.get(identity), owner) {
                    (Some(current), Some(owner)) => current == owner,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if owned {
                    members.remove(identity);
                }
                owned
            }
            None => false,
        };

        if removed {
            debug!(chat = %room, user = %identity, "Left room");
            if self.rooms.remove_if(room, |_, members| members.is_empty()).is_some() {
                debug!(chat = %room, "Pruned empty room");
            }
        }
        removed
    }

    /// Whether `identity` is currently inside `room`.
    #[must_use]
    pub fn is_present(&self, room: &str, identity: &str) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains_key(identity))
    }

    /// Identities currently inside `room`.
    #[must_use]
    pub fn members(&self, room: &str) -> Vec<Identity> {
        self.rooms
            .get(room)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of rooms with at least one member.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_is_idempotent() {
        let presence = ChatPresence::new();
        let conn = ConnectionId::from("conn-1");

        assert!(presence.join("R123", "bob", &conn));
        assert!(!presence.join("R123", "bob", &conn));
        assert_eq!(presence.members("R123"), vec!["bob".to_string()]);
        assert!(presence.is_present("R123", "bob"));
    }

    #[test]
    fn test_leave_prunes_room() {
        let presence = ChatPresence::new();
        let conn = ConnectionId::from("conn-1");

        presence.join("R123", "bob", &conn);
        assert_eq!(presence.room_count(), 1);
        assert!(presence.leave("R123", "bob", &conn));
        assert!(!presence.is_present("R123", "bob"));
        assert_eq!(presence.room_count(), 0);
    }

    #[test]
    fn test_leave_non_member_is_noop() {
        let presence = ChatPresence::new();
        let conn = ConnectionId::from("conn-1");

        assert!(!presence.leave("R123", "bob", &conn));
        presence.join("R123", "alice", &conn);
        assert!(!presence.leave("R123", "bob", &conn));
        assert!(presence.is_present("R123", "alice"));
    }

    #[test]
    fn test_stale_owner_cannot_leave() {
        let presence = ChatPresence::new();
        let old = ConnectionId::from("conn-old");
        let new = ConnectionId::from("conn-new");

        presence.join("R123", "bob", &old);
        presence.join("R123", "bob", &new);

        assert!(!presence.leave("R123", "bob", &old));
        assert!(presence.is_present("R123", "bob"));

        assert!(presence.evict("R123", "bob"));
        assert!(!presence.is_present("R123", "bob"));
    }
}
