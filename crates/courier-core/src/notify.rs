//! Notification registry.
//!
//! Notification connections stay open while the user browses anywhere in the
//! app, independent of any open chat, and carry only out-of-band payloads:
//! unread counters, message previews, follow notices and deletions.

use crate::handle::{ConnectionHandle, ConnectionId};
use crate::hub::Registry;
use bytes::Bytes;
use courier_protocol::{codec, ProtocolError};
use serde::Serialize;

/// Identity-keyed registry of notification connections.
#[derive(Debug)]
pub struct NotificationHub {
    inner: Registry,
}

impl NotificationHub {
    /// Create an empty hub. `name` labels its log lines.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Registry::new(name),
        }
    }

    /// Register the notification connection of `identity`, closing any
    /// connection it replaces.
    pub fn add(&self, identity: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.inner.add(identity, handle)
    }

    /// Unregister a connection. Safe to call repeatedly.
    pub fn remove(&self, connection_id: &ConnectionId) -> bool {
        self.inner.remove(connection_id)
    }

    /// Push an encoded payload to `identity`.
    pub fn send_to(&self, identity: &str, payload: &Bytes) -> bool {
        self.inner.send_to(identity, payload)
    }

    /// Encode and push a payload to `identity`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the payload cannot be encoded. An absent or
    /// failed connection yields `Ok(false)`.
    pub fn notify<T: Serialize>(&self, identity: &str, payload: &T) -> Result<bool, ProtocolError> {
        let encoded = codec::encode(payload)?;
        Ok(self.inner.send_to(identity, &encoded))
    }

    /// Whether `identity` has a notification connection.
    #[must_use]
    pub fn contains(&self, identity: &str) -> bool {
        self.inner.contains(identity)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Outbound;
    use courier_protocol::FollowNotice;

    #[test]
    fn test_notify_registered_identity() {
        let hub = NotificationHub::new("notifications");
        let (handle, mut rx) = ConnectionHandle::channel(4);
        hub.add("bob", handle);

        let notice = FollowNotice {
            unread_notification_count: 3,
            sender: "alice".into(),
            receiver: "bob".into(),
        };
        assert!(hub.notify("bob", &notice).unwrap());

        let Outbound::Frame(bytes) = rx.try_recv().unwrap() else {
            panic!("expected a frame");
        };
        let decoded: FollowNotice = codec::decode(&bytes).unwrap();
        assert_eq!(decoded, notice);
    }

    #[test]
    fn test_notify_absent_identity() {
        let hub = NotificationHub::new("notifications");
        assert!(!hub.send_to("nobody", &Bytes::from_static(b"{}")));
    }

    #[test]
    fn test_remove_without_add() {
        let hub = NotificationHub::new("chat-notifications");
        let (handle, _rx) = ConnectionHandle::channel(4);
        assert!(!hub.remove(handle.id()));
        assert!(!hub.remove(handle.id()));
        assert!(hub.is_empty());
    }
}
