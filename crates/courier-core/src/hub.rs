//! Connection registries.
//!
//! Both hubs map an identity to at most one live connection. Sends copy their
//! targets out of the map before writing, so a slow peer never holds a shard
//! lock, and any failed write evicts the peer it was addressed to.

use crate::handle::{ConnectionHandle, ConnectionId};
use crate::message::Identity;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

/// Identity-keyed registry shared by [`ChatHub`] and
/// [`NotificationHub`](crate::notify::NotificationHub).
#[derive(Debug)]
pub(crate) struct Registry {
    name: &'static str,
    connections: DashMap<Identity, ConnectionHandle>,
    /// Reverse index so removal by connection id is a point lookup.
    owners: DashMap<ConnectionId, Identity>,
}

impl Registry {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            connections: DashMap::new(),
            owners: DashMap::new(),
        }
    }

    /// Register `handle` for `identity`, closing any connection it replaces.
    pub(crate) fn add(&self, identity: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let id = handle.id().clone();
        self.owners.insert(id.clone(), identity.to_string());
        let previous = self.connections.insert(identity.to_string(), handle);

        match &previous {
            Some(old) if old.id() != &id => {
                debug!(hub = self.name, user = %identity, old = %old.id(), new = %id, "Superseded connection");
                self.owners.remove(old.id());
                old.close();
            }
            _ => debug!(hub = self.name, user = %identity, connection = %id, "Registered"),
        }

        previous.filter(|old| old.id() != &id)
    }

    /// Remove whichever identity maps to this exact connection.
    pub(crate) fn remove(&self, connection_id: &ConnectionId) -> bool {
        let Some((_, identity)) = self.owners.remove(connection_id) else {
            return false;
        };

        let removed = self
            .connections
            .remove_if(&identity, |_, handle| handle.id() == connection_id)
            .is_some();

        if removed {
            debug!(hub = self.name, user = %identity, connection = %connection_id, "Unregistered");
        }
        removed
    }

    pub(crate) fn get(&self, identity: &str) -> Option<ConnectionHandle> {
        self.connections.get(identity).map(|h| h.value().clone())
    }

    pub(crate) fn send_to(&self, identity: &str, frame: &Bytes) -> bool {
        let Some(handle) = self.get(identity) else {
            trace!(hub = self.name, user = %identity, "No connection registered");
            return false;
        };

        match handle.send(frame.clone()) {
            Ok(()) => true,
            Err(e) => {
                warn!(hub = self.name, user = %identity, error = %e, "Send failed, evicting");
                self.evict(&handle);
                false
            }
        }
    }

    pub(crate) fn broadcast_except(&self, sender: Option<&ConnectionId>, frame: &Bytes) -> usize {
        let targets: Vec<(Identity, ConnectionHandle)> = self
            .connections
            .iter()
            .filter(|entry| Some(entry.value().id()) != sender)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut delivered = 0;
        for (identity, handle) in targets {
            match handle.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(hub = self.name, user = %identity, error = %e, "Broadcast send failed, evicting");
                    self.evict(&handle);
                }
            }
        }

        trace!(hub = self.name, recipients = delivered, "Broadcast");
        delivered
    }

    fn evict(&self, handle: &ConnectionHandle) {
        handle.close();
        self.remove(handle.id());
    }

    pub(crate) fn contains(&self, identity: &str) -> bool {
        self.connections.contains_key(identity)
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }
}

/// Registry of chat connections.
///
/// A user has one chat connection at a time, scoped to whichever room it was
/// opened for. Status broadcasts go to every registered chat connection so
/// other open views stay consistent.
#[derive(Debug)]
pub struct ChatHub {
    inner: Registry,
}

impl ChatHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Registry::new("chat"),
        }
    }

    /// Register a chat connection for `identity`.
    ///
    /// Last write wins: a previously registered connection is closed and
    /// returned.
    pub fn add(&self, identity: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.inner.add(identity, handle)
    }

    /// Unregister a connection. Returns `false` if it was never registered,
    /// already removed, or superseded.
    pub fn remove(&self, connection_id: &ConnectionId) -> bool {
        self.inner.remove(connection_id)
    }

    /// Best-effort unicast. Returns whether a live connection accepted the frame.
    pub fn send_to(&self, identity: &str, frame: &Bytes) -> bool {
        self.inner.send_to(identity, frame)
    }

    /// Send to every connection except `sender`. Returns the number reached.
    pub fn broadcast_except(&self, sender: Option<&ConnectionId>, frame: &Bytes) -> usize {
        self.inner.broadcast_except(sender, frame)
    }

    /// Send to every registered connection.
    pub fn broadcast(&self, frame: &Bytes) -> usize {
        self.inner.broadcast_except(None, frame)
    }

    /// The connection currently registered for `identity`.
    #[must_use]
    pub fn connection_id(&self, identity: &str) -> Option<ConnectionId> {
        self.inner.get(identity).map(|h| h.id().clone())
    }

    /// Whether `identity` has a chat connection.
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

impl Default for ChatHub {
    fn default() -> Self {
        Self::new()
    }
}
