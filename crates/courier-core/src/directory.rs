//! Global presence: who is online at all.
//!
//! The directory owns the active-user feed connections and one
//! [`ActiveUserEntry`] per identity it has seen. Both live under a single
//! lock, so the grace-window check-then-act can never interleave with a
//! reconnect.
//!
//! Closing the last feed connection of an identity does not take it offline
//! straight away. The entry is flagged `becoming_inactive` and a timer is
//! scheduled; only if nothing reconnected when it fires does the identity go
//! inactive. Every disconnect bumps the entry's epoch, so a timer left over
//! from an earlier disconnect is ignored.

use crate::handle::{ConnectionHandle, ConnectionId};
use crate::message::Identity;
use chrono::{DateTime, Utc};
use courier_protocol::{codec, ActiveUser};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Default grace window between the last disconnect and going inactive.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(300);

const EVENT_CAPACITY: usize = 256;

/// Reachability changes observed by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// The identity became reachable.
    Online(Identity),
    /// The identity went inactive.
    Offline(Identity),
}

/// Presence record of one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveUserEntry {
    pub identity: Identity,
    pub active: bool,
    /// `None` while active.
    pub last_active_at: Option<DateTime<Utc>>,
    pub becoming_inactive: bool,
    pub profile_picture: String,
    #[serde(skip)]
    epoch: u64,
}

impl ActiveUserEntry {
    fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            active: false,
            last_active_at: None,
            becoming_inactive: false,
            profile_picture: String::new(),
            epoch: 0,
        }
    }

    /// Active and not inside a grace window.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.active && !self.becoming_inactive
    }

    fn mark_active(&mut self, profile_picture: &str) -> bool {
        let was_reachable = self.is_reachable();
        self.active = true;
        self.last_active_at = None;
        self.becoming_inactive = false;
        self.epoch += 1;
        if !profile_picture.is_empty() {
            self.profile_picture = profile_picture.to_string();
        }
        !was_reachable
    }

    fn mark_inactive(&mut self) {
        self.active = false;
        self.becoming_inactive = false;
        self.last_active_at = Some(Utc::now());
        self.epoch += 1;
    }
}

#[derive(Debug)]
struct FeedConnection {
    identity: Identity,
    handle: ConnectionHandle,
}

#[derive(Debug, Default)]
struct State {
    connections: HashMap<ConnectionId, FeedConnection>,
    /// Open feed connections per identity.
    per_identity: HashMap<Identity, usize>,
    entries: HashMap<Identity, ActiveUserEntry>,
}

impl State {
    fn has_connection(&self, identity: &str) -> bool {
        self.per_identity.contains_key(identity)
    }

    fn attach(&mut self, id: ConnectionId, conn: FeedConnection) {
        *self.per_identity.entry(conn.identity.clone()).or_default() += 1;
        if let Some(replaced) = self.connections.insert(id, conn) {
            self.detach_identity(&replaced.identity);
        }
    }

    fn detach(&mut self, connection_id: &ConnectionId) -> Option<FeedConnection> {
        let conn = self.connections.remove(connection_id)?;
        self.detach_identity(&conn.identity);
        Some(conn)
    }

    fn detach_identity(&mut self, identity: &str) {
        if let Some(count) = self.per_identity.get_mut(identity) {
            *count -= 1;
            if *count == 0 {
                self.per_identity.remove(identity);
            }
        }
    }

    fn active_users_for(&self, identity: &str) -> Vec<ActiveUser> {
        let mut users: Vec<_> = self
            .entries
            .values()
            .filter(|entry| entry.active && entry.identity != identity)
            .map(|entry| ActiveUser::new(entry.identity.clone(), entry.profile_picture.clone()))
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    /// Push each feed connection its own list. Returns connections whose
    /// write failed.
    fn broadcast(&self) -> Vec<ConnectionId> {
        let mut failed = Vec::new();
        for (id, conn) in &self.connections {
            let frame = match codec::encode(&self.active_users_for(&conn.identity)) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(connection = %id, error = %e, "Failed to encode active users");
                    continue;
                }
            };
            if let Err(e) = conn.handle.send(frame) {
                debug!(connection = %id, user = %conn.identity, error = %e, "Active-user write failed");
                failed.push(id.clone());
            }
        }
        failed
    }

    /// Drop a feed connection. Returns the identity and epoch to schedule a
    /// grace timer for when it was the identity's last one.
    fn release(&mut self, connection_id: &ConnectionId) -> Option<(Identity, u64)> {
        let conn = self.detach(connection_id)?;
        conn.handle.close();

        if self.has_connection(&conn.identity) {
            return None;
        }

        let entry = self.entries.get_mut(&conn.identity)?;
        if !entry.active {
            return None;
        }
        entry.becoming_inactive = true;
        entry.epoch += 1;
        Some((conn.identity, entry.epoch))
    }
}

/// Process-wide active-user directory.
#[derive(Debug)]
pub struct ActiveUserDirectory {
    state: Mutex<State>,
    grace: Duration,
    events: broadcast::Sender<PresenceEvent>,
}

impl ActiveUserDirectory {
    /// Create a directory with the given grace window.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            grace,
            events,
        }
    }

    /// The configured grace window.
    #[must_use]
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Subscribe to reachability changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    /// Register a feed connection and mark its identity active.
    pub async fn connect(
        self: &Arc<Self>,
        identity: &str,
        profile_picture: &str,
        handle: ConnectionHandle,
    ) {
        let id = handle.id().clone();
        let (came_online, timers) = {
            let mut state = self.state.lock().await;
            state.attach(
                id.clone(),
                FeedConnection {
                    identity: identity.to_string(),
                    handle,
                },
            );
            let came_online = state
                .entries
                .entry(identity.to_string())
                .or_insert_with(|| ActiveUserEntry::new(identity))
                .mark_active(profile_picture);
            (came_online, self.broadcast_locked(&mut state))
        };

        info!(user = %identity, connection = %id, "Active-user feed connected");
        if came_online {
            self.emit(PresenceEvent::Online(identity.to_string()));
        }
        self.schedule(timers);
    }

    /// Deregister a feed connection. If it was the identity's last one, the
    /// identity enters its grace window. Returns `false` for unknown
    /// connections.
    pub async fn disconnect(self: &Arc<Self>, connection_id: &ConnectionId) -> bool {
        let (known, timer) = {
            let mut state = self.state.lock().await;
            let known = state.connections.contains_key(connection_id);
            (known, state.release(connection_id))
        };

        if known {
            debug!(connection = %connection_id, "Active-user feed disconnected");
        }
        self.schedule(timer.into_iter().collect());
        known
    }

    /// Grace-window check for the disconnect that produced `epoch`. Returns
    /// `true` if the identity went inactive.
    pub async fn expire(self: &Arc<Self>, identity: &str, epoch: u64) -> bool {
        let timers = {
            let mut state = self.state.lock().await;
            let reconnected = state.has_connection(identity);

            let Some(entry) = state.entries.get_mut(identity) else {
                return false;
            };
            if entry.epoch != epoch || !entry.active {
                return false;
            }
            if reconnected {
                entry.becoming_inactive = false;
                return false;
            }

            entry.mark_inactive();
            self.broadcast_locked(&mut state)
        };

        info!(user = %identity, "Grace window elapsed, user inactive");
        self.emit(PresenceEvent::Offline(identity.to_string()));
        self.schedule(timers);
        true
    }

    /// Mark an identity active without a feed connection (login).
    pub async fn activate(self: &Arc<Self>, identity: &str, profile_picture: &str) {
        let (came_online, timers) = {
            let mut state = self.state.lock().await;
            let came_online = state
                .entries
                .entry(identity.to_string())
                .or_insert_with(|| ActiveUserEntry::new(identity))
                .mark_active(profile_picture);
            (came_online, self.broadcast_locked(&mut state))
        };

        if came_online {
            self.emit(PresenceEvent::Online(identity.to_string()));
        }
        self.schedule(timers);
    }

    /// Take an identity offline immediately, skipping the grace window.
    pub async fn logout(self: &Arc<Self>, identity: &str) -> bool {
        let timers = {
            let mut state = self.state.lock().await;
            match state.entries.get_mut(identity) {
                Some(entry) if entry.active => entry.mark_inactive(),
                _ => return false,
            }
            self.broadcast_locked(&mut state)
        };

        info!(user = %identity, "Logged out");
        self.emit(PresenceEvent::Offline(identity.to_string()));
        self.schedule(timers);
        true
    }

    /// Active identities other than `identity`, sorted by username.
    pub async fn active_users_for(&self, identity: &str) -> Vec<ActiveUser> {
        self.state.lock().await.active_users_for(identity)
    }

    /// Snapshot of an identity's presence record.
    pub async fn entry(&self, identity: &str) -> Option<ActiveUserEntry> {
        self.state.lock().await.entries.get(identity).cloned()
    }

    /// Whether `identity` is active and not in a grace window.
    pub async fn is_reachable(&self, identity: &str) -> bool {
        self.state
            .lock()
            .await
            .entries
            .get(identity)
            .is_some_and(ActiveUserEntry::is_reachable)
    }

    /// Number of open feed connections.
    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    fn broadcast_locked(&self, state: &mut State) -> Vec<(Identity, u64)> {
        state
            .broadcast()
            .iter()
            .filter_map(|id| state.release(id))
            .collect()
    }

    fn schedule(self: &Arc<Self>, timers: Vec<(Identity, u64)>) {
        for (identity, epoch) in timers {
            debug!(user = %identity, epoch, grace_secs = self.grace.as_secs(), "Grace window started");
            let directory = Arc::clone(self);
            let grace = self.grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                directory.expire(&identity, epoch).await;
            });
        }
    }

    fn emit(&self, event: PresenceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for ActiveUserDirectory {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Outbound;
    use tokio::sync::mpsc;

    const GRACE: Duration = Duration::from_secs(300);

    fn directory() -> Arc<ActiveUserDirectory> {
        Arc::new(ActiveUserDirectory::new(GRACE))
    }

    fn feed(id: &str) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        ConnectionHandle::with_id(ConnectionId::new(id), 16)
    }

    fn last_list(rx: &mut mpsc::Receiver<Outbound>) -> Option<Vec<String>> {
        let mut last = None;
        while let Ok(Outbound::Frame(frame)) = rx.try_recv() {
            let users: Vec<ActiveUser> = codec::decode(&frame).unwrap();
            last = Some(users.into_iter().map(|u| u.username).collect());
        }
        last
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_broadcasts_lists_without_self() {
        let dir = directory();
        let (alice, mut alice_rx) = feed("a1");
        let (bob, mut bob_rx) = feed("b1");

        dir.connect("alice", "", alice).await;
        assert_eq!(last_list(&mut alice_rx), Some(vec![]));

        dir.connect("bob", "https://img/b.png", bob).await;
        assert_eq!(last_list(&mut alice_rx), Some(vec!["bob".to_string()]));
        assert_eq!(last_list(&mut bob_rx), Some(vec!["alice".to_string()]));

        let users = dir.active_users_for("alice").await;
        assert_eq!(users, vec![ActiveUser::new("bob", "https://img/b.png")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_enters_grace_window() {
        let dir = directory();
        let (alice, _alice_rx) = feed("a1");
        dir.connect("alice", "", alice).await;

        assert!(dir.disconnect(&ConnectionId::new("a1")).await);
        let entry = dir.entry("alice").await.unwrap();
        assert!(entry.active);
        assert!(entry.becoming_inactive);
        assert!(!dir.is_reachable("alice").await);

        assert!(!dir.disconnect(&ConnectionId::new("a1")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_window_expiry() {
        let dir = directory();
        let mut events = dir.subscribe();
        let (alice, _alice_rx) = feed("a1");
        let (bob, mut bob_rx) = feed("b1");
        dir.connect("alice", "", alice).await;
        dir.connect("bob", "", bob).await;
        last_list(&mut bob_rx);

        dir.disconnect(&ConnectionId::new("a1")).await;
        tokio::time::sleep(GRACE + Duration::from_secs(1)).await;

        let entry = dir.entry("alice").await.unwrap();
        assert!(!entry.active);
        assert!(!entry.becoming_inactive);
        assert!(entry.last_active_at.is_some());
        assert_eq!(last_list(&mut bob_rx), Some(vec![]));

        let mut offline = false;
        while let Ok(event) = events.try_recv() {
            offline |= event == PresenceEvent::Offline("alice".into());
        }
        assert!(offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_grace_never_goes_inactive() {
        let dir = directory();
        let (alice, _rx1) = feed("a1");
        let (bob, mut bob_rx) = feed("b1");
        dir.connect("alice", "", alice).await;
        dir.connect("bob", "", bob).await;
        last_list(&mut bob_rx);

        dir.disconnect(&ConnectionId::new("a1")).await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        let (again, _rx2) = feed("a2");
        dir.connect("alice", "", again).await;
        tokio::time::sleep(GRACE * 2).await;

        let entry = dir.entry("alice").await.unwrap();
        assert!(entry.is_reachable());
        assert!(entry.last_active_at.is_none());

        while let Some(list) = last_list(&mut bob_rx) {
            assert_eq!(list, vec!["alice".to_string()]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_is_ignored() {
        let dir = directory();
        let (first, _rx1) = feed("a1");
        dir.connect("alice", "", first).await;
        dir.disconnect(&ConnectionId::new("a1")).await;

        tokio::time::sleep(Duration::from_secs(100)).await;
        let (second, _rx2) = feed("a2");
        dir.connect("alice", "", second).await;
        tokio::time::sleep(Duration::from_secs(100)).await;
        dir.disconnect(&ConnectionId::new("a2")).await;

        // First timer fires at 300s; it belongs to a superseded disconnect.
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert!(dir.entry("alice").await.unwrap().active);

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(!dir.entry("alice").await.unwrap().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_tab_keeps_identity_reachable() {
        let dir = directory();
        let (tab1, _rx1) = feed("a1");
        let (tab2, _rx2) = feed("a2");
        dir.connect("alice", "", tab1).await;
        dir.connect("alice", "", tab2).await;

        dir.disconnect(&ConnectionId::new("a1")).await;
        assert!(dir.is_reachable("alice").await);
        assert_eq!(dir.connection_count().await, 1);
        assert_eq!(dir.state.lock().await.per_identity.get("alice"), Some(&1));

        dir.disconnect(&ConnectionId::new("a2")).await;
        assert!(dir.entry("alice").await.unwrap().becoming_inactive);
        assert!(dir.state.lock().await.per_identity.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_is_immediate() {
        let dir = directory();
        let mut events = dir.subscribe();
        dir.activate("alice", "").await;
        assert_eq!(events.try_recv().unwrap(), PresenceEvent::Online("alice".into()));

        assert!(dir.logout("alice").await);
        assert_eq!(events.try_recv().unwrap(), PresenceEvent::Offline("alice".into()));
        assert!(!dir.entry("alice").await.unwrap().active);
        assert!(!dir.logout("alice").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_evicts_feed_connection() {
        let dir = directory();
        let (alice, alice_rx) = feed("a1");
        dir.connect("alice", "", alice).await;
        drop(alice_rx);

        let (bob, _bob_rx) = feed("b1");
        dir.connect("bob", "", bob).await;

        assert_eq!(dir.connection_count().await, 1);
        assert!(dir.entry("alice").await.unwrap().becoming_inactive);
    }
}
