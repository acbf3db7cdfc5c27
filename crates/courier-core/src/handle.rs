//! Connection handles.
//!
//! A handle is the registry-side view of one live socket: an id and a bounded
//! outbound queue drained by the connection's own worker. Registries only ever
//! hold handles, so removing an entry never has to coordinate with the socket.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

/// Default outbound queue depth per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", seconds, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Work item for a connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// An encoded frame to write.
    Frame(Bytes),
    /// Close the socket and stop serving.
    Close,
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The peer is not draining its queue.
    #[error("Outbound queue full")]
    Backpressure,

    /// The connection's worker is gone.
    #[error("Connection closed")]
    Closed,
}

#[derive(Debug, Default)]
struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

/// Resolves once any clone of the handle has called
/// [`ConnectionHandle::close`], even if the outbound queue was full at the
/// time.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    shutdown: Arc<Shutdown>,
}

impl CloseSignal {
    /// Wait for a close request.
    pub async fn closed(&self) {
        while !self.shutdown.requested.load(Ordering::Acquire) {
            self.shutdown.notify.notified().await;
        }
    }

    /// Whether close has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.shutdown.requested.load(Ordering::Acquire)
    }
}

/// Cloneable sending side of a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    shutdown: Arc<Shutdown>,
}

impl ConnectionHandle {
    /// Create a handle with a fresh id and the receiving side of its queue.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        Self::with_id(ConnectionId::generate(), capacity)
    }

    /// Create a handle with a known id.
    #[must_use]
    pub fn with_id(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            tx,
            shutdown: Arc::new(Shutdown::default()),
        };
        (handle, rx)
    }

    /// The connection's id.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue a frame without waiting.
    ///
    /// # Errors
    ///
    /// Fails if the queue is full or the worker has gone away. Both mean the
    /// peer should be treated as departed.
    pub fn send(&self, frame: Bytes) -> Result<(), SendError> {
        self.tx.try_send(Outbound::Frame(frame)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Ask the worker to close the socket. Idempotent.
    pub fn close(&self) {
        if !self.shutdown.requested.swap(true, Ordering::AcqRel) {
            self.shutdown.notify.notify_one();
        }
        let _ = self.tx.try_send(Outbound::Close);
    }

    /// Signal the worker selects on to notice [`close`](Self::close).
    #[must_use]
    pub fn close_signal(&self) -> CloseSignal {
        CloseSignal {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Whether the worker side has gone away or close was requested.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.shutdown.requested.load(Ordering::Acquire)
    }
}
