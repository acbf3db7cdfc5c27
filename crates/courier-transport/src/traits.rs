//! Transport abstraction traits for Courier.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The peer sent something unusable. The connection itself is fine.
    #[error("Protocol error: {0}")]
    Protocol(#[from] courier_protocol::ProtocolError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the connection can keep serving after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Protocol(_))
    }
}

/// What a read produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A data message, text or binary.
    Data(Bytes),
    /// A heartbeat reply.
    Pong,
}

/// An active bidirectional socket to one client.
#[async_trait]
pub trait Connection: Send {
    /// Wait for the next message.
    ///
    /// Returns `None` if the peer closed cleanly. Must be cancel-safe: the
    /// worker races it against its outbound queue.
    async fn recv(&mut self) -> Result<Option<Received>, TransportError>;

    /// Write one encoded frame.
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Send a heartbeat ping.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}

/// Reject payloads above `max` bytes.
pub(crate) fn check_size(len: usize, max: usize) -> Result<(), TransportError> {
    if len > max {
        Err(courier_protocol::ProtocolError::FrameTooLarge(len).into())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_size() {
        assert!(check_size(10, 10).is_ok());
        let err = check_size(11, 10).unwrap_err();
        assert!(err.is_recoverable());
        assert!(!TransportError::ConnectionClosed.is_recoverable());
    }
}
