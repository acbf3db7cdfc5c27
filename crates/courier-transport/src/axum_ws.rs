//! [`Connection`] over a socket upgraded by axum.

use crate::traits::{check_size, Connection, Received, TransportError};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use std::net::SocketAddr;
use tracing::{debug, warn};

/// A WebSocket accepted through `axum::extract::ws::WebSocketUpgrade`.
pub struct AxumConnection {
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    open: bool,
    max_message_size: usize,
}

impl AxumConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, max_message_size: usize) -> Self {
        Self {
            socket,
            remote_addr: None,
            open: true,
            max_message_size,
        }
    }

    /// Record the peer address for logging.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

#[async_trait]
impl Connection for AxumConnection {
    async fn recv(&mut self) -> Result<Option<Received>, TransportError> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => {
                    check_size(text.len(), self.max_message_size)?;
                    return Ok(Some(Received::Data(Bytes::from(text))));
                }
                Some(Ok(Message::Binary(data))) => {
                    check_size(data.len(), self.max_message_size)?;
                    return Ok(Some(Received::Data(Bytes::from(data))));
                }
                // Pongs to client pings are queued by the socket itself.
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Pong(_))) => return Ok(Some(Received::Pong)),
                Some(Ok(Message::Close(_))) | None => {
                    debug!("WebSocket closed by peer");
                    self.open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket read failed");
                    self.open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match String::from_utf8(data.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.socket
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        self.socket
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.open, false) {
            return Ok(());
        }
        self.socket
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {e}")))
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
