//! [`Connection`] over a tokio-tungstenite stream.
//!
//! Serves both directions: accepted server sockets and client sockets opened
//! with [`TungsteniteConnection::connect`], which the server's end-to-end
//! tests drive.

use crate::traits::{check_size, Connection, Received, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};

/// Default maximum message size (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// A WebSocket connection backed by tokio-tungstenite.
pub struct TungsteniteConnection<S> {
    stream: WebSocketStream<S>,
    open: bool,
    max_message_size: usize,
}

impl<S> TungsteniteConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established stream.
    #[must_use]
    pub fn new(stream: WebSocketStream<S>, max_message_size: usize) -> Self {
        Self {
            stream,
            open: true,
            max_message_size,
        }
    }
}

impl TungsteniteConnection<MaybeTlsStream<TcpStream>> {
    /// Open a client connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connect or the handshake fails.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Other(format!("WebSocket handshake failed: {e}")))?;
        debug!(url, status = %response.status(), "WebSocket client connected");
        Ok(Self::new(stream, DEFAULT_MAX_MESSAGE_SIZE))
    }
}

#[async_trait]
impl<S> Connection for TungsteniteConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Received>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    check_size(text.len(), self.max_message_size)?;
                    return Ok(Some(Received::Data(Bytes::from(text))));
                }
                Some(Ok(Message::Binary(data))) => {
                    check_size(data.len(), self.max_message_size)?;
                    return Ok(Some(Received::Data(Bytes::from(data))));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Pong(_))) => return Ok(Some(Received::Pong)),
                Some(Ok(Message::Close(_))) | Some(Err(WsError::ConnectionClosed)) | None => {
                    debug!("WebSocket stream ended");
                    self.open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!(error = %e, "WebSocket error");
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
        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.open, false) {
            return Ok(());
        }
        if let Err(e) = self.stream.close(None).await {
            warn!(error = %e, "Failed to close WebSocket cleanly");
            return Err(TransportError::Other(format!("Failed to close: {e}")));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair() -> (
        TungsteniteConnection<tokio::io::DuplexStream>,
        TungsteniteConnection<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (
            TungsteniteConnection::new(server, 1024),
            TungsteniteConnection::new(client, 1024),
        )
    }

    #[tokio::test]
    async fn test_text_roundtrip() {
        let (mut server, mut client) = pair().await;
        client.send(Bytes::from_static(br#"{"message":"hi"}"#)).await.unwrap();

        let received = server.recv().await.unwrap();
        assert_eq!(
            received,
            Some(Received::Data(Bytes::from_static(br#"{"message":"hi"}"#)))
        );
    }

    #[tokio::test]
    async fn test_oversized_message_is_recoverable() {
        let (mut server, mut client) = pair().await;
        client.send(Bytes::from(vec![b'a'; 2048])).await.unwrap();
        client.send(Bytes::from_static(b"ok")).await.unwrap();

        let err = server.recv().await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(
            server.recv().await.unwrap(),
            Some(Received::Data(Bytes::from_static(b"ok")))
        );
    }

    #[tokio::test]
    async fn test_close_is_observed() {
        let (mut server, mut client) = pair().await;
        client.close().await.unwrap();
        assert!(!client.is_open());
        assert!(client.send(Bytes::from_static(b"late")).await.is_err());

        assert_eq!(server.recv().await.unwrap(), None);
        assert!(!server.is_open());
    }
}
