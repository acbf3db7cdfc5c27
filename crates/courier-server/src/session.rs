//! Per-connection workers.
//!
//! Every socket is served by one task running [`run`]: it is the only writer
//! to the socket, draining the connection's outbound queue, reading inbound
//! frames, and pinging on the heartbeat interval. The `serve_*` functions wrap
//! it with the registration and cleanup of each endpoint.

use crate::metrics::{self, ConnectionMetricsGuard};
use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{
    ActiveUserDirectory, ChatContext, CloseSignal, ConnectionHandle, ConnectionId, Messenger,
    NotificationHub, Outbound,
};
use courier_protocol::codec::LineCodec;
use courier_protocol::ClientMessage;
use courier_transport::{Connection, Received, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Worker settings shared by all endpoints.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub outbound_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            outbound_queue: courier_core::DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the socket.
    PeerClosed,
    /// A registry closed the connection (superseded or evicted).
    Closed,
    /// Writing to the socket failed.
    WriteFailed,
    /// Reading from the socket failed.
    ReadFailed,
    /// Nothing arrived within the heartbeat timeout.
    TimedOut,
}

/// Consumer of inbound data frames.
#[async_trait]
pub trait FrameHandler: Send {
    async fn on_frame(&mut self, data: Bytes);
}

/// Handler for endpoints whose inbound frames carry no meaning.
pub struct IgnoreFrames;

#[async_trait]
impl FrameHandler for IgnoreFrames {
    async fn on_frame(&mut self, _data: Bytes) {}
}

/// Submissions a chat connection may have queued before new ones are
/// dropped.
pub const SUBMIT_BACKLOG: usize = 64;

/// Decodes chat submissions and queues them for the connection's submitter
/// task, so a slow store never stalls the socket loop.
pub struct ChatFrames {
    ctx: ChatContext,
    connection: ConnectionId,
    codec: LineCodec,
    queue: mpsc::Sender<(ClientMessage, std::time::Instant)>,
    submitter: JoinHandle<()>,
}

impl ChatFrames {
    #[must_use]
    pub fn new(messenger: Arc<Messenger>, ctx: ChatContext, handle: ConnectionHandle) -> Self {
        Self::with_backlog(messenger, ctx, handle, SUBMIT_BACKLOG)
    }

    #[must_use]
    pub fn with_backlog(
        messenger: Arc<Messenger>,
        ctx: ChatContext,
        handle: ConnectionHandle,
        backlog: usize,
    ) -> Self {
        let (queue, mut pending) = mpsc::channel(backlog.max(1));
        let connection = handle.id().clone();
        let submit_ctx = ctx.clone();

        let submitter = tokio::spawn(async move {
            while let Some((incoming, received_at)) = pending.recv().await {
                submit(&messenger, &submit_ctx, &handle, incoming, received_at).await;
            }
        });

        Self {
            ctx,
            connection,
            codec: LineCodec::new(),
            queue,
            submitter,
        }
    }

    /// Stop taking frames and wait for queued submissions to complete.
    pub async fn finish(self) {
        drop(self.queue);
        if let Err(e) = self.submitter.await {
            error!(connection = %self.connection, error = %e, "Submitter task failed");
        }
    }
}

async fn submit(
    messenger: &Messenger,
    ctx: &ChatContext,
    handle: &ConnectionHandle,
    incoming: ClientMessage,
    received_at: std::time::Instant,
) {
    match messenger.submit(ctx, handle, incoming).await {
        Ok(Some(message)) => {
            metrics::record_message(message.status);
            metrics::record_latency(received_at.elapsed().as_secs_f64());
        }
        Ok(None) => metrics::record_dropped_frame("duplicate"),
        Err(e) => {
            error!(chat = %ctx.chat_id, user = %ctx.me, error = %e, "Message not processed");
            metrics::record_error("submit");
        }
    }
}

#[async_trait]
impl FrameHandler for ChatFrames {
    async fn on_frame(&mut self, data: Bytes) {
        let received_at = std::time::Instant::now();
        self.codec.push(&data);

        loop {
            let incoming = match self.codec.next_frame::<ClientMessage>() {
                Ok(Some(incoming)) => incoming,
                Ok(None) => break,
                Err(e) => {
                    warn!(connection = %self.connection, error = %e, "Dropped malformed frame");
                    metrics::record_dropped_frame("malformed");
                    continue;
                }
            };

            match self.queue.try_send((incoming, received_at)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(connection = %self.connection, chat = %self.ctx.chat_id, "Submission backlog full, dropped message");
                    metrics::record_dropped_frame("backlog");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connection = %self.connection, "Submitter gone, dropped message");
                    metrics::record_dropped_frame("closed");
                }
            }
        }
    }
}

/// Serve one socket until it ends.
pub async fn run<C, H>(
    conn: &mut C,
    handle: &ConnectionHandle,
    mut outlet: mpsc::Receiver<Outbound>,
    handler: &mut H,
    config: &SessionConfig,
) -> SessionEnd
where
    C: Connection,
    H: FrameHandler,
{
    let closing: CloseSignal = handle.close_signal();
    let mut heartbeat = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    let end = loop {
        tokio::select! {
            biased;

            _ = closing.closed() => break SessionEnd::Closed,

            outbound = outlet.recv() => match outbound {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = conn.send(frame).await {
                        debug!(connection = %handle.id(), error = %e, "Write failed");
                        break SessionEnd::WriteFailed;
                    }
                }
                Some(Outbound::Close) | None => break SessionEnd::Closed,
            },

            inbound = conn.recv() => match inbound {
                Ok(Some(Received::Data(data))) => {
                    last_seen = Instant::now();
                    handler.on_frame(data).await;
                }
                Ok(Some(Received::Pong)) => last_seen = Instant::now(),
                Ok(None) => break SessionEnd::PeerClosed,
                Err(e) if e.is_recoverable() => {
                    warn!(connection = %handle.id(), error = %e, "Dropped inbound frame");
                    metrics::record_dropped_frame("oversized");
                }
                Err(e) => {
                    warn!(connection = %handle.id(), error = %e, "Read failed");
                    metrics::record_error("websocket");
                    break SessionEnd::ReadFailed;
                }
            },

            _ = heartbeat.tick() => {
                if last_seen.elapsed() >= config.heartbeat_timeout {
                    break SessionEnd::TimedOut;
                }
                if let Err(e) = conn.ping().await {
                    debug!(connection = %handle.id(), error = %e, "Ping failed");
                    break SessionEnd::WriteFailed;
                }
            }
        }
    };

    if let Err(e) = conn.close().await {
        if !matches!(e, TransportError::ConnectionClosed) {
            debug!(connection = %handle.id(), error = %e, "Close failed");
        }
    }
    end
}

/// Serve a chat connection for `ctx.me` inside `ctx.chat_id`.
pub async fn serve_chat<C: Connection>(
    messenger: Arc<Messenger>,
    ctx: ChatContext,
    mut conn: C,
    config: SessionConfig,
) -> SessionEnd {
    let _metrics = ConnectionMetricsGuard::new("chat");
    let (handle, outlet) = ConnectionHandle::channel(config.outbound_queue);
    messenger.join(&ctx, handle.clone());
    info!(connection = %handle.id(), chat = %ctx.chat_id, user = %ctx.me, "Chat connected");

    let mut frames = ChatFrames::new(Arc::clone(&messenger), ctx.clone(), handle.clone());
    let end = run(&mut conn, &handle, outlet, &mut frames, &config).await;
    frames.finish().await;

    messenger.leave(&ctx, handle.id());
    info!(connection = %handle.id(), chat = %ctx.chat_id, user = %ctx.me, reason = ?end, "Chat disconnected");
    end
}

/// Serve a notification connection on `hub` for `identity`.
pub async fn serve_notifications<C: Connection>(
    messenger: Arc<Messenger>,
    hub: fn(&Messenger) -> &NotificationHub,
    identity: String,
    mut conn: C,
    config: SessionConfig,
) -> SessionEnd {
    let _metrics = ConnectionMetricsGuard::new("notifications");
    let (handle, outlet) = ConnectionHandle::channel(config.outbound_queue);
    hub(&messenger).add(&identity, handle.clone());
    debug!(connection = %handle.id(), user = %identity, "Notification connection registered");

    let end = run(&mut conn, &handle, outlet, &mut IgnoreFrames, &config).await;

    hub(&messenger).remove(handle.id());
    debug!(connection = %handle.id(), user = %identity, reason = ?end, "Notification connection closed");
    end
}

/// Serve an active-user feed connection for `identity`.
pub async fn serve_active_users<C: Connection>(
    directory: Arc<ActiveUserDirectory>,
    identity: String,
    profile_picture: String,
    mut conn: C,
    config: SessionConfig,
) -> SessionEnd {
    let _metrics = ConnectionMetricsGuard::new("active-users");
    let (handle, outlet) = ConnectionHandle::channel(config.outbound_queue);
    directory
        .connect(&identity, &profile_picture, handle.clone())
        .await;

    let end = run(&mut conn, &handle, outlet, &mut IgnoreFrames, &config).await;

    directory.disconnect(handle.id()).await;
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{MemoryStore, Store};
    use courier_protocol::{codec, ChatEvent, ChatFrame, MessageStatus};
    use std::sync::Mutex;

    /// Scripted connection: frames pushed into `inbound` are read, writes are
    /// recorded.
    struct MockConnection {
        inbound: mpsc::UnboundedReceiver<Received>,
        written: Arc<Mutex<Vec<Bytes>>>,
        pings: Arc<Mutex<usize>>,
        open: bool,
    }

    struct Script {
        inbound: mpsc::UnboundedSender<Received>,
        written: Arc<Mutex<Vec<Bytes>>>,
        pings: Arc<Mutex<usize>>,
    }

    impl Script {
        fn text(&self, s: &str) {
            self.inbound
                .send(Received::Data(Bytes::copy_from_slice(s.as_bytes())))
                .unwrap();
        }

        fn frames(&self) -> Vec<ChatFrame> {
            self.written
                .lock()
                .unwrap()
                .iter()
                .map(|b| codec::decode(b).unwrap())
                .collect()
        }
    }

    fn mock() -> (MockConnection, Script) {
        let (tx, rx) = mpsc::unbounded_channel();
        let written = Arc::new(Mutex::new(Vec::new()));
        let pings = Arc::new(Mutex::new(0));
        (
            MockConnection {
                inbound: rx,
                written: Arc::clone(&written),
                pings: Arc::clone(&pings),
                open: true,
            },
            Script {
                inbound: tx,
                written,
                pings,
            },
        )
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn recv(&mut self) -> Result<Option<Received>, TransportError> {
            Ok(self.inbound.recv().await)
        }

        async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
            if !self.open {
                return Err(TransportError::ConnectionClosed);
            }
            self.written.lock().unwrap().push(data);
            Ok(())
        }

        async fn ping(&mut self) -> Result<(), TransportError> {
            *self.pings.lock().unwrap() += 1;
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.open = false;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    async fn messenger() -> (Arc<Messenger>, Arc<MemoryStore>, String) {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(ActiveUserDirectory::default());
        let messenger = Arc::new(Messenger::new(store.clone(), directory));
        let chat = messenger.create_chat("alice", "bob").await.unwrap();
        (messenger, store, chat.chat_id)
    }

    #[tokio::test]
    async fn test_chat_session_submits_and_cleans_up() {
        let (messenger, store, chat_id) = messenger().await;
        let ctx = messenger.open_chat(&chat_id, "alice").await.unwrap();
        let (conn, script) = mock();

        let worker = tokio::spawn(serve_chat(
            Arc::clone(&messenger),
            ctx,
            conn,
            SessionConfig::default(),
        ));

        script.text(r#"{"message":"hi"}"#);
        script.text("not json");
        script.text("{\"message\":\"one\"}\n{\"message\":\"two\"}\n");
        // Three acks and three echoes.
        while script.written.lock().unwrap().len() < 6 {
            tokio::task::yield_now().await;
        }
        drop(script.inbound);

        assert_eq!(worker.await.unwrap(), SessionEnd::PeerClosed);

        let history = store.history(&chat_id, "bob", 10, 0).await.unwrap();
        let bodies: Vec<_> = history.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["hi", "one", "two"]);

        let frames: Vec<ChatFrame> = script
            .written
            .lock()
            .unwrap()
            .iter()
            .map(|b| codec::decode(b).unwrap())
            .collect();
        assert!(matches!(
            frames[0],
            ChatFrame::Event(ChatEvent::MessageId {
                status: MessageStatus::Sent,
                ..
            })
        ));
        assert_eq!(frames.len(), 6);

        assert!(!messenger.presence().is_present(&chat_id, "alice"));
        assert!(messenger.chat_hub().is_empty());
    }

    #[tokio::test]
    async fn test_full_backlog_drops_instead_of_blocking() {
        let (messenger, store, chat_id) = messenger().await;
        let ctx = messenger.open_chat(&chat_id, "alice").await.unwrap();
        let (handle, _outlet) = ConnectionHandle::channel(64);
        let mut frames = ChatFrames::with_backlog(Arc::clone(&messenger), ctx, handle, 4);

        let lines: String = (0..6).map(|i| format!("{{\"message\":\"m{i}\"}}\n")).collect();
        // The submitter has not run yet, so only the backlog fits.
        frames.on_frame(Bytes::from(lines)).await;

        frames.finish().await;
        let bodies: Vec<_> = store
            .history(&chat_id, "alice", 10, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["m0", "m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_outbound_frames_are_written() {
        let (messenger, _store, chat_id) = messenger().await;
        let ctx = messenger.open_chat(&chat_id, "bob").await.unwrap();
        let (conn, script) = mock();

        let worker = tokio::spawn(serve_chat(
            Arc::clone(&messenger),
            ctx,
            conn,
            SessionConfig::default(),
        ));
        while !messenger.chat_hub().contains("bob") {
            tokio::task::yield_now().await;
        }

        messenger.delete_chat(&chat_id, "alice").await.unwrap();
        while script.written.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            script.frames(),
            vec![ChatFrame::Event(ChatEvent::ChatDeleted { chat_id })]
        );

        drop(script.inbound);
        assert_eq!(worker.await.unwrap(), SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_close_signal_ends_session() {
        let (mut conn, _script) = mock();
        let (handle, outlet) = ConnectionHandle::channel(1);
        handle.send(Bytes::from_static(b"{}")).unwrap();
        handle.close();

        let end = run(
            &mut conn,
            &handle,
            outlet,
            &mut IgnoreFrames,
            &SessionConfig::default(),
        )
        .await;
        assert_eq!(end, SessionEnd::Closed);
        assert!(!conn.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout() {
        let (mut conn, script) = mock();
        let (handle, outlet) = ConnectionHandle::channel(4);
        let config = SessionConfig {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(25),
            outbound_queue: 4,
        };

        let end = run(&mut conn, &handle, outlet, &mut IgnoreFrames, &config).await;
        assert_eq!(end, SessionEnd::TimedOut);
        assert_eq!(*script.pings.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_session_alive() {
        let (mut conn, script) = mock();
        let (handle, outlet) = ConnectionHandle::channel(4);
        let config = SessionConfig {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(25),
            outbound_queue: 4,
        };

        let feeder = tokio::spawn(async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_secs(10)).await;
                script.inbound.send(Received::Pong).unwrap();
            }
            script
        });

        let end = run(&mut conn, &handle, outlet, &mut IgnoreFrames, &config).await;
        assert_eq!(end, SessionEnd::TimedOut);
        let script = feeder.await.unwrap();
        assert!(*script.pings.lock().unwrap() >= 5);
    }

    #[tokio::test]
    async fn test_notification_session_registers_and_removes() {
        let (messenger, _store, _chat_id) = messenger().await;
        let (conn, script) = mock();

        let worker = tokio::spawn(serve_notifications(
            Arc::clone(&messenger),
            Messenger::notifications,
            "bob".to_string(),
            conn,
            SessionConfig::default(),
        ));
        while !messenger.notifications().contains("bob") {
            tokio::task::yield_now().await;
        }

        assert!(messenger.notify_follow("alice", "bob").await.unwrap());
        while script.written.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        drop(script.inbound);
        assert_eq!(worker.await.unwrap(), SessionEnd::PeerClosed);
        assert!(!messenger.notifications().contains("bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_user_session_enters_grace_on_close() {
        let directory = Arc::new(ActiveUserDirectory::new(Duration::from_secs(300)));
        let (conn, script) = mock();

        let worker = tokio::spawn(serve_active_users(
            Arc::clone(&directory),
            "alice".to_string(),
            String::new(),
            conn,
            SessionConfig::default(),
        ));
        while !directory.is_reachable("alice").await {
            tokio::task::yield_now().await;
        }

        drop(script.inbound);
        assert_eq!(worker.await.unwrap(), SessionEnd::PeerClosed);
        let entry = directory.entry("alice").await.unwrap();
        assert!(entry.active);
        assert!(entry.becoming_inactive);
    }
}
