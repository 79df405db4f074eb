use super::PhoenixOptions;
use super::channel::PhoenixChannel;
use super::connection::ConnectionManager;
use super::heartbeat::HeartbeatManager;
use super::message::{PhoenixMessage, Reply};
use crate::infrastructure::TaskManager;
use crate::types::{PHOENIX_TOPIC, RealtimeError, Result, TransportError, phoenix_events};
use futures::StreamExt;
use futures::stream::SplitStream;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

type SocketReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared state behind a [`PhoenixTransport`](super::PhoenixTransport):
/// the socket, joined channels by topic, and in-flight requests by ref.
pub(crate) struct Socket {
    url: Url,
    pub(crate) options: PhoenixOptions,
    connection: ConnectionManager,
    connect_lock: tokio::sync::Mutex<()>,
    channels: Mutex<HashMap<String, Arc<PhoenixChannel>>>,
    replies: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    ref_counter: AtomicU64,
    pending_heartbeat: Mutex<Option<String>>,
    tasks: Mutex<TaskManager>,
}

impl Socket {
    pub fn new(url: Url, options: PhoenixOptions) -> Self {
        Self {
            url,
            options,
            connection: ConnectionManager::new(),
            connect_lock: tokio::sync::Mutex::new(()),
            channels: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
            ref_counter: AtomicU64::new(0),
            pending_heartbeat: Mutex::new(None),
            tasks: Mutex::new(TaskManager::new()),
        }
    }

    pub fn make_ref(&self) -> String {
        (self.ref_counter.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.options.timeout_ms)
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        lock(&self.tasks).spawn(future);
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    pub async fn is_session_open(&self, session: u64) -> bool {
        self.connection.is_session_open(session).await
    }

    /// Opens the socket unless it is already open. Concurrent callers wait
    /// for the same attempt.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.connection.is_connected().await {
            return Ok(());
        }

        self.connection.set_connecting().await;
        tracing::info!(
            "Connecting to {}",
            self.url.host_str().unwrap_or("realtime endpoint")
        );

        let ws_stream = match tokio::time::timeout(self.timeout(), connect_async(self.url.as_str()))
            .await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                self.connection.abort_connecting().await;
                return Err(e.into());
            }
            Err(_) => {
                self.connection.abort_connecting().await;
                return Err(RealtimeError::Timeout);
            }
        };

        let (write_half, read_half) = ws_stream.split();
        let session = self.connection.open(write_half).await;
        *lock(&self.pending_heartbeat) = None;

        self.spawn_reader(session, read_half);
        let heartbeat = HeartbeatManager::new(Arc::downgrade(self), session)
            .with_interval(Duration::from_millis(self.options.heartbeat_interval_ms));
        self.spawn(heartbeat.run());

        tracing::info!("Connected to WebSocket server (session {})", session);
        Ok(())
    }

    fn spawn_reader(self: &Arc<Self>, session: u64, mut read_half: SocketReader) {
        let weak = Arc::downgrade(self);
        self.spawn(async move {
            tracing::info!("Starting read task");
            let reason = loop {
                let Some(frame) = read_half.next().await else {
                    break "socket stream ended".to_string();
                };
                let Some(socket) = weak.upgrade() else {
                    return;
                };

                match frame {
                    Ok(Message::Text(text)) => {
                        tracing::debug!("Received text message: {}", text);
                        match serde_json::from_str::<PhoenixMessage>(&text) {
                            Ok(message) => socket.route(message),
                            Err(e) => {
                                tracing::error!("Failed to parse message: {} - Raw: {}", e, text)
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        break match frame {
                            Some(close_frame) => format!(
                                "server closed connection: code={:?}, reason='{}'",
                                close_frame.code, close_frame.reason
                            ),
                            None => "server closed connection without close frame".to_string(),
                        };
                    }
                    Ok(Message::Ping(data)) => {
                        tracing::debug!("Received ping ({} bytes)", data.len());
                    }
                    Ok(Message::Pong(data)) => {
                        tracing::debug!("Received pong ({} bytes)", data.len());
                    }
                    Ok(Message::Binary(data)) => {
                        tracing::warn!("Received unexpected binary message ({} bytes)", data.len());
                    }
                    Ok(Message::Frame(_)) => {
                        tracing::debug!("Received raw frame (internal)");
                    }
                    Err(e) => break format!("WebSocket read error: {e}"),
                }
            };

            if let Some(socket) = weak.upgrade() {
                socket.connection_lost(session, &reason).await;
            }
            tracing::info!("Read task finished");
        });
    }

    /// Dispatches an inbound frame to the waiting request or to its channel.
    pub(crate) fn route(&self, message: PhoenixMessage) {
        if message.event == phoenix_events::REPLY {
            if message.topic == PHOENIX_TOPIC {
                self.handle_heartbeat_ack(&message);
                return;
            }
            if let Some(msg_ref) = &message.r#ref
                && let Some(waiter) = lock(&self.replies).remove(msg_ref)
            {
                if waiter.send(Reply::from_payload(&message.payload)).is_err() {
                    tracing::debug!("Reply for ref {} arrived after its waiter left", msg_ref);
                }
                return;
            }
        }

        let channel = lock(&self.channels).get(&message.topic).cloned();
        match channel {
            Some(channel) => channel.handle_message(message),
            None => tracing::debug!(
                "Dropping {} for unknown topic {}",
                message.event,
                message.topic
            ),
        }
    }

    fn handle_heartbeat_ack(&self, message: &PhoenixMessage) {
        let mut pending = lock(&self.pending_heartbeat);
        if message.r#ref.is_some() && *pending == message.r#ref {
            tracing::debug!("Received heartbeat ack for ref {:?}", message.r#ref);
            *pending = None;
        }
    }

    pub fn pending_heartbeat(&self) -> Option<String> {
        lock(&self.pending_heartbeat).clone()
    }

    pub fn set_pending_heartbeat(&self, heartbeat_ref: Option<String>) {
        *lock(&self.pending_heartbeat) = heartbeat_ref;
    }

    /// Writes a frame without waiting for a reply
    pub async fn push(&self, message: &PhoenixMessage) -> Result<()> {
        self.connection.send_message(message).await
    }

    /// Writes a frame and waits for the matching `phx_reply`.
    ///
    /// # Errors
    ///
    /// - [`RealtimeError::Timeout`] if no reply arrives within the push timeout
    /// - [`RealtimeError::Connection`] if the socket drops while waiting
    pub async fn request(&self, mut message: PhoenixMessage) -> Result<Reply> {
        let msg_ref = match &message.r#ref {
            Some(msg_ref) => msg_ref.clone(),
            None => {
                let msg_ref = self.make_ref();
                message.r#ref = Some(msg_ref.clone());
                msg_ref
            }
        };

        let (tx, rx) = oneshot::channel();
        lock(&self.replies).insert(msg_ref.clone(), tx);

        if let Err(e) = self.push(&message).await {
            lock(&self.replies).remove(&msg_ref);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout(), rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RealtimeError::Connection(
                "connection lost before reply".to_string(),
            )),
            Err(_) => {
                lock(&self.replies).remove(&msg_ref);
                Err(RealtimeError::Timeout)
            }
        }
    }

    pub fn register(&self, channel: Arc<PhoenixChannel>) {
        let topic = channel.topic().to_string();
        if let Some(previous) = lock(&self.channels).insert(topic.clone(), channel) {
            tracing::debug!("Replaced channel registration for {}", previous.topic());
        }
    }

    /// Forgets `channel` unless the topic was taken over by another instance.
    pub fn unregister(&self, channel: &Arc<PhoenixChannel>) {
        let mut channels = lock(&self.channels);
        if let Some(current) = channels.get(channel.topic())
            && Arc::ptr_eq(current, channel)
        {
            channels.remove(channel.topic());
        }
    }

    fn channels_snapshot(&self) -> Vec<Arc<PhoenixChannel>> {
        lock(&self.channels).values().cloned().collect()
    }

    /// Tears down a session that failed underneath us and reports every
    /// active channel as errored. No-op for stale sessions.
    pub async fn connection_lost(&self, session: u64, reason: &str) {
        if !self.connection.close_session(session).await {
            return;
        }
        tracing::warn!("Connection lost: {}", reason);

        *lock(&self.pending_heartbeat) = None;
        lock(&self.replies).clear();

        let error = TransportError::new("connection lost")
            .with_details(reason)
            .with_code("CONNECTION_LOST");
        for channel in self.channels_snapshot() {
            channel.socket_closed(Some(error.clone()));
        }
    }

    /// Closes the socket on request; active channels report `Closed`.
    pub async fn disconnect(&self) {
        lock(&self.tasks).abort_all();
        let closed = self.connection.close().await;

        *lock(&self.pending_heartbeat) = None;
        lock(&self.replies).clear();

        for channel in self.channels_snapshot() {
            channel.socket_closed(None);
        }

        if closed {
            tracing::info!("Disconnected from WebSocket server");
        }
    }
}
