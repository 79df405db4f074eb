use super::message::PhoenixMessage;
use crate::types::{RealtimeError, Result};
use futures::SinkExt;
use futures::stream::SplitSink;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

pub(crate) type SocketWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

struct Session {
    id: u64,
    state: ConnectionState,
    writer: Option<SocketWriter>,
}

/// Write half of the socket plus the session it belongs to.
///
/// Every successful open starts a new session. Background tasks remember
/// the session they were spawned for, so a late failure report from a
/// previous socket cannot close the current one.
pub struct ConnectionManager {
    session: RwLock<Session>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            session: RwLock::new(Session {
                id: 0,
                state: ConnectionState::Closed,
                writer: None,
            }),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.session.read().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Open
    }

    /// Whether `id` is the current session and still open
    pub async fn is_session_open(&self, id: u64) -> bool {
        let session = self.session.read().await;
        session.id == id && session.state == ConnectionState::Open
    }

    pub async fn set_connecting(&self) {
        self.session.write().await.state = ConnectionState::Connecting;
    }

    /// Installs the writer of a freshly opened socket and returns its session id.
    pub async fn open(&self, writer: SocketWriter) -> u64 {
        let mut session = self.session.write().await;
        session.id += 1;
        session.writer = Some(writer);
        session.state = ConnectionState::Open;
        session.id
    }

    /// Marks a failed open attempt.
    pub async fn abort_connecting(&self) {
        let mut session = self.session.write().await;
        if session.state == ConnectionState::Connecting {
            session.state = ConnectionState::Closed;
        }
    }

    /// Serializes and writes a frame.
    pub async fn send_message(&self, message: &PhoenixMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;

        let mut session = self.session.write().await;
        if session.state != ConnectionState::Open {
            return Err(RealtimeError::NotConnected);
        }
        let Some(writer) = session.writer.as_mut() else {
            return Err(RealtimeError::NotConnected);
        };
        writer.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Closes the given session if it is still the current one.
    ///
    /// Returns `false` when the session already ended or was superseded.
    pub async fn close_session(&self, id: u64) -> bool {
        let mut session = self.session.write().await;
        if session.id != id || session.state == ConnectionState::Closed {
            return false;
        }

        session.state = ConnectionState::Closing;
        if let Some(mut writer) = session.writer.take()
            && let Err(e) = writer.close().await
        {
            tracing::debug!("Closing socket session {} failed: {}", id, e);
        }
        session.state = ConnectionState::Closed;
        true
    }

    /// Closes whatever session is current.
    pub async fn close(&self) -> bool {
        let id = self.session.read().await.id;
        self.close_session(id).await
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
