use super::message::PhoenixMessage;
use super::socket::Socket;
use crate::types::{HEARTBEAT_INTERVAL, PHOENIX_TOPIC, phoenix_events};
use std::sync::Weak;
use std::time::Duration;
use tokio::time;

/// Keeps one socket session alive.
///
/// A heartbeat that is still unanswered when the next one is due means the
/// connection is dead; the session is then torn down so channels can recover.
pub struct HeartbeatManager {
    socket: Weak<Socket>,
    session: u64,
    interval: Duration,
}

impl HeartbeatManager {
    pub(crate) fn new(socket: Weak<Socket>, session: u64) -> Self {
        Self {
            socket,
            session,
            interval: Duration::from_millis(HEARTBEAT_INTERVAL),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(self) {
        let mut interval_timer = time::interval(self.interval);
        interval_timer.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        interval_timer.tick().await;

        loop {
            interval_timer.tick().await;

            let Some(socket) = self.socket.upgrade() else {
                break;
            };
            if !socket.is_session_open(self.session).await {
                break;
            }

            if let Some(pending) = socket.pending_heartbeat() {
                tracing::warn!("Heartbeat {} got no reply, closing connection", pending);
                socket
                    .connection_lost(self.session, "heartbeat timeout")
                    .await;
                break;
            }

            let heartbeat_ref = socket.make_ref();
            let message = PhoenixMessage::new(
                PHOENIX_TOPIC,
                phoenix_events::HEARTBEAT,
                serde_json::json!({}),
            )
            .with_ref(heartbeat_ref.clone());

            socket.set_pending_heartbeat(Some(heartbeat_ref.clone()));
            match socket.push(&message).await {
                Ok(()) => tracing::debug!("Sent heartbeat with ref {}", heartbeat_ref),
                Err(e) => {
                    socket.set_pending_heartbeat(None);
                    tracing::error!("Failed to send heartbeat: {}", e);
                }
            }
        }
        tracing::debug!("Heartbeat for session {} stopped", self.session);
    }
}
