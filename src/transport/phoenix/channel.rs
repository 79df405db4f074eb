use super::PhoenixOptions;
use super::message::{
    BroadcastJoinConfig, ChannelJoinConfig, JoinPayload, PhoenixMessage, PresenceJoinConfig,
};
use super::presence::{Presence, PresenceChanges, RawPresenceDiff, RawPresenceState};
use super::socket::Socket;
use crate::infrastructure::invoke_guarded;
use crate::transport::{
    BroadcastMessage, ChannelOptions, EventHandler, PresenceEvent, SendResponse, StatusCallback,
    TransportChannel, TransportStatus,
};
use crate::types::{
    RealtimeError, TIMED_OUT_CODE, TOPIC_PREFIX, TransportError, channel_events, phoenix_events,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Closed,
    Errored,
    Joined,
    Joining,
    Leaving,
}

struct ChannelState {
    status: JoinStatus,
    join_ref: Option<String>,
    handlers: Vec<(String, EventHandler)>,
    presence_handlers: Vec<(PresenceEvent, EventHandler)>,
    status_callback: Option<StatusCallback>,
    presence: Presence,
}

/// One Phoenix channel, joined on `realtime:<name>`.
pub struct PhoenixChannel {
    name: String,
    topic: String,
    options: ChannelOptions,
    socket: Weak<Socket>,
    me: Weak<PhoenixChannel>,
    state: Mutex<ChannelState>,
}

fn is_lifecycle_event(event: &str) -> bool {
    matches!(
        event,
        phoenix_events::CLOSE
            | phoenix_events::ERROR
            | phoenix_events::JOIN
            | phoenix_events::REPLY
            | phoenix_events::LEAVE
    )
}

impl PhoenixChannel {
    pub(crate) fn new(name: &str, options: ChannelOptions, socket: Weak<Socket>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name: name.to_string(),
            topic: format!("{TOPIC_PREFIX}{name}"),
            options,
            socket,
            me: me.clone(),
            state: Mutex::new(ChannelState {
                status: JoinStatus::Closed,
                join_ref: None,
                handlers: Vec::new(),
                presence_handlers: Vec::new(),
                status_callback: None,
                presence: Presence::default(),
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn status(&self) -> JoinStatus {
        self.state().status
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn joined_ref(&self) -> Option<String> {
        let state = self.state();
        match state.status {
            JoinStatus::Joined => state.join_ref.clone(),
            _ => None,
        }
    }

    fn report(&self, status: TransportStatus) {
        let callback = self.state().status_callback.clone();
        if let Some(callback) = callback {
            callback(status);
        }
    }

    fn join_payload(&self, options: &PhoenixOptions) -> JoinPayload {
        JoinPayload {
            config: ChannelJoinConfig {
                broadcast: BroadcastJoinConfig {
                    self_: options.broadcast_self,
                    ack: options.broadcast_ack,
                },
                presence: PresenceJoinConfig {
                    key: self.options.presence_key.clone(),
                    enabled: self.options.presence_key.is_some(),
                },
                is_private: options.private,
            },
            access_token: options.access_token.clone(),
        }
    }

    async fn join(self: Arc<Self>) {
        let Some(socket) = self.socket.upgrade() else {
            self.settle_join(TransportStatus::Errored {
                cause: Some(TransportError::new("transport dropped")),
            });
            return;
        };

        if let Err(e) = socket.ensure_connected().await {
            tracing::error!("Cannot join {}, socket unavailable: {}", self.topic, e);
            self.settle_join(TransportStatus::Errored {
                cause: Some(TransportError::new(e.to_string()).with_code("CONNECTION_FAILED")),
            });
            return;
        }

        socket.register(Arc::clone(&self));
        let join_ref = socket.make_ref();
        {
            let mut state = self.state();
            state.join_ref = Some(join_ref.clone());
            state.presence.reset();
        }

        let payload = match serde_json::to_value(self.join_payload(&socket.options)) {
            Ok(payload) => payload,
            Err(e) => {
                self.settle_join(TransportStatus::Errored {
                    cause: Some(TransportError::new(e.to_string())),
                });
                return;
            }
        };
        let message = PhoenixMessage::new(&self.topic, phoenix_events::JOIN, payload)
            .with_ref(join_ref.clone())
            .with_join_ref(join_ref);

        tracing::info!("Joining channel: {}", self.topic);
        let status = match socket.request(message).await {
            Ok(reply) if reply.is_ok() => TransportStatus::Subscribed,
            Ok(reply) => TransportStatus::Errored {
                cause: Some(TransportError::from_payload(&reply.response)),
            },
            Err(RealtimeError::Timeout) => TransportStatus::TimedOut,
            Err(e) => TransportStatus::Errored {
                cause: Some(TransportError::new(e.to_string())),
            },
        };
        self.settle_join(status);
    }

    /// Records the outcome of a join, unless the channel was left meanwhile.
    fn settle_join(&self, status: TransportStatus) {
        {
            let mut state = self.state();
            if state.status != JoinStatus::Joining {
                tracing::debug!(
                    "Dropping join outcome {} for {} in status {:?}",
                    status,
                    self.topic,
                    state.status
                );
                return;
            }
            state.status = match status {
                TransportStatus::Subscribed => JoinStatus::Joined,
                _ => JoinStatus::Errored,
            };
        }
        self.report(status);
    }

    /// Handles a frame routed to this channel's topic.
    pub(crate) fn handle_message(&self, message: PhoenixMessage) {
        if is_lifecycle_event(&message.event)
            && let Some(join_ref) = &message.join_ref
            && self.state().join_ref.as_ref() != Some(join_ref)
        {
            tracing::debug!(
                "Dropping {} for {} from a previous join",
                message.event,
                self.topic
            );
            return;
        }

        match message.event.as_str() {
            phoenix_events::CLOSE => self.server_ended(JoinStatus::Closed, TransportStatus::Closed),
            phoenix_events::ERROR => self.server_ended(
                JoinStatus::Errored,
                TransportStatus::Errored {
                    cause: Some(
                        TransportError::new("channel error")
                            .with_details(message.payload.to_string()),
                    ),
                },
            ),
            phoenix_events::REPLY => {
                tracing::debug!("Unmatched reply on {}: {:?}", self.topic, message.r#ref);
            }
            channel_events::PRESENCE_STATE => self.handle_presence_state(message.payload),
            channel_events::PRESENCE_DIFF => self.handle_presence_diff(message.payload),
            channel_events::BROADCAST => {
                let event = message
                    .payload
                    .get("event")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                match event {
                    Some(event) => self.dispatch(&event, message.payload),
                    None => tracing::warn!("Broadcast without event name on {}", self.topic),
                }
            }
            other => {
                let event = other.to_string();
                self.dispatch(&event, message.payload);
            }
        }
    }

    fn server_ended(&self, next: JoinStatus, status: TransportStatus) {
        {
            let mut state = self.state();
            if !matches!(state.status, JoinStatus::Joined | JoinStatus::Joining) {
                return;
            }
            state.status = next;
        }
        tracing::info!("Channel {} reported {} by server", self.topic, status);
        self.report(status);
    }

    /// Called by the socket when the connection went away: errored when it
    /// failed (`cause` set), closed when it was shut down on request.
    pub(crate) fn socket_closed(&self, cause: Option<TransportError>) {
        let status = match cause {
            Some(cause) => TransportStatus::Errored { cause: Some(cause) },
            None => TransportStatus::Closed,
        };
        let next = match status {
            TransportStatus::Closed => JoinStatus::Closed,
            _ => JoinStatus::Errored,
        };
        self.server_ended(next, status);
    }

    fn dispatch(&self, event: &str, payload: Value) {
        let handlers: Vec<EventHandler> = self
            .state()
            .handlers
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        if handlers.is_empty() {
            tracing::debug!("No handler for {} on {}", event, self.topic);
        }
        for handler in handlers {
            invoke_guarded("Event handler", || handler(payload.clone()));
        }
    }

    fn dispatch_presence(&self, event: PresenceEvent, payload: Value) {
        let handlers: Vec<EventHandler> = self
            .state()
            .presence_handlers
            .iter()
            .filter(|(kind, _)| *kind == event)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            invoke_guarded("Presence handler", || handler(payload.clone()));
        }
    }

    fn handle_presence_state(&self, payload: Value) {
        let raw = match serde_json::from_value::<RawPresenceState>(payload) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Malformed presence_state on {}: {}", self.topic, e);
                return;
            }
        };

        let (changes, snapshot) = {
            let mut state = self.state();
            let Some(join_ref) = state.join_ref.clone() else {
                tracing::warn!("presence_state on {} before join", self.topic);
                return;
            };
            let changes = state.presence.sync_state(raw, join_ref);
            (changes, state.presence.state_json())
        };
        self.emit_presence(changes, snapshot);
    }

    fn handle_presence_diff(&self, payload: Value) {
        let diff = match serde_json::from_value::<RawPresenceDiff>(payload) {
            Ok(diff) => diff,
            Err(e) => {
                tracing::warn!("Malformed presence_diff on {}: {}", self.topic, e);
                return;
            }
        };

        let applied = {
            let mut state = self.state();
            let join_ref = state.join_ref.clone();
            if state.presence.in_pending_sync_state(join_ref.as_deref()) {
                state.presence.add_pending_diff(diff);
                None
            } else {
                let changes = state.presence.sync_diff(diff);
                Some((changes, state.presence.state_json()))
            }
        };
        if let Some((changes, snapshot)) = applied {
            self.emit_presence(changes, snapshot);
        }
    }

    fn emit_presence(&self, changes: PresenceChanges, snapshot: Value) {
        for payload in changes.join_payloads() {
            self.dispatch_presence(PresenceEvent::Join, payload);
        }
        for payload in changes.leave_payloads() {
            self.dispatch_presence(PresenceEvent::Leave, payload);
        }
        self.dispatch_presence(PresenceEvent::Sync, snapshot);
    }

    #[cfg(test)]
    pub(crate) fn set_callback_for_test(&self, callback: StatusCallback) {
        self.state().status_callback = Some(callback);
    }

    #[cfg(test)]
    pub(crate) fn mark_joined_for_test(&self, join_ref: &str) {
        let mut state = self.state();
        state.status = JoinStatus::Joined;
        state.join_ref = Some(join_ref.to_string());
    }
}

#[async_trait]
impl TransportChannel for PhoenixChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn on(&self, event: &str, handler: EventHandler) {
        self.state().handlers.push((event.to_string(), handler));
    }

    fn on_presence(&self, event: PresenceEvent, handler: EventHandler) {
        self.state().presence_handlers.push((event, handler));
    }

    fn subscribe(&self, callback: StatusCallback) {
        {
            let mut state = self.state();
            state.status_callback = Some(callback);
            if matches!(state.status, JoinStatus::Joining | JoinStatus::Joined) {
                tracing::debug!("Channel {} already joining or joined", self.topic);
                return;
            }
            state.status = JoinStatus::Joining;
        }

        let Some(me) = self.me.upgrade() else {
            return;
        };
        match self.socket.upgrade() {
            Some(socket) => socket.spawn(me.join()),
            None => me.settle_join(TransportStatus::Errored {
                cause: Some(TransportError::new("transport dropped")),
            }),
        }
    }

    async fn track(&self, state: Value) -> Result<(), TransportError> {
        let socket = self
            .socket
            .upgrade()
            .ok_or_else(|| TransportError::new("transport dropped"))?;
        let join_ref = self
            .joined_ref()
            .ok_or_else(|| TransportError::new("channel not joined"))?;

        let message = PhoenixMessage::new(
            &self.topic,
            channel_events::PRESENCE,
            json!({ "type": "presence", "event": "track", "payload": state }),
        )
        .with_join_ref(join_ref);

        match socket.request(message).await {
            Ok(reply) if reply.is_ok() => Ok(()),
            Ok(reply) => Err(TransportError::from_payload(&reply.response)),
            Err(RealtimeError::Timeout) => {
                Err(TransportError::new("presence track timed out").with_code(TIMED_OUT_CODE))
            }
            Err(e) => Err(TransportError::new(e.to_string())),
        }
    }

    async fn send(&self, message: BroadcastMessage) -> SendResponse {
        let Some(socket) = self.socket.upgrade() else {
            return SendResponse::Error("transport dropped".to_string());
        };
        let Some(join_ref) = self.joined_ref() else {
            return SendResponse::Error("channel not joined".to_string());
        };
        let payload = match serde_json::to_value(&message) {
            Ok(payload) => payload,
            Err(e) => return SendResponse::Error(e.to_string()),
        };
        let frame = PhoenixMessage::new(&self.topic, channel_events::BROADCAST, payload)
            .with_join_ref(join_ref);

        if socket.options.broadcast_ack {
            match socket.request(frame).await {
                Ok(reply) if reply.is_ok() => SendResponse::Ok,
                Ok(reply) => {
                    SendResponse::Error(TransportError::from_payload(&reply.response).message)
                }
                Err(RealtimeError::Timeout) => SendResponse::TimedOut,
                Err(e) => SendResponse::Error(e.to_string()),
            }
        } else {
            let frame = frame.with_ref(socket.make_ref());
            match socket.push(&frame).await {
                Ok(()) => SendResponse::Ok,
                Err(e) => SendResponse::Error(e.to_string()),
            }
        }
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        let (previous, join_ref) = {
            let mut state = self.state();
            state.status_callback = None;
            let previous = state.status;
            state.status = JoinStatus::Leaving;
            (previous, state.join_ref.clone())
        };

        let Some(socket) = self.socket.upgrade() else {
            self.state().status = JoinStatus::Closed;
            return Ok(());
        };
        if let Some(me) = self.me.upgrade() {
            socket.unregister(&me);
        }

        let was_active = matches!(previous, JoinStatus::Joined | JoinStatus::Joining);
        let result = if was_active && socket.is_connected().await {
            let mut frame = PhoenixMessage::new(&self.topic, phoenix_events::LEAVE, json!({}));
            if let Some(join_ref) = join_ref {
                frame = frame.with_join_ref(join_ref);
            }
            match socket.request(frame).await {
                Ok(_) => Ok(()),
                Err(RealtimeError::Timeout) => {
                    Err(TransportError::new("leave timed out").with_code(TIMED_OUT_CODE))
                }
                Err(e) => Err(TransportError::new(e.to_string())),
            }
        } else {
            Ok(())
        };

        self.state().status = JoinStatus::Closed;
        tracing::info!("Left channel: {}", self.topic);
        result
    }
}
