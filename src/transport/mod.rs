//! The seam between the manager and a realtime transport.
//!
//! A transport creates named channels, attaches event and presence handlers
//! to them, and reports channel lifecycle through a single status callback.
//! Two implementations ship with the crate: [`MemoryTransport`] for tests,
//! and [`PhoenixTransport`] which speaks the Phoenix-channels WebSocket
//! protocol used by hosted realtime backends.

pub mod memory;
pub mod phoenix;

pub use memory::{MemoryChannel, MemoryTransport};
pub use phoenix::{PhoenixOptions, PhoenixTransport};

use crate::types::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Handler invoked with the payload of an inbound event.
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync + 'static>;

/// Callback through which a transport reports channel lifecycle.
pub type StatusCallback = Arc<dyn Fn(TransportStatus) + Send + Sync + 'static>;

/// Live handle on a transport-level channel.
pub type ChannelHandle = Arc<dyn TransportChannel>;

/// Lifecycle report emitted by a transport for one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportStatus {
    Subscribing,
    Subscribed,
    Errored { cause: Option<TransportError> },
    Closed,
    TimedOut,
}

impl TransportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribing => "SUBSCRIBING",
            Self::Subscribed => "SUBSCRIBED",
            Self::Errored { .. } => "CHANNEL_ERROR",
            Self::Closed => "CLOSED",
            Self::TimedOut => "TIMED_OUT",
        }
    }
}

impl std::fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Presence event kinds a handler can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceEvent {
    Sync,
    Join,
    Leave,
}

impl PresenceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Join => "join",
            Self::Leave => "leave",
        }
    }
}

/// Options used when creating a transport channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Presence key; `Some` enables presence tracking on the channel.
    pub presence_key: Option<String>,
}

/// Broadcast sent to every subscriber of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    pub payload: Value,
}

impl BroadcastMessage {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: "broadcast".to_string(),
            event: event.into(),
            payload,
        }
    }
}

/// Outcome of a broadcast send as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResponse {
    Ok,
    TimedOut,
    Error(String),
}

impl SendResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Factory for transport channels.
pub trait RealtimeTransport: Send + Sync {
    fn create_channel(&self, name: &str, options: ChannelOptions) -> ChannelHandle;
}

/// A single transport-level channel.
///
/// Handlers must be attached before [`subscribe`](Self::subscribe) is called.
/// Errors are never raised from `subscribe`; they are reported through the
/// status callback instead.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn name(&self) -> &str;

    fn on(&self, event: &str, handler: EventHandler);

    fn on_presence(&self, event: PresenceEvent, handler: EventHandler);

    fn subscribe(&self, callback: StatusCallback);

    async fn track(&self, state: Value) -> Result<(), TransportError>;

    async fn send(&self, message: BroadcastMessage) -> SendResponse;

    async fn unsubscribe(&self) -> Result<(), TransportError>;
}
