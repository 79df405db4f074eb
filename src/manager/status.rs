use crate::transport::TransportStatus;
use crate::types::TransportError;
use serde::{Deserialize, Serialize};

/// Lifecycle status of one channel instance.
///
/// An instance only ever moves forward: `subscribing` may become any of the
/// other three, `subscribed` may become `error` or `closed`, and `error` and
/// `closed` are terminal until a fresh instance replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Subscribing,
    Subscribed,
    Error,
    Closed,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribing => "subscribing",
            Self::Subscribed => "subscribed",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Closed)
    }

    /// Whether an instance in this status may move to `next`
    pub fn can_transition_to(&self, next: ChannelStatus) -> bool {
        match (self, next) {
            (Self::Subscribing, Self::Subscribed | Self::Error | Self::Closed) => true,
            (Self::Subscribed, Self::Error | Self::Closed) => true,
            _ => false,
        }
    }
}

impl From<&TransportStatus> for ChannelStatus {
    fn from(status: &TransportStatus) -> Self {
        match status {
            TransportStatus::Subscribing => Self::Subscribing,
            TransportStatus::Subscribed => Self::Subscribed,
            TransportStatus::Errored { .. } | TransportStatus::TimedOut => Self::Error,
            TransportStatus::Closed => Self::Closed,
        }
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of a single registered channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub status: ChannelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TransportError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub name: String,
    pub status: ChannelStatus,
}

/// Aggregate snapshot returned by
/// [`RealtimeManager::connection_status`](crate::RealtimeManager::connection_status).
///
/// `connected` is inferred from channel lifecycle (true while at least one
/// channel is subscribed). It approximates the transport's network state and
/// can lag behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub channel_count: usize,
    pub channels: Vec<ChannelSummary>,
    pub reconnect_attempts: u32,
}
