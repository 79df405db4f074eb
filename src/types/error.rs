use crate::manager::ChannelStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by the manager and the bundled transports.
///
/// Only [`ChannelNotFound`](RealtimeError::ChannelNotFound),
/// [`ChannelNotReady`](RealtimeError::ChannelNotReady) and
/// [`InvalidConfig`](RealtimeError::InvalidConfig) ever come back from
/// [`RealtimeManager`](crate::RealtimeManager) operations. Transport failures
/// are recovered locally and surfaced through callbacks and observers.
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// No channel with this name is registered
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// The channel exists but is not in `subscribed` state
    #[error("Channel '{name}' is not ready (status: {status})")]
    ChannelNotReady { name: String, status: ChannelStatus },

    /// Rejected configuration (empty channel name, zero attempts, ...)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error reported by the realtime transport
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// WebSocket protocol error (connection failed, invalid frame, etc.)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// General connection error with descriptive message
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication or authorization error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing error (malformed endpoint URL)
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Push reply not received in time
    #[error("Timeout error")]
    Timeout,

    /// Attempted operation while not connected to the server
    #[error("Not connected")]
    NotConnected,
}

/// Opaque diagnostic error handed over by a transport.
///
/// Mirrors the shape hosted backends return (`message`, `details`, `hint`,
/// `code`) so the whole payload can be logged when a channel fails.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            hint: None,
            code: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Builds an error from an arbitrary reply payload, picking up the
    /// diagnostic fields when the server provides them.
    pub fn from_payload(payload: &serde_json::Value) -> Self {
        let field = |key: &str| {
            payload
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };

        let message = field("message")
            .or_else(|| field("reason"))
            .unwrap_or_else(|| payload.to_string());

        Self {
            message,
            details: field("details"),
            hint: field("hint"),
            code: field("code"),
        }
    }
}

/// Convenience type alias for `Result<T, RealtimeError>`.
pub type Result<T> = std::result::Result<T, RealtimeError>;
