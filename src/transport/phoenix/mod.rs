//! Phoenix-channels WebSocket transport.

mod channel;
mod connection;
mod heartbeat;
pub mod message;
pub mod presence;
mod socket;

pub use channel::{JoinStatus, PhoenixChannel};
pub use connection::ConnectionState;

use crate::transport::{ChannelHandle, ChannelOptions, RealtimeTransport};
use crate::types::{DEFAULT_TIMEOUT, HEARTBEAT_INTERVAL, RealtimeError, Result, VSN};
use serde::{Deserialize, Serialize};
use socket::Socket;
use std::sync::Arc;
use url::Url;

/// Connection settings for [`PhoenixTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoenixOptions {
    /// Project API key, sent as the `apikey` query parameter
    pub api_key: String,
    /// User JWT forwarded in every join
    #[serde(default)]
    pub access_token: Option<String>,
    /// Push reply timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Receive our own broadcasts
    #[serde(default)]
    pub broadcast_self: bool,
    /// Wait for a server acknowledgement on every broadcast
    #[serde(default)]
    pub broadcast_ack: bool,
    /// Join channels as private (requires authorization policies)
    #[serde(default)]
    pub private: bool,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT
}

fn default_heartbeat_interval() -> u64 {
    HEARTBEAT_INTERVAL
}

impl PhoenixOptions {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            access_token: None,
            timeout_ms: default_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            broadcast_self: false,
            broadcast_ack: false,
            private: false,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(RealtimeError::Auth("API key is required".to_string()));
        }
        if self.timeout_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(RealtimeError::InvalidConfig(
                "timeout_ms and heartbeat_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// [`RealtimeTransport`] over a single Phoenix-channels WebSocket.
///
/// The socket is opened lazily by the first channel join (or eagerly with
/// [`connect`](Self::connect)) and reopened by later joins after it drops,
/// so the manager's resubscribe loop doubles as socket recovery.
///
/// # Example
///
/// ```no_run
/// use realtime_channel_manager::{PhoenixOptions, PhoenixTransport, RealtimeManager};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(
///     PhoenixTransport::connect(
///         "wss://your-project.supabase.co/realtime/v1/websocket",
///         PhoenixOptions::new("your-anon-key"),
///     )
///     .await?,
/// );
/// let manager = RealtimeManager::new(transport.clone());
///
/// // ...
///
/// manager.cleanup().await;
/// transport.disconnect().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PhoenixTransport {
    socket: Arc<Socket>,
}

impl PhoenixTransport {
    /// Creates the transport without opening the socket.
    ///
    /// # Errors
    ///
    /// - [`RealtimeError::Auth`] if the API key is empty
    /// - [`RealtimeError::UrlParse`] if the endpoint is not a valid URL
    pub fn new(endpoint: &str, options: PhoenixOptions) -> Result<Self> {
        options.validate()?;
        let url = build_endpoint_url(endpoint, &options.api_key)?;
        Ok(Self {
            socket: Arc::new(Socket::new(url, options)),
        })
    }

    /// Creates the transport and opens the socket.
    pub async fn connect(endpoint: &str, options: PhoenixOptions) -> Result<Self> {
        let transport = Self::new(endpoint, options)?;
        transport.socket.ensure_connected().await?;
        Ok(transport)
    }

    pub async fn is_connected(&self) -> bool {
        self.socket.is_connected().await
    }

    /// Aborts background tasks and closes the socket. Joined channels
    /// report `CLOSED`.
    pub async fn disconnect(&self) {
        tracing::info!("Disconnecting from WebSocket server");
        self.socket.disconnect().await;
    }
}

impl RealtimeTransport for PhoenixTransport {
    fn create_channel(&self, name: &str, options: ChannelOptions) -> ChannelHandle {
        PhoenixChannel::new(name, options, Arc::downgrade(&self.socket))
    }
}

fn build_endpoint_url(endpoint: &str, api_key: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint)?;
    url.query_pairs_mut()
        .append_pair("apikey", api_key)
        .append_pair("vsn", VSN);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportChannel;
    use serde_json::json;

    #[test]
    fn test_endpoint_url_carries_key_and_version() {
        let url = build_endpoint_url("wss://example.supabase.co/realtime/v1/websocket", "anon")
            .unwrap();

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("apikey".to_string(), "anon".to_string()),
                ("vsn".to_string(), "1.0.0".to_string()),
            ]
        );
    }

    #[test]
    fn test_missing_api_key_is_auth_error() {
        let result = PhoenixTransport::new("wss://example.supabase.co", PhoenixOptions::new(""));
        assert!(matches!(result, Err(RealtimeError::Auth(_))));
    }

    #[test]
    fn test_bad_endpoint_is_url_error() {
        let result = PhoenixTransport::new("not a url", PhoenixOptions::new("anon"));
        assert!(matches!(result, Err(RealtimeError::UrlParse(_))));
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: PhoenixOptions = serde_json::from_value(json!({"api_key": "anon"})).unwrap();

        assert_eq!(options, PhoenixOptions::new("anon"));
        assert_eq!(options.timeout_ms, 10_000);
        assert_eq!(options.heartbeat_interval_ms, 25_000);
    }

    #[tokio::test]
    async fn test_create_channel_does_not_connect() {
        let transport =
            PhoenixTransport::new("wss://example.invalid/realtime/v1", PhoenixOptions::new("anon"))
                .unwrap();
        let channel = transport.create_channel("orders", ChannelOptions::default());

        assert_eq!(channel.name(), "orders");
        assert!(!transport.is_connected().await);
    }
}
