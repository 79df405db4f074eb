use crate::transport::EventHandler;
use crate::types::{
    RECONNECT_BASE_DELAY, RECONNECT_MAX_ATTEMPTS, RECONNECT_MAX_DELAY, RealtimeError, Result,
    TransportError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub type LifecycleHook = Arc<dyn Fn() + Send + Sync + 'static>;
pub type ErrorHook = Arc<dyn Fn(&TransportError) + Send + Sync + 'static>;

/// Callbacks fired as a channel moves through its lifecycle.
#[derive(Clone, Default)]
pub struct LifecycleCallbacks {
    pub on_subscribed: Option<LifecycleHook>,
    pub on_error: Option<ErrorHook>,
    pub on_closed: Option<LifecycleHook>,
}

/// Presence tracking for a channel.
#[derive(Clone)]
pub struct PresenceConfig {
    /// Key this client is tracked under
    pub key: String,
    /// State tracked as soon as the channel is subscribed
    pub initial_state: Option<Value>,
    pub on_join: Option<EventHandler>,
    pub on_leave: Option<EventHandler>,
    pub on_sync: Option<EventHandler>,
}

impl PresenceConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            initial_state: None,
            on_join: None,
            on_leave: None,
            on_sync: None,
        }
    }

    pub fn initial_state(mut self, state: Value) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_join(mut self, handler: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_join = Some(Arc::new(handler));
        self
    }

    pub fn on_leave(mut self, handler: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_leave = Some(Arc::new(handler));
        self
    }

    pub fn on_sync(mut self, handler: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_sync = Some(Arc::new(handler));
        self
    }
}

impl std::fmt::Debug for PresenceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceConfig")
            .field("key", &self.key)
            .field("initial_state", &self.initial_state)
            .field("on_join", &self.on_join.is_some())
            .field("on_leave", &self.on_leave.is_some())
            .field("on_sync", &self.on_sync.is_some())
            .finish()
    }
}

/// Everything needed to (re)create a channel.
///
/// The registry keeps the original value so that a resubscribe after a
/// failure wires up exactly the same handlers.
///
/// # Example
///
/// ```
/// use realtime_channel_manager::{ChannelConfig, PresenceConfig};
/// use serde_json::json;
///
/// let config = ChannelConfig::new("orders")
///     .on("order_updated", |payload| println!("order changed: {payload}"))
///     .presence(PresenceConfig::new("driver-17").initial_state(json!({"status": "online"})))
///     .on_subscribed(|| println!("listening for orders"));
///
/// assert_eq!(config.event_names(), vec!["order_updated"]);
/// ```
#[derive(Clone, Default)]
pub struct ChannelConfig {
    pub name: String,
    pub events: BTreeMap<String, EventHandler>,
    pub presence: Option<PresenceConfig>,
    pub callbacks: LifecycleCallbacks,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Attaches a handler for `event`, replacing any previous one.
    pub fn on(
        mut self,
        event: impl Into<String>,
        handler: impl Fn(Value) + Send + Sync + 'static,
    ) -> Self {
        self.events.insert(event.into(), Arc::new(handler));
        self
    }

    pub fn presence(mut self, presence: PresenceConfig) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn on_subscribed(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_subscribed = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&TransportError) + Send + Sync + 'static) -> Self {
        self.callbacks.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_closed(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_closed = Some(Arc::new(callback));
        self
    }

    pub fn event_names(&self) -> Vec<&str> {
        self.events.keys().map(String::as_str).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RealtimeError::InvalidConfig(
                "channel name is required".to_string(),
            ));
        }
        if let Some(presence) = &self.presence
            && presence.key.is_empty()
        {
            return Err(RealtimeError::InvalidConfig(format!(
                "presence key is required for channel '{}'",
                self.name
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("name", &self.name)
            .field("events", &self.event_names())
            .field("presence", &self.presence)
            .finish_non_exhaustive()
    }
}

/// Backoff settings for automatic resubscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Automatic attempts before giving up. `0` disables automatic recovery.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_base_delay() -> u64 {
    RECONNECT_BASE_DELAY
}

fn default_max_delay() -> u64 {
    RECONNECT_MAX_DELAY
}

fn default_max_attempts() -> u32 {
    RECONNECT_MAX_ATTEMPTS
}

/// Options for [`RealtimeManager`](crate::RealtimeManager).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeManagerOptions {
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Local watchdog for channels that never leave `subscribing`.
    /// Disabled when `None`.
    #[serde(default)]
    pub subscribe_timeout_ms: Option<u64>,
}

impl RealtimeManagerOptions {
    pub fn validate(&self) -> Result<()> {
        let reconnect = &self.reconnect;
        if reconnect.base_delay_ms == 0 {
            return Err(RealtimeError::InvalidConfig(
                "reconnect.base_delay_ms must be greater than zero".to_string(),
            ));
        }
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            return Err(RealtimeError::InvalidConfig(format!(
                "reconnect.max_delay_ms ({}) is below base_delay_ms ({})",
                reconnect.max_delay_ms, reconnect.base_delay_ms
            )));
        }
        if self.subscribe_timeout_ms == Some(0) {
            return Err(RealtimeError::InvalidConfig(
                "subscribe_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn subscribe_timeout(&self) -> Option<Duration> {
        self.subscribe_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_name_is_rejected() {
        let err = ChannelConfig::new("").validate().unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidConfig(_)));
    }

    #[test]
    fn test_name_is_passed_through_verbatim() {
        assert!(ChannelConfig::new(" ").validate().is_ok());
        assert!(ChannelConfig::new("room: lobby ").validate().is_ok());
    }

    #[test]
    fn test_empty_presence_key_is_rejected() {
        let config = ChannelConfig::new("drivers").presence(PresenceConfig::new(""));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_later_handler_replaces_earlier_one() {
        let config = ChannelConfig::new("orders")
            .on("INSERT", |_| {})
            .on("UPDATE", |_| {})
            .on("INSERT", |_| {});

        assert_eq!(config.event_names(), vec!["INSERT", "UPDATE"]);
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: RealtimeManagerOptions =
            serde_json::from_value(json!({ "reconnect": { "max_attempts": 8 } })).unwrap();

        assert_eq!(options.reconnect.max_attempts, 8);
        assert_eq!(options.reconnect.base_delay_ms, 1000);
        assert_eq!(options.reconnect.max_delay_ms, 30000);
        assert_eq!(options.subscribe_timeout(), None);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_options_validation() {
        let mut options = RealtimeManagerOptions::default();
        options.reconnect.base_delay_ms = 0;
        assert!(options.validate().is_err());

        let mut options = RealtimeManagerOptions::default();
        options.reconnect.max_delay_ms = 10;
        assert!(options.validate().is_err());

        let options = RealtimeManagerOptions {
            subscribe_timeout_ms: Some(0),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
