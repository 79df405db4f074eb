/// Phoenix protocol event strings (magic strings layer)
pub mod phoenix_events {
    pub const CLOSE: &str = "phx_close";
    pub const ERROR: &str = "phx_error";
    pub const JOIN: &str = "phx_join";
    pub const REPLY: &str = "phx_reply";
    pub const LEAVE: &str = "phx_leave";
    pub const HEARTBEAT: &str = "heartbeat";
}

/// Phoenix protocol topics
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Prefix the server expects on every channel topic
pub const TOPIC_PREFIX: &str = "realtime:";

/// Channel event strings (magic strings layer)
pub mod channel_events {
    pub const BROADCAST: &str = "broadcast";
    pub const PRESENCE: &str = "presence";
    pub const PRESENCE_STATE: &str = "presence_state";
    pub const PRESENCE_DIFF: &str = "presence_diff";
}

/// Protocol version
pub const VSN: &str = "1.0.0";

/// Default push timeout (milliseconds)
pub const DEFAULT_TIMEOUT: u64 = 10000;

/// Default heartbeat interval (milliseconds)
pub const HEARTBEAT_INTERVAL: u64 = 25000;

/// Reconnection backoff defaults (milliseconds / attempts)
pub const RECONNECT_BASE_DELAY: u64 = 1000;
pub const RECONNECT_MAX_DELAY: u64 = 30000;
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Error code attached to locally synthesised subscribe timeouts
pub const TIMED_OUT_CODE: &str = "TIMED_OUT";
