//! Channel lifecycle management.
//!
//! - [`RealtimeManager`]: the facade applications talk to
//! - [`ChannelRegistry`]: name to instance and status bookkeeping
//! - [`ReconnectionPolicy`]: bounded exponential-backoff recovery
//! - [`ConnectionMonitor`]: inferred connectivity and observers

pub mod config;
pub mod core;
pub mod monitor;
pub mod reconnect;
pub mod registry;
pub mod status;

pub use config::{
    ChannelConfig, ErrorHook, LifecycleCallbacks, LifecycleHook, PresenceConfig,
    RealtimeManagerOptions, ReconnectConfig,
};
pub use self::core::RealtimeManager;
pub use monitor::{ConnectionMonitor, ObserverHandle};
pub use reconnect::{ReconnectDecision, ReconnectionPolicy};
pub use registry::{ChannelEntry, ChannelRegistry, Installed, Transition};
pub use status::{ChannelInfo, ChannelStatus, ChannelSummary, ConnectionStatus};
