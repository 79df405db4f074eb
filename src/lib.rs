//! # Realtime Channel Manager
//!
//! A single owner for every realtime channel an application listens on.
//!
//! The [`RealtimeManager`] registers named channels with a transport, keeps
//! their lifecycle status, resubscribes them with bounded exponential backoff
//! after failures, and infers an aggregate connected flag from channel
//! lifecycle. Transports plug in through [`RealtimeTransport`]; the crate
//! ships [`PhoenixTransport`] for Phoenix-channels WebSocket backends and
//! [`MemoryTransport`] for tests.
//!
//! ## Example
//!
//! ```no_run
//! use realtime_channel_manager::{ChannelConfig, PhoenixOptions, PhoenixTransport, RealtimeManager};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = PhoenixTransport::new(
//!         "wss://your-project.supabase.co/realtime/v1/websocket",
//!         PhoenixOptions::new("your-anon-key"),
//!     )?;
//!     let manager = RealtimeManager::new(Arc::new(transport));
//!
//!     manager
//!         .subscribe(
//!             ChannelConfig::new("orders")
//!                 .on("order_updated", |payload| println!("order changed: {payload}"))
//!                 .on_error(|e| eprintln!("orders channel failed: {e}")),
//!         )
//!         .await?;
//!
//!     let _watch = manager.on_connection_change(|connected| {
//!         println!("realtime {}", if connected { "online" } else { "offline" });
//!     });
//!
//!     tokio::signal::ctrl_c().await?;
//!     manager.cleanup().await;
//!     Ok(())
//! }
//! ```

pub mod infrastructure;
pub mod manager;
pub mod transport;
pub mod types;

pub use manager::{
    ChannelConfig, ChannelInfo, ChannelStatus, ChannelSummary, ConnectionStatus, ObserverHandle,
    PresenceConfig, RealtimeManager, RealtimeManagerOptions, ReconnectConfig,
};
pub use transport::{
    BroadcastMessage, ChannelHandle, ChannelOptions, EventHandler, MemoryChannel,
    MemoryTransport, PhoenixOptions, PhoenixTransport, PresenceEvent, RealtimeTransport,
    SendResponse, StatusCallback, TransportChannel, TransportStatus,
};
pub use types::{RealtimeError, Result, TransportError};
