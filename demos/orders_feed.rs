use realtime_channel_manager::{
    ChannelConfig, PhoenixOptions, PhoenixTransport, PresenceConfig, RealtimeManager,
    RealtimeManagerOptions,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Follows order updates and driver presence against a live backend.
///
/// Reads `SUPABASE_URL` and `SUPABASE_API_KEY` from the environment (or `.env`).
/// Interrupt your network while it runs to watch channels fail and recover.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("realtime_channel_manager=debug,info")),
        )
        .init();

    let url = std::env::var("SUPABASE_URL").expect("SUPABASE_URL must be set in .env");
    let api_key = std::env::var("SUPABASE_API_KEY").expect("SUPABASE_API_KEY must be set in .env");
    let endpoint = format!(
        "{}/realtime/v1/websocket",
        url.trim_end_matches('/')
            .replace("https://", "wss://")
            .replace("http://", "ws://")
    );

    println!("📡 Connecting to: {}\n", endpoint);

    let transport = Arc::new(PhoenixTransport::new(&endpoint, PhoenixOptions::new(api_key))?);
    let manager = RealtimeManager::with_options(
        transport.clone(),
        RealtimeManagerOptions {
            subscribe_timeout_ms: Some(15_000),
            ..Default::default()
        },
    )?;

    let _connection = manager.on_connection_change(|connected| {
        println!(
            "{} realtime {}",
            if connected { "✅" } else { "⚠️ " },
            if connected { "online" } else { "offline" }
        );
    });
    let _errors = manager.on_error(|e| println!("❌ channel error: {} ({:?})", e, e.code));

    manager
        .subscribe(
            ChannelConfig::new("orders")
                .on("order_updated", |payload| {
                    println!("📦 order updated: {}", payload["payload"]);
                })
                .on_subscribed(|| println!("👂 listening for order updates")),
        )
        .await?;

    manager
        .subscribe(
            ChannelConfig::new("drivers").presence(
                PresenceConfig::new("demo-driver")
                    .initial_state(json!({"status": "online"}))
                    .on_join(|payload| println!("🚚 joined: {}", payload["key"]))
                    .on_leave(|payload| println!("👋 left: {}", payload["key"])),
            ),
        )
        .await?;

    tokio::time::sleep(Duration::from_secs(3)).await;

    match manager
        .send_message("orders", "order_updated", json!({"id": 1, "status": "dispatched"}))
        .await
    {
        Ok(response) => println!("📤 broadcast sent: {:?}", response),
        Err(e) => println!("📤 broadcast rejected: {}", e),
    }

    for _ in 0..30 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = manager.connection_status();
        println!(
            "connected={} channels={} attempts={}",
            status.connected, status.channel_count, status.reconnect_attempts
        );
    }

    println!("\n🧹 Cleaning up...");
    manager.cleanup().await;
    transport.disconnect().await;
    println!("🎉 Done");

    Ok(())
}
