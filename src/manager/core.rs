use super::config::{ChannelConfig, RealtimeManagerOptions};
use super::monitor::{ConnectionMonitor, ObserverHandle};
use super::reconnect::{ReconnectDecision, ReconnectionPolicy};
use super::registry::{ChannelRegistry, Transition};
use super::status::{ChannelInfo, ChannelStatus, ConnectionStatus};
use crate::infrastructure::{TaskManager, invoke_guarded};
use crate::transport::{
    BroadcastMessage, ChannelHandle, RealtimeTransport, SendResponse, StatusCallback,
    TransportStatus,
};
use crate::types::{RealtimeError, Result, TransportError};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

/// Owns every realtime channel of an application.
///
/// `RealtimeManager` registers named channels with a transport, follows
/// their lifecycle, resubscribes them with exponential backoff after a
/// failure, and derives an aggregate connection signal. It is constructed
/// once by the application and handed to consumers by reference or clone;
/// clones share the same state.
///
/// All methods must be called from within a tokio runtime, and transports
/// must deliver status callbacks from within one.
///
/// # Example
///
/// ```no_run
/// use realtime_channel_manager::{ChannelConfig, MemoryTransport, RealtimeManager};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = RealtimeManager::new(Arc::new(MemoryTransport::new()));
///
/// manager
///     .subscribe(
///         ChannelConfig::new("orders")
///             .on("order_updated", |payload| println!("order changed: {payload}")),
///     )
///     .await?;
///
/// let _status = manager.on_connection_change(|connected| println!("connected: {connected}"));
///
/// // Fails with ChannelNotReady until the transport reports SUBSCRIBED.
/// manager
///     .send_message("orders", "order_updated", json!({"id": 42}))
///     .await?;
///
/// manager.cleanup().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RealtimeManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    registry: ChannelRegistry,
    policy: ReconnectionPolicy,
    monitor: ConnectionMonitor,
    options: RealtimeManagerOptions,
    tasks: Mutex<TaskManager>,
    /// Bumped by `cleanup` and `force_reconnect`; a bulk resubscribe started
    /// under an older epoch stops before touching the next channel.
    epoch: AtomicU64,
}

impl RealtimeManager {
    /// Creates a manager with default options.
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self::build(transport, RealtimeManagerOptions::default())
    }

    /// Creates a manager with custom options.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::InvalidConfig`] if the options fail validation.
    pub fn with_options(
        transport: Arc<dyn RealtimeTransport>,
        options: RealtimeManagerOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self::build(transport, options))
    }

    fn build(transport: Arc<dyn RealtimeTransport>, options: RealtimeManagerOptions) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: ChannelRegistry::new(transport),
                policy: ReconnectionPolicy::new(&options.reconnect),
                monitor: ConnectionMonitor::new(),
                options,
                tasks: Mutex::new(TaskManager::new()),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribes to a named channel.
    ///
    /// An existing channel with the same name is torn down first. The
    /// returned handle is live immediately, in `subscribing` status.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::InvalidConfig`] for an empty name or presence key.
    pub async fn subscribe(&self, config: ChannelConfig) -> Result<ChannelHandle> {
        self.inner.subscribe(config).await
    }

    /// Removes a channel and tears down its transport subscription.
    ///
    /// Unknown names are ignored and teardown failures are only logged.
    pub async fn unsubscribe(&self, name: &str) {
        let Some(entry) = self.inner.registry.take(name) else {
            tracing::debug!("Unsubscribe for unknown channel {} ignored", name);
            return;
        };
        ChannelRegistry::teardown(entry).await;
        self.inner.refresh_connected();
    }

    /// Broadcasts `payload` as `event` on a subscribed channel.
    ///
    /// # Errors
    ///
    /// - [`RealtimeError::ChannelNotFound`] if no channel has this name
    /// - [`RealtimeError::ChannelNotReady`] if it is not `subscribed`; nothing
    ///   is sent in that case
    ///
    /// Transport-level failures come back as a non-`Ok` [`SendResponse`].
    pub async fn send_message(
        &self,
        name: &str,
        event: &str,
        payload: Value,
    ) -> Result<SendResponse> {
        let handle = self.inner.registry.ready_handle(name)?;
        let response = handle.send(BroadcastMessage::new(event, payload)).await;

        match &response {
            SendResponse::Ok => tracing::debug!("Sent {} on channel {}", event, name),
            other => tracing::warn!("Send of {} on channel {} failed: {:?}", event, name, other),
        }
        Ok(response)
    }

    pub fn channel_info(&self, name: &str) -> Option<ChannelInfo> {
        self.inner.registry.info(name)
    }

    /// Registered channel names, sorted
    pub fn channel_names(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    /// # Errors
    ///
    /// Returns [`RealtimeError::ChannelNotFound`] for unknown names.
    pub fn channel_status(&self, name: &str) -> Result<ChannelStatus> {
        self.inner
            .registry
            .status(name)
            .ok_or_else(|| RealtimeError::ChannelNotFound(name.to_string()))
    }

    /// Snapshot of aggregate connectivity.
    ///
    /// `connected` is inferred from channel lifecycle, see [`ConnectionStatus`].
    pub fn connection_status(&self) -> ConnectionStatus {
        let channels = self.inner.registry.summaries();
        ConnectionStatus {
            connected: self.inner.monitor.is_connected(),
            channel_count: channels.len(),
            channels,
            reconnect_attempts: self.inner.policy.attempts(),
        }
    }

    /// Registers an observer for flips of the inferred connected flag.
    pub fn on_connection_change(
        &self,
        handler: impl Fn(bool) + Send + Sync + 'static,
    ) -> ObserverHandle {
        self.inner.monitor.on_connection_change(handler)
    }

    /// Registers an observer for channel errors and timeouts.
    pub fn on_error(
        &self,
        handler: impl Fn(&TransportError) + Send + Sync + 'static,
    ) -> ObserverHandle {
        self.inner.monitor.on_error(handler)
    }

    /// Resets the attempt counter and resubscribes every channel now,
    /// cancelling any scheduled attempt.
    pub async fn force_reconnect(&self) {
        tracing::info!("Forcing reconnection of all channels");
        let epoch = self.inner.next_epoch();
        self.inner.policy.cancel_pending();
        self.inner.policy.reset();
        self.inner.resubscribe_all(epoch).await;
    }

    /// Unsubscribes every channel, drops all observers and resets the
    /// reconnection state. Safe to call more than once.
    pub async fn cleanup(&self) {
        self.inner.next_epoch();
        self.inner.policy.cancel_pending();
        self.inner.policy.reset();
        self.inner.tasks().abort_all();

        let entries = self.inner.registry.drain();
        let count = entries.len();
        for entry in entries {
            ChannelRegistry::teardown(entry).await;
        }

        self.inner.refresh_connected();
        self.inner.monitor.clear();
        tracing::info!("Realtime manager cleaned up ({} channels)", count);
    }
}

impl ManagerInner {
    fn tasks(&self) -> MutexGuard<'_, TaskManager> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn binder(self: &Arc<Self>) -> impl FnOnce(&str, u64) -> StatusCallback + use<> {
        let weak = Arc::downgrade(self);
        move |name: &str, instance: u64| status_callback(weak, name.to_string(), instance)
    }

    async fn subscribe(self: &Arc<Self>, config: ChannelConfig) -> Result<ChannelHandle> {
        let name = config.name.clone();
        let installed = self.registry.subscribe(config, self.binder()).await?;

        // The replaced instance may have been the only subscribed one.
        self.refresh_connected();

        if installed.active {
            self.watch(name, installed.instance);
        }
        Ok(installed.handle)
    }

    /// Tears down and recreates every registered channel from its stored
    /// configuration. Stops early once `epoch` is superseded, and skips any
    /// channel that was removed or replaced after the snapshot was taken.
    async fn resubscribe_all(self: &Arc<Self>, epoch: u64) {
        let instances = self.registry.instances();
        tracing::info!("Resubscribing {} channel(s)", instances.len());

        for (name, instance) in instances {
            if self.current_epoch() != epoch {
                tracing::info!("Resubscribe superseded, stopping before channel {}", name);
                return;
            }
            let installed = self
                .registry
                .resubscribe(&name, instance, self.binder())
                .await;
            self.refresh_connected();

            if let Some(installed) = installed
                && installed.active
            {
                self.watch(name, installed.instance);
            }
        }
    }

    fn watch(self: &Arc<Self>, name: String, instance: u64) {
        if let Some(timeout) = self.options.subscribe_timeout() {
            self.spawn_watchdog(name, instance, timeout);
        }
    }

    /// Single entry point for every transport status.
    fn handle_status(self: &Arc<Self>, name: &str, instance: u64, status: TransportStatus) {
        tracing::debug!(
            "Channel {} (instance {}) reported {}",
            name,
            instance,
            status
        );
        if let Some(transition) = self.registry.apply(name, instance, &status, None) {
            self.dispatch(name, transition);
        }
    }

    fn dispatch(self: &Arc<Self>, name: &str, transition: Transition) {
        let callbacks = &transition.config.callbacks;

        match transition.status {
            ChannelStatus::Subscribing => {}
            ChannelStatus::Subscribed => {
                self.policy.reset();
                if let Some(on_subscribed) = &callbacks.on_subscribed {
                    invoke_guarded("on_subscribed callback", || on_subscribed());
                }
                self.refresh_connected();
                self.track_initial_presence(name, &transition);
            }
            ChannelStatus::Error => {
                let error = transition
                    .error
                    .clone()
                    .unwrap_or_else(|| TransportError::new("channel error"));
                if let Some(on_error) = &callbacks.on_error {
                    invoke_guarded("on_error callback", || on_error(&error));
                }
                self.monitor.notify_error(&error);
                self.refresh_connected();
                self.schedule_reconnect();
            }
            ChannelStatus::Closed => {
                if let Some(on_closed) = &callbacks.on_closed {
                    invoke_guarded("on_closed callback", || on_closed());
                }
                self.refresh_connected();
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let epoch = self.current_epoch();
        let decision = self.policy.on_failure(move || async move {
            if let Some(inner) = weak.upgrade() {
                inner.resubscribe_all(epoch).await;
            }
        });

        if let ReconnectDecision::Exhausted { attempts } = decision {
            tracing::warn!(
                "Staying disconnected after {} failed reconnection attempts",
                attempts
            );
        }
    }

    fn track_initial_presence(&self, name: &str, transition: &Transition) {
        let Some(state) = transition
            .config
            .presence
            .as_ref()
            .and_then(|presence| presence.initial_state.clone())
        else {
            return;
        };

        let handle = Arc::clone(&transition.handle);
        let name = name.to_string();
        self.tasks().spawn(async move {
            match handle.track(state).await {
                Ok(()) => tracing::debug!("Tracked initial presence on channel {}", name),
                Err(e) => tracing::warn!(
                    "Tracking presence on channel {} failed: {} (code: {:?})",
                    name,
                    e.message,
                    e.code
                ),
            }
        });
    }

    fn spawn_watchdog(self: &Arc<Self>, name: String, instance: u64, timeout: Duration) {
        let weak = Arc::downgrade(self);
        self.tasks().spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let transition = inner.registry.apply(
                &name,
                instance,
                &TransportStatus::TimedOut,
                Some(ChannelStatus::Subscribing),
            );
            if let Some(transition) = transition {
                tracing::warn!(
                    "Channel {} still subscribing after {}ms, treating as timed out",
                    name,
                    timeout.as_millis()
                );
                inner.dispatch(&name, transition);
            }
        });
    }

    fn refresh_connected(&self) {
        self.monitor.refresh(|| self.registry.any_subscribed());
    }
}

fn status_callback(weak: Weak<ManagerInner>, name: String, instance: u64) -> StatusCallback {
    Arc::new(move |status| {
        if let Some(inner) = weak.upgrade() {
            inner.handle_status(&name, instance, status);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{PresenceConfig, ReconnectConfig};
    use crate::transport::{MemoryTransport, PresenceEvent};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<MemoryTransport>, RealtimeManager) {
        let transport = Arc::new(MemoryTransport::new());
        let manager = RealtimeManager::new(transport.clone());
        (transport, manager)
    }

    /// Lets spawned tasks run to completion
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(Value) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&count);
        (count, move |_| {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn channel_error(message: &str) -> TransportStatus {
        TransportStatus::Errored {
            cause: Some(TransportError::new(message)),
        }
    }

    #[tokio::test]
    async fn test_subscribe_then_info_is_subscribing() {
        let (_, manager) = setup();
        for name in ["orders", "drivers", "order:42"] {
            manager.subscribe(ChannelConfig::new(name)).await.unwrap();
            let info = manager.channel_info(name).unwrap();
            assert_eq!(info.status, ChannelStatus::Subscribing);
            assert_eq!(info.error, None);
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_is_harmless() {
        let (transport, manager) = setup();
        manager.subscribe(ChannelConfig::new("orders")).await.unwrap();

        manager.unsubscribe("orders").await;
        assert!(manager.channel_info("orders").is_none());
        manager.unsubscribe("orders").await;
        assert!(manager.channel_info("orders").is_none());

        assert_eq!(transport.channel("orders").unwrap().teardown_count(), 1);
    }

    #[tokio::test]
    async fn test_teardown_failure_is_swallowed() {
        let (transport, manager) = setup();
        manager.subscribe(ChannelConfig::new("orders")).await.unwrap();
        transport.fail_teardown(Some(TransportError::new("socket already closed")));

        manager.unsubscribe("orders").await;
        assert!(manager.channel_names().is_empty());
    }

    #[tokio::test]
    async fn test_resubscribe_same_name_tears_down_first_once() {
        let (transport, manager) = setup();
        manager.subscribe(ChannelConfig::new("orders")).await.unwrap();
        manager.subscribe(ChannelConfig::new("orders")).await.unwrap();

        let created = transport.channels_named("orders");
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].teardown_count(), 1);
        assert_eq!(created[1].teardown_count(), 0);
        assert_eq!(manager.channel_names(), vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_late_status_from_replaced_instance_is_discarded() {
        let (transport, manager) = setup();
        manager.subscribe(ChannelConfig::new("orders")).await.unwrap();
        let stale = transport.channel("orders").unwrap();
        manager.subscribe(ChannelConfig::new("orders")).await.unwrap();

        stale.emit(TransportStatus::Subscribed);

        assert_eq!(
            manager.channel_status("orders").unwrap(),
            ChannelStatus::Subscribing
        );
        assert!(!manager.connection_status().connected);
    }

    #[tokio::test]
    async fn test_late_status_after_unsubscribe_does_not_reinsert() {
        let (transport, manager) = setup();
        manager.subscribe(ChannelConfig::new("orders")).await.unwrap();
        let removed = transport.channel("orders").unwrap();
        manager.unsubscribe("orders").await;

        removed.emit(TransportStatus::Subscribed);
        removed.emit(channel_error("late"));

        assert!(manager.channel_info("orders").is_none());
        assert_eq!(manager.connection_status().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_send_rejected_unless_subscribed() {
        let (transport, manager) = setup();

        let missing = manager.send_message("orders", "ping", json!({})).await;
        assert!(matches!(missing, Err(RealtimeError::ChannelNotFound(_))));

        manager.subscribe(ChannelConfig::new("orders")).await.unwrap();
        let pending = manager.send_message("orders", "ping", json!({})).await;
        assert!(matches!(
            pending,
            Err(RealtimeError::ChannelNotReady {
                status: ChannelStatus::Subscribing,
                ..
            })
        ));

        transport.emit("orders", channel_error("join failed"));
        let errored = manager.send_message("orders", "ping", json!({})).await;
        assert!(matches!(
            errored,
            Err(RealtimeError::ChannelNotReady {
                status: ChannelStatus::Error,
                ..
            })
        ));

        assert!(transport.channel("orders").unwrap().sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_on_subscribed_channel_reaches_transport() {
        let (transport, manager) = setup();
        manager.subscribe(ChannelConfig::new("orders")).await.unwrap();
        transport.emit("orders", TransportStatus::Subscribed);

        let response = manager
            .send_message("orders", "order_updated", json!({"id": 42}))
            .await
            .unwrap();
        assert_eq!(response, SendResponse::Ok);

        transport.set_send_response(SendResponse::TimedOut);
        let response = manager
            .send_message("orders", "order_updated", json!({"id": 43}))
            .await
            .unwrap();
        assert_eq!(response, SendResponse::TimedOut);

        let sent = transport.channel("orders").unwrap().sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], BroadcastMessage::new("order_updated", json!({"id": 42})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_schedules_resubscribe_with_original_handlers() {
        let (transport, manager) = setup();
        let (inserts, on_insert) = counter();
        manager
            .subscribe(ChannelConfig::new("orders").on("INSERT", on_insert))
            .await
            .unwrap();

        transport.emit("orders", TransportStatus::Subscribed);
        let status = manager.connection_status();
        assert!(status.connected);
        assert_eq!(status.channels.len(), 1);
        assert_eq!(status.channels[0].name, "orders");
        assert_eq!(status.channels[0].status, ChannelStatus::Subscribed);

        transport.emit("orders", channel_error("CHANNEL_ERROR"));
        assert_eq!(manager.connection_status().reconnect_attempts, 1);
        assert!(!manager.connection_status().connected);

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(transport.channels_named("orders").len(), 1);

        tokio::time::sleep(Duration::from_millis(2)).await;
        settle().await;

        let created = transport.channels_named("orders");
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].teardown_count(), 1);
        assert_eq!(created[1].event_names(), vec!["INSERT"]);
        assert_eq!(
            manager.channel_status("orders").unwrap(),
            ChannelStatus::Subscribing
        );

        assert_eq!(transport.deliver("orders", "INSERT", json!({"id": 1})), 1);
        assert_eq!(inserts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sequence_caps_at_max_attempts() {
        let (transport, manager) = setup();
        manager.subscribe(ChannelConfig::new("orders")).await.unwrap();

        for attempt in 1..=5u32 {
            transport.emit("orders", channel_error("connection refused"));
            assert_eq!(manager.connection_status().reconnect_attempts, attempt);

            let delay = Duration::from_millis(1000 * 2u64.pow(attempt - 1));
            let before = transport.created_count();
            tokio::time::sleep(delay - Duration::from_millis(1)).await;
            assert_eq!(transport.created_count(), before);
            tokio::time::sleep(Duration::from_millis(2)).await;
            settle().await;
            assert_eq!(transport.created_count(), before + 1);
        }

        transport.emit("orders", channel_error("connection refused"));
        assert_eq!(manager.connection_status().reconnect_attempts, 5);

        let before = transport.created_count();
        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(transport.created_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_while_pending_does_not_schedule_twice() {
        let (transport, manager) = setup();
        manager.subscribe(ChannelConfig::new("orders")).await.unwrap();
        manager.subscribe(ChannelConfig::new("drivers")).await.unwrap();

        transport.emit("orders", channel_error("down"));
        transport.emit("drivers", channel_error("down"));
        assert_eq!(manager.connection_status().reconnect_attempts, 1);

        tokio::time::sleep(Duration::from_millis(1001)).await;
        settle().await;

        assert_eq!(transport.channels_named("orders").len(), 2);
        assert_eq!(transport.channels_named("drivers").len(), 2);
        assert_eq!(transport.created_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribed_resets_attempts() {
        let (transport, manager) = setup();
        manager.subscribe(ChannelConfig::new("orders")).await.unwrap();

        transport.emit("orders", channel_error("down"));
        tokio::time::sleep(Duration::from_millis(1001)).await;
        settle().await;
        assert_eq!(manager.connection_status().reconnect_attempts, 1);

        transport.emit("orders", TransportStatus::Subscribed);
        assert_eq!(manager.connection_status().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reconnect_after_exhaustion() {
        let transport = Arc::new(MemoryTransport::new());
        let options = RealtimeManagerOptions {
            reconnect: ReconnectConfig {
                max_attempts: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let manager = RealtimeManager::with_options(transport.clone(), options).unwrap();
        manager.subscribe(ChannelConfig::new("orders")).await.unwrap();

        transport.emit("orders", channel_error("down"));
        tokio::time::sleep(Duration::from_millis(1001)).await;
        settle().await;
        transport.emit("orders", channel_error("still down"));
        assert_eq!(manager.connection_status().reconnect_attempts, 1);
        assert_eq!(transport.created_count(), 2);

        manager.force_reconnect().await;
        assert_eq!(manager.connection_status().reconnect_attempts, 0);
        assert_eq!(transport.created_count(), 3);
        assert_eq!(
            manager.channel_status("orders").unwrap(),
            ChannelStatus::Subscribing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reconnect_cancels_pending_attempt() {
        let (transport, manager) = setup();
        manager.subscribe(ChannelConfig::new("orders")).await.unwrap();
        transport.emit("orders", channel_error("down"));

        manager.force_reconnect().await;
        assert_eq!(transport.created_count(), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(transport.created_count(), 2);
    }

    #[tokio::test]
    async fn test_lifecycle_callbacks_and_observers() {
        let (transport, manager) = setup();
        let events = Arc::new(Mutex::new(Vec::<String>::new()));

        let log = |tag: &'static str| {
            let events = Arc::clone(&events);
            move || events.lock().unwrap().push(tag.to_string())
        };
        let error_log = Arc::clone(&events);
        let config = ChannelConfig::new("orders")
            .on_subscribed(log("subscribed"))
            .on_closed(log("closed"))
            .on_error(move |e| error_log.lock().unwrap().push(format!("error:{e}")));

        let connection_log = Arc::clone(&events);
        let _connection = manager.on_connection_change(move |connected| {
            connection_log
                .lock()
                .unwrap()
                .push(format!("connected:{connected}"))
        });
        let observed_log = Arc::clone(&events);
        let _errors = manager.on_error(move |e| {
            observed_log
                .lock()
                .unwrap()
                .push(format!("observed:{e}"))
        });

        manager.subscribe(config).await.unwrap();
        transport.emit("orders", TransportStatus::Subscribed);
        transport.emit("orders", TransportStatus::Closed);

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "subscribed".to_string(),
                "connected:true".to_string(),
                "closed".to_string(),
                "connected:false".to_string(),
            ]
        );

        manager.subscribe(ChannelConfig::new("drivers")).await.unwrap();
        transport.emit("drivers", TransportStatus::TimedOut);
        assert!(
            events
                .lock()
                .unwrap()
                .contains(&"observed:subscription timed out".to_string())
        );
        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_connected_stays_true_while_any_channel_subscribed() {
        let (transport, manager) = setup();
        manager.subscribe(ChannelConfig::new("orders")).await.unwrap();
        manager.subscribe(ChannelConfig::new("drivers")).await.unwrap();
        transport.emit("orders", TransportStatus::Subscribed);
        transport.emit("drivers", TransportStatus::Subscribed);

        transport.emit("drivers", TransportStatus::Closed);
        assert!(manager.connection_status().connected);

        manager.unsubscribe("orders").await;
        assert!(!manager.connection_status().connected);
    }

    #[tokio::test]
    async fn test_presence_wiring_and_initial_track() {
        let (transport, manager) = setup();
        let (joins, on_join) = counter();
        let config = ChannelConfig::new("drivers").presence(
            PresenceConfig::new("driver-17")
                .initial_state(json!({"status": "online"}))
                .on_join(on_join),
        );
        manager.subscribe(config).await.unwrap();

        let channel = transport.channel("drivers").unwrap();
        assert_eq!(channel.options().presence_key.as_deref(), Some("driver-17"));
        assert!(channel.tracked().is_empty());

        transport.emit("drivers", TransportStatus::Subscribed);
        settle().await;
        assert_eq!(channel.tracked(), vec![json!({"status": "online"})]);

        transport.deliver_presence("drivers", PresenceEvent::Join, json!({"key": "driver-9"}));
        assert_eq!(joins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_track_is_not_fatal() {
        let (transport, manager) = setup();
        transport.fail_track(Some(TransportError::new("presence disabled")));
        let config = ChannelConfig::new("drivers")
            .presence(PresenceConfig::new("driver-17").initial_state(json!({})));
        manager.subscribe(config).await.unwrap();

        transport.emit("drivers", TransportStatus::Subscribed);
        settle().await;

        assert_eq!(
            manager.channel_status("drivers").unwrap(),
            ChannelStatus::Subscribed
        );
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_break_dispatch() {
        let (transport, manager) = setup();
        manager
            .subscribe(ChannelConfig::new("orders").on_subscribed(|| panic!("bad consumer")))
            .await
            .unwrap();

        transport.emit("orders", TransportStatus::Subscribed);
        assert!(manager.connection_status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_times_out_silent_channel() {
        let transport = Arc::new(MemoryTransport::new());
        let options = RealtimeManagerOptions {
            subscribe_timeout_ms: Some(5000),
            ..Default::default()
        };
        let manager = RealtimeManager::with_options(transport.clone(), options).unwrap();
        manager.subscribe(ChannelConfig::new("silent")).await.unwrap();
        manager.subscribe(ChannelConfig::new("healthy")).await.unwrap();
        transport.emit("healthy", TransportStatus::Subscribed);

        tokio::time::sleep(Duration::from_millis(5001)).await;
        settle().await;

        let silent = manager.channel_info("silent").unwrap();
        assert_eq!(silent.status, ChannelStatus::Error);
        assert_eq!(silent.error.unwrap().code.as_deref(), Some("TIMED_OUT"));
        assert_eq!(
            manager.channel_status("healthy").unwrap(),
            ChannelStatus::Subscribed
        );
        assert_eq!(manager.connection_status().reconnect_attempts, 1);
    }

    #[tokio::test]
    async fn test_cleanup_clears_everything_and_is_idempotent() {
        let (transport, manager) = setup();
        for name in ["orders", "drivers", "notifications"] {
            manager.subscribe(ChannelConfig::new(name)).await.unwrap();
            transport.emit(name, TransportStatus::Subscribed);
        }
        let _observer = manager.on_connection_change(|_| {});
        assert!(manager.connection_status().connected);

        manager.cleanup().await;

        assert!(manager.channel_names().is_empty());
        let status = manager.connection_status();
        assert_eq!(status.channel_count, 0);
        assert!(!status.connected);
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(manager.inner.monitor.observer_count(), 0);
        for name in ["orders", "drivers", "notifications"] {
            assert_eq!(transport.channel(name).unwrap().teardown_count(), 1);
        }

        manager.cleanup().await;
        assert!(manager.channel_names().is_empty());
    }

    /// Two channels over a transport with slow teardown, caught in the middle
    /// of the first bulk resubscribe: "drivers" has been replaced and its old
    /// instance is still being torn down, "orders" has not been reached yet.
    async fn mid_resubscribe() -> (Arc<MemoryTransport>, RealtimeManager) {
        let (transport, manager) = setup();
        transport.set_teardown_delay(Duration::from_millis(500));
        manager.subscribe(ChannelConfig::new("drivers")).await.unwrap();
        manager.subscribe(ChannelConfig::new("orders")).await.unwrap();

        transport.emit("orders", channel_error("socket closed"));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(transport.channels_named("drivers").len(), 2);
        assert_eq!(transport.channels_named("orders").len(), 1);
        (transport, manager)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_during_resubscribe_keeps_registry_empty() {
        let (transport, manager) = mid_resubscribe().await;

        manager.cleanup().await;
        assert!(manager.channel_names().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;

        assert!(manager.channel_names().is_empty());
        assert_eq!(manager.connection_status().channel_count, 0);
        assert_eq!(transport.created_count(), 3);
        assert_eq!(transport.channels_named("drivers")[1].subscribe_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_during_resubscribe_is_not_undone() {
        let (transport, manager) = mid_resubscribe().await;

        manager.unsubscribe("orders").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(manager.channel_names(), vec!["drivers".to_string()]);
        assert_eq!(transport.channels_named("orders").len(), 1);
        assert_eq!(transport.channels_named("drivers")[1].subscribe_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reconnect_supersedes_running_resubscribe() {
        let (transport, manager) = mid_resubscribe().await;

        manager.force_reconnect().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(
            manager.channel_names(),
            vec!["drivers".to_string(), "orders".to_string()]
        );
        let drivers: Vec<usize> = transport
            .channels_named("drivers")
            .iter()
            .map(|channel| channel.subscribe_count())
            .collect();
        assert_eq!(drivers, vec![1, 0, 1]);
        assert_eq!(transport.channels_named("orders").len(), 2);
        assert_eq!(transport.created_count(), 5);
        assert_eq!(manager.connection_status().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_channel_status_unknown_name() {
        let (_, manager) = setup();
        assert!(matches!(
            manager.channel_status("ghost"),
            Err(RealtimeError::ChannelNotFound(name)) if name == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_with_options_rejects_invalid_config() {
        let options = RealtimeManagerOptions {
            subscribe_timeout_ms: Some(0),
            ..Default::default()
        };
        let result = RealtimeManager::with_options(Arc::new(MemoryTransport::new()), options);
        assert!(matches!(result, Err(RealtimeError::InvalidConfig(_))));
    }
}
