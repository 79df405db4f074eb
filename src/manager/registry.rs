use super::config::ChannelConfig;
use super::status::{ChannelInfo, ChannelStatus, ChannelSummary};
use crate::transport::{
    ChannelHandle, ChannelOptions, PresenceEvent, RealtimeTransport, StatusCallback,
    TransportStatus,
};
use crate::types::{RealtimeError, Result, TIMED_OUT_CODE, TransportError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A registered channel instance.
pub struct ChannelEntry {
    pub instance: u64,
    pub config: ChannelConfig,
    pub handle: ChannelHandle,
    pub status: ChannelStatus,
    pub error: Option<TransportError>,
}

/// A freshly registered instance.
pub struct Installed {
    pub instance: u64,
    pub handle: ChannelHandle,
    /// `false` when the instance was removed before the transport subscribe
    /// was issued
    pub active: bool,
}

/// Outcome of applying a transport status to a live instance.
pub struct Transition {
    pub previous: ChannelStatus,
    pub status: ChannelStatus,
    pub error: Option<TransportError>,
    pub config: ChannelConfig,
    pub handle: ChannelHandle,
}

/// Single source of truth for channel name → instance and status.
pub struct ChannelRegistry {
    transport: Arc<dyn RealtimeTransport>,
    entries: Mutex<HashMap<String, ChannelEntry>>,
    next_instance: AtomicU64,
}

impl ChannelRegistry {
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self {
            transport,
            entries: Mutex::new(HashMap::new()),
            next_instance: AtomicU64::new(1),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, ChannelEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates a fresh instance for `config`, replacing any channel with the
    /// same name, and issues the transport subscribe.
    ///
    /// `bind` builds the status callback for the new instance id.
    pub async fn subscribe(
        &self,
        config: ChannelConfig,
        bind: impl FnOnce(&str, u64) -> StatusCallback,
    ) -> Result<Installed> {
        config.validate()?;
        let name = config.name.clone();
        self.install(config, None, bind)
            .await
            .ok_or(RealtimeError::ChannelNotFound(name))
    }

    /// Recreates the channel from its stored configuration, but only while
    /// `instance` is still the registered one.
    ///
    /// Returns `None` when the channel was removed or replaced since the
    /// caller looked it up; nothing is sent to the transport in that case.
    pub async fn resubscribe(
        &self,
        name: &str,
        instance: u64,
        bind: impl FnOnce(&str, u64) -> StatusCallback,
    ) -> Option<Installed> {
        let config = {
            let entries = self.entries();
            let entry = entries.get(name).filter(|entry| entry.instance == instance);
            entry.map(|entry| entry.config.clone())
        };
        let Some(config) = config else {
            tracing::debug!(
                "Skipping resubscribe of channel {}: instance {} is gone",
                name,
                instance
            );
            return None;
        };

        let installed = self.install(config, Some(instance), bind).await;
        if installed.is_none() {
            tracing::debug!(
                "Skipping resubscribe of channel {}: replaced concurrently",
                name
            );
        }
        installed
    }

    /// Registers a new instance in place of the current one (or only in
    /// place of `replacing` when given), tears the displaced instance down,
    /// then subscribes the new one unless it was removed during teardown.
    async fn install(
        &self,
        config: ChannelConfig,
        replacing: Option<u64>,
        bind: impl FnOnce(&str, u64) -> StatusCallback,
    ) -> Option<Installed> {
        let name = config.name.clone();
        let options = ChannelOptions {
            presence_key: config.presence.as_ref().map(|p| p.key.clone()),
        };
        let handle = self.transport.create_channel(&name, options);

        for (event, handler) in &config.events {
            handle.on(event, Arc::clone(handler));
        }
        if let Some(presence) = &config.presence {
            let hooks = [
                (PresenceEvent::Sync, &presence.on_sync),
                (PresenceEvent::Join, &presence.on_join),
                (PresenceEvent::Leave, &presence.on_leave),
            ];
            for (event, handler) in hooks {
                if let Some(handler) = handler {
                    handle.on_presence(event, Arc::clone(handler));
                }
            }
        }

        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst);
        let displaced = {
            let mut entries = self.entries();
            if let Some(expected) = replacing
                && entries.get(&name).map(|entry| entry.instance) != Some(expected)
            {
                return None;
            }
            entries.insert(
                name.clone(),
                ChannelEntry {
                    instance,
                    config,
                    handle: Arc::clone(&handle),
                    status: ChannelStatus::Subscribing,
                    error: None,
                },
            )
        };

        if let Some(previous) = displaced {
            tracing::debug!(
                "Replacing channel {} (instance {})",
                name,
                previous.instance
            );
            Self::teardown(previous).await;
        }

        let active = self.is_current(&name, instance);
        if active {
            tracing::info!("Subscribing to channel: {} (instance {})", name, instance);
            handle.subscribe(bind(&name, instance));
            // Removed between the check and the subscribe: the remover's
            // teardown may already have run.
            if !self.is_current(&name, instance)
                && let Err(e) = handle.unsubscribe().await
            {
                tracing::warn!("Teardown of channel {} failed: {}", name, e.message);
            }
        } else {
            tracing::debug!(
                "Channel {} (instance {}) was removed before it subscribed",
                name,
                instance
            );
        }

        Some(Installed {
            instance,
            handle,
            active,
        })
    }

    /// Whether `instance` is the registered instance of `name`
    pub fn is_current(&self, name: &str, instance: u64) -> bool {
        self.entries()
            .get(name)
            .is_some_and(|entry| entry.instance == instance)
    }

    /// Removes the entry without touching the transport
    pub fn take(&self, name: &str) -> Option<ChannelEntry> {
        self.entries().remove(name)
    }

    /// Removes every entry
    pub fn drain(&self) -> Vec<ChannelEntry> {
        self.entries().drain().map(|(_, entry)| entry).collect()
    }

    /// Best-effort transport teardown; failures are logged and swallowed.
    pub async fn teardown(entry: ChannelEntry) {
        let name = entry.config.name;
        match entry.handle.unsubscribe().await {
            Ok(()) => tracing::info!("Unsubscribed from channel: {}", name),
            Err(e) => tracing::warn!(
                "Teardown of channel {} failed: {} (details: {:?}, hint: {:?}, code: {:?})",
                name,
                e.message,
                e.details,
                e.hint,
                e.code
            ),
        }
    }

    /// Applies a transport status to the instance it was issued for.
    ///
    /// Returns `None` when the callback is stale (channel removed or
    /// replaced), when it is not a forward transition, or when `only_from`
    /// is given and does not match the current status.
    pub fn apply(
        &self,
        name: &str,
        instance: u64,
        status: &TransportStatus,
        only_from: Option<ChannelStatus>,
    ) -> Option<Transition> {
        let mut entries = self.entries();

        let Some(entry) = entries.get_mut(name) else {
            tracing::debug!(
                "Discarding {} for removed channel {} (instance {})",
                status,
                name,
                instance
            );
            return None;
        };
        if entry.instance != instance {
            tracing::debug!(
                "Discarding {} for stale instance {} of channel {} (current {})",
                status,
                instance,
                name,
                entry.instance
            );
            return None;
        }
        if let Some(expected) = only_from
            && entry.status != expected
        {
            return None;
        }

        let next = ChannelStatus::from(status);
        if !entry.status.can_transition_to(next) {
            tracing::debug!(
                "Ignoring {} for channel {} in status {}",
                status,
                name,
                entry.status
            );
            return None;
        }

        let previous = entry.status;
        entry.status = next;
        match status {
            TransportStatus::Subscribed => {
                entry.error = None;
                tracing::info!("Channel {} subscribed", name);
            }
            TransportStatus::Errored { cause } => {
                let error = cause
                    .clone()
                    .unwrap_or_else(|| TransportError::new("channel error"));
                log_failure(name, status, &error);
                entry.error = Some(error);
            }
            TransportStatus::TimedOut => {
                let error = TransportError::new("subscription timed out").with_code(TIMED_OUT_CODE);
                log_failure(name, status, &error);
                entry.error = Some(error);
            }
            TransportStatus::Closed => {
                tracing::info!("Channel {} closed (was {})", name, previous);
            }
            TransportStatus::Subscribing => {}
        }

        Some(Transition {
            previous,
            status: next,
            error: entry.error.clone(),
            config: entry.config.clone(),
            handle: Arc::clone(&entry.handle),
        })
    }

    pub fn info(&self, name: &str) -> Option<ChannelInfo> {
        self.entries().get(name).map(|entry| ChannelInfo {
            name: name.to_string(),
            status: entry.status,
            error: entry.error.clone(),
        })
    }

    pub fn status(&self, name: &str) -> Option<ChannelStatus> {
        self.entries().get(name).map(|entry| entry.status)
    }

    /// Handle of a channel that is ready to send
    pub fn ready_handle(&self, name: &str) -> Result<ChannelHandle> {
        let entries = self.entries();
        let entry = entries
            .get(name)
            .ok_or_else(|| RealtimeError::ChannelNotFound(name.to_string()))?;

        if entry.status != ChannelStatus::Subscribed {
            return Err(RealtimeError::ChannelNotReady {
                name: name.to_string(),
                status: entry.status,
            });
        }
        Ok(Arc::clone(&entry.handle))
    }

    /// Sorted channel names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn summaries(&self) -> Vec<ChannelSummary> {
        let mut summaries: Vec<ChannelSummary> = self
            .entries()
            .iter()
            .map(|(name, entry)| ChannelSummary {
                name: name.clone(),
                status: entry.status,
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Registered `(name, instance)` pairs, sorted by channel name
    pub fn instances(&self) -> Vec<(String, u64)> {
        let mut instances: Vec<(String, u64)> = self
            .entries()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.instance))
            .collect();
        instances.sort();
        instances
    }

    pub fn any_subscribed(&self) -> bool {
        self.entries()
            .values()
            .any(|entry| entry.status == ChannelStatus::Subscribed)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

fn log_failure(name: &str, status: &TransportStatus, error: &TransportError) {
    tracing::warn!(
        "Channel {} reported {}: {} (details: {:?}, hint: {:?}, code: {:?})",
        name,
        status,
        error.message,
        error.details,
        error.hint,
        error.code
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::PresenceConfig;
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use std::time::Duration;

    fn noop_bind() -> impl FnOnce(&str, u64) -> StatusCallback {
        |_: &str, _: u64| -> StatusCallback { Arc::new(|_: TransportStatus| {}) }
    }

    fn registry() -> (Arc<MemoryTransport>, ChannelRegistry) {
        let transport = Arc::new(MemoryTransport::new());
        let registry = ChannelRegistry::new(transport.clone());
        (transport, registry)
    }

    #[tokio::test]
    async fn test_subscribe_starts_in_subscribing() {
        let (_, registry) = registry();
        registry
            .subscribe(ChannelConfig::new("orders"), noop_bind())
            .await
            .unwrap();

        assert_eq!(registry.status("orders"), Some(ChannelStatus::Subscribing));
        assert_eq!(registry.names(), vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_handlers_attached_before_subscribe() {
        let (transport, registry) = registry();
        let config = ChannelConfig::new("orders")
            .on("INSERT", |_| {})
            .on("UPDATE", |_| {})
            .presence(
                PresenceConfig::new("driver-1")
                    .on_join(|_| {})
                    .on_sync(|_| {}),
            );

        registry.subscribe(config, noop_bind()).await.unwrap();

        let channel = transport.channel("orders").unwrap();
        assert_eq!(channel.event_names(), vec!["INSERT", "UPDATE"]);
        assert_eq!(
            channel.presence_events(),
            vec![PresenceEvent::Sync, PresenceEvent::Join]
        );
        assert_eq!(channel.options().presence_key.as_deref(), Some("driver-1"));
        assert_eq!(channel.subscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_name_rejected_without_transport_call() {
        let (transport, registry) = registry();
        let result = registry.subscribe(ChannelConfig::new(""), noop_bind()).await;

        assert!(matches!(result, Err(RealtimeError::InvalidConfig(_))));
        assert_eq!(transport.created_count(), 0);
    }

    #[tokio::test]
    async fn test_apply_discards_stale_instance() {
        let (_, registry) = registry();
        let first = registry
            .subscribe(ChannelConfig::new("orders"), noop_bind())
            .await
            .unwrap()
            .instance;
        let second = registry
            .subscribe(ChannelConfig::new("orders"), noop_bind())
            .await
            .unwrap()
            .instance;

        assert!(
            registry
                .apply("orders", first, &TransportStatus::Subscribed, None)
                .is_none()
        );
        assert_eq!(registry.status("orders"), Some(ChannelStatus::Subscribing));

        let transition = registry
            .apply("orders", second, &TransportStatus::Subscribed, None)
            .unwrap();
        assert_eq!(transition.previous, ChannelStatus::Subscribing);
        assert_eq!(transition.status, ChannelStatus::Subscribed);
    }

    #[tokio::test]
    async fn test_terminal_status_is_sticky() {
        let (_, registry) = registry();
        let instance = registry
            .subscribe(ChannelConfig::new("orders"), noop_bind())
            .await
            .unwrap()
            .instance;

        let cause = TransportError::new("join rejected").with_code("403");
        registry
            .apply(
                "orders",
                instance,
                &TransportStatus::Errored { cause: Some(cause.clone()) },
                None,
            )
            .unwrap();

        assert!(
            registry
                .apply("orders", instance, &TransportStatus::Subscribed, None)
                .is_none()
        );
        let info = registry.info("orders").unwrap();
        assert_eq!(info.status, ChannelStatus::Error);
        assert_eq!(info.error, Some(cause));
    }

    #[tokio::test]
    async fn test_timeout_stores_synthetic_error() {
        let (_, registry) = registry();
        let instance = registry
            .subscribe(ChannelConfig::new("orders"), noop_bind())
            .await
            .unwrap()
            .instance;

        registry
            .apply("orders", instance, &TransportStatus::TimedOut, None)
            .unwrap();

        let error = registry.info("orders").unwrap().error.unwrap();
        assert_eq!(error.code.as_deref(), Some(TIMED_OUT_CODE));
    }

    #[tokio::test]
    async fn test_only_from_guards_transition() {
        let (_, registry) = registry();
        let instance = registry
            .subscribe(ChannelConfig::new("orders"), noop_bind())
            .await
            .unwrap()
            .instance;
        registry.apply("orders", instance, &TransportStatus::Subscribed, None);

        let guarded = registry.apply(
            "orders",
            instance,
            &TransportStatus::TimedOut,
            Some(ChannelStatus::Subscribing),
        );
        assert!(guarded.is_none());
        assert_eq!(registry.status("orders"), Some(ChannelStatus::Subscribed));
    }

    #[tokio::test]
    async fn test_ready_handle_errors() {
        let (_, registry) = registry();
        assert!(matches!(
            registry.ready_handle("orders"),
            Err(RealtimeError::ChannelNotFound(_))
        ));

        registry
            .subscribe(ChannelConfig::new("orders"), noop_bind())
            .await
            .unwrap();
        assert!(matches!(
            registry.ready_handle("orders"),
            Err(RealtimeError::ChannelNotReady {
                status: ChannelStatus::Subscribing,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_resubscribe_rebuilds_from_stored_config() {
        let (transport, registry) = registry();
        let config = ChannelConfig::new("drivers")
            .on("location", |_| {})
            .presence(PresenceConfig::new("d-1").initial_state(json!({"online": true})));
        let first = registry.subscribe(config, noop_bind()).await.unwrap().instance;

        let second = registry
            .resubscribe("drivers", first, noop_bind())
            .await
            .unwrap();

        assert!(second.active);
        assert_eq!(registry.instances(), vec![("drivers".to_string(), second.instance)]);
        let channels = transport.channels_named("drivers");
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].teardown_count(), 1);
        assert_eq!(channels[1].event_names(), vec!["location"]);
        assert_eq!(channels[1].options().presence_key.as_deref(), Some("d-1"));
        assert_eq!(channels[1].subscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_skips_stale_or_removed_instance() {
        let (transport, registry) = registry();
        let first = registry
            .subscribe(ChannelConfig::new("orders"), noop_bind())
            .await
            .unwrap()
            .instance;
        registry
            .subscribe(ChannelConfig::new("orders"), noop_bind())
            .await
            .unwrap();

        assert!(registry.resubscribe("orders", first, noop_bind()).await.is_none());
        assert!(registry.resubscribe("missing", 1, noop_bind()).await.is_none());
        assert_eq!(transport.created_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_removed_during_teardown_is_not_subscribed() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = Arc::new(ChannelRegistry::new(transport.clone()));
        let first = registry
            .subscribe(ChannelConfig::new("orders"), noop_bind())
            .await
            .unwrap()
            .instance;
        transport.set_teardown_delay(Duration::from_millis(500));

        let pending = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.resubscribe("orders", first, noop_bind()).await })
        };
        tokio::task::yield_now().await;
        assert!(registry.take("orders").is_some());

        let installed = pending.await.unwrap().unwrap();
        assert!(!installed.active);
        assert!(registry.is_empty());
        assert_eq!(transport.channels_named("orders")[1].subscribe_count(), 0);
    }
}
