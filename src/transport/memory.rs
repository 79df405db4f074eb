//! In-process transport for tests.
//!
//! Nothing leaves the process: statuses are driven explicitly with
//! [`MemoryTransport::emit`] and inbound events with
//! [`MemoryTransport::deliver`]. Every channel ever created is kept so tests
//! can inspect handler wiring, sends and teardowns after the fact, so the
//! history grows with every resubscribe. Use it as a test double only, not
//! as a long-running offline transport.

use super::{
    BroadcastMessage, ChannelHandle, ChannelOptions, EventHandler, PresenceEvent,
    RealtimeTransport, SendResponse, StatusCallback, TransportChannel, TransportStatus,
};
use crate::types::TransportError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Behaviour {
    send_response: Mutex<SendResponse>,
    teardown_error: Mutex<Option<TransportError>>,
    track_error: Mutex<Option<TransportError>>,
    teardown_delay: Mutex<Duration>,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            send_response: Mutex::new(SendResponse::Ok),
            teardown_error: Mutex::new(None),
            track_error: Mutex::new(None),
            teardown_delay: Mutex::new(Duration::ZERO),
        }
    }
}

/// Test transport that keeps every channel it ever created in memory.
#[derive(Default)]
pub struct MemoryTransport {
    behaviour: Arc<Behaviour>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Response returned by every subsequent `send`
    pub fn set_send_response(&self, response: SendResponse) {
        *lock(&self.behaviour.send_response) = response;
    }

    /// Makes every subsequent teardown fail (or succeed again with `None`)
    pub fn fail_teardown(&self, error: Option<TransportError>) {
        *lock(&self.behaviour.teardown_error) = error;
    }

    /// Makes every subsequent teardown take `delay` before it completes
    pub fn set_teardown_delay(&self, delay: Duration) {
        *lock(&self.behaviour.teardown_delay) = delay;
    }

    /// Makes every subsequent presence `track` fail (or succeed with `None`)
    pub fn fail_track(&self, error: Option<TransportError>) {
        *lock(&self.behaviour.track_error) = error;
    }

    /// Most recently created channel with this name
    pub fn channel(&self, name: &str) -> Option<Arc<MemoryChannel>> {
        lock(&self.channels)
            .iter()
            .rev()
            .find(|channel| channel.name == name)
            .cloned()
    }

    /// Every channel ever created with this name, oldest first
    pub fn channels_named(&self, name: &str) -> Vec<Arc<MemoryChannel>> {
        lock(&self.channels)
            .iter()
            .filter(|channel| channel.name == name)
            .cloned()
            .collect()
    }

    pub fn created_count(&self) -> usize {
        lock(&self.channels).len()
    }

    /// Reports `status` on the latest channel with this name.
    ///
    /// Returns `false` when no such channel exists or it never subscribed.
    pub fn emit(&self, name: &str, status: TransportStatus) -> bool {
        match self.channel(name) {
            Some(channel) => channel.emit(status),
            None => false,
        }
    }

    /// Delivers an inbound event to the latest channel with this name.
    ///
    /// Returns the number of handlers invoked.
    pub fn deliver(&self, name: &str, event: &str, payload: Value) -> usize {
        match self.channel(name) {
            Some(channel) => channel.deliver(event, payload),
            None => 0,
        }
    }

    /// Delivers a presence event to the latest channel with this name.
    pub fn deliver_presence(&self, name: &str, event: PresenceEvent, payload: Value) -> usize {
        match self.channel(name) {
            Some(channel) => channel.deliver_presence(event, payload),
            None => 0,
        }
    }
}

impl RealtimeTransport for MemoryTransport {
    fn create_channel(&self, name: &str, options: ChannelOptions) -> ChannelHandle {
        let channel = Arc::new(MemoryChannel {
            name: name.to_string(),
            options,
            behaviour: Arc::clone(&self.behaviour),
            handlers: Mutex::new(Vec::new()),
            presence_handlers: Mutex::new(Vec::new()),
            status_callback: Mutex::new(None),
            subscribe_calls: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
            tracked: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        });
        tracing::debug!("Memory transport created channel {}", name);
        lock(&self.channels).push(Arc::clone(&channel));
        channel
    }
}

/// Channel created by [`MemoryTransport`].
pub struct MemoryChannel {
    name: String,
    options: ChannelOptions,
    behaviour: Arc<Behaviour>,
    handlers: Mutex<Vec<(String, EventHandler)>>,
    presence_handlers: Mutex<Vec<(PresenceEvent, EventHandler)>>,
    status_callback: Mutex<Option<StatusCallback>>,
    subscribe_calls: AtomicUsize,
    teardowns: AtomicUsize,
    tracked: Mutex<Vec<Value>>,
    sent: Mutex<Vec<BroadcastMessage>>,
}

impl MemoryChannel {
    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Names of attached event handlers, in attachment order
    pub fn event_names(&self) -> Vec<String> {
        lock(&self.handlers)
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }

    pub fn presence_events(&self) -> Vec<PresenceEvent> {
        lock(&self.presence_handlers)
            .iter()
            .map(|(event, _)| *event)
            .collect()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub fn tracked(&self) -> Vec<Value> {
        lock(&self.tracked).clone()
    }

    pub fn sent(&self) -> Vec<BroadcastMessage> {
        lock(&self.sent).clone()
    }

    /// Invokes the status callback registered by `subscribe`.
    pub fn emit(&self, status: TransportStatus) -> bool {
        let callback = lock(&self.status_callback).clone();
        match callback {
            Some(callback) => {
                callback(status);
                true
            }
            None => false,
        }
    }

    pub fn deliver(&self, event: &str, payload: Value) -> usize {
        let matching: Vec<EventHandler> = lock(&self.handlers)
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in &matching {
            handler(payload.clone());
        }
        matching.len()
    }

    pub fn deliver_presence(&self, event: PresenceEvent, payload: Value) -> usize {
        let matching: Vec<EventHandler> = lock(&self.presence_handlers)
            .iter()
            .filter(|(kind, _)| *kind == event)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in &matching {
            handler(payload.clone());
        }
        matching.len()
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn on(&self, event: &str, handler: EventHandler) {
        lock(&self.handlers).push((event.to_string(), handler));
    }

    fn on_presence(&self, event: PresenceEvent, handler: EventHandler) {
        lock(&self.presence_handlers).push((event, handler));
    }

    fn subscribe(&self, callback: StatusCallback) {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.status_callback) = Some(callback);
    }

    async fn track(&self, state: Value) -> Result<(), TransportError> {
        if let Some(err) = lock(&self.behaviour.track_error).clone() {
            return Err(err);
        }
        lock(&self.tracked).push(state);
        Ok(())
    }

    async fn send(&self, message: BroadcastMessage) -> SendResponse {
        lock(&self.sent).push(message);
        lock(&self.behaviour.send_response).clone()
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.behaviour.teardown_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = lock(&self.behaviour.teardown_error).clone() {
            return Err(err);
        }
        Ok(())
    }
}
