use crate::infrastructure::invoke_guarded;
use crate::types::TransportError;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub type ConnectionObserver = Arc<dyn Fn(bool) + Send + Sync + 'static>;
pub type ErrorObserver = Arc<dyn Fn(&TransportError) + Send + Sync + 'static>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Observers<H> {
    next_id: u64,
    entries: Vec<(u64, H)>,
}

impl<H: Clone> Observers<H> {
    fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    fn add(&mut self, handler: H) -> u64 {
        self.next_id += 1;
        self.entries.push((self.next_id, handler));
        self.next_id
    }

    fn remove(&mut self, id: u64) {
        self.entries.retain(|(entry_id, _)| *entry_id != id);
    }

    fn snapshot(&self) -> Vec<H> {
        self.entries.iter().map(|(_, h)| h.clone()).collect()
    }
}

/// Returned by observer registration; call [`unsubscribe`](Self::unsubscribe)
/// to stop receiving notifications. Dropping the handle keeps the observer.
pub struct ObserverHandle {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ObserverHandle {
    fn new<H: Clone + Send + 'static>(observers: &Arc<Mutex<Observers<H>>>, id: u64) -> Self {
        let weak: Weak<Mutex<Observers<H>>> = Arc::downgrade(observers);
        Self {
            remove: Some(Box::new(move || {
                if let Some(observers) = weak.upgrade() {
                    lock(&observers).remove(id);
                }
            })),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle").finish_non_exhaustive()
    }
}

struct FlagState {
    connected: bool,
    /// Last value handed to observers
    announced: bool,
    announcing: bool,
}

/// Aggregate connectivity derived from channel lifecycle.
///
/// The transport exposes no global open/close signal, so `connected` is a
/// heuristic: it is true while at least one registered channel is
/// subscribed. Observers hear about flips only, in the order they happened.
pub struct ConnectionMonitor {
    flag: Mutex<FlagState>,
    connection_observers: Arc<Mutex<Observers<ConnectionObserver>>>,
    error_observers: Arc<Mutex<Observers<ErrorObserver>>>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        Self {
            flag: Mutex::new(FlagState {
                connected: false,
                announced: false,
                announcing: false,
            }),
            connection_observers: Arc::new(Mutex::new(Observers::new())),
            error_observers: Arc::new(Mutex::new(Observers::new())),
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.flag).connected
    }

    pub fn on_connection_change(
        &self,
        handler: impl Fn(bool) + Send + Sync + 'static,
    ) -> ObserverHandle {
        let id = lock(&self.connection_observers).add(Arc::new(handler));
        ObserverHandle::new(&self.connection_observers, id)
    }

    pub fn on_error(
        &self,
        handler: impl Fn(&TransportError) + Send + Sync + 'static,
    ) -> ObserverHandle {
        let id = lock(&self.error_observers).add(Arc::new(handler));
        ObserverHandle::new(&self.error_observers, id)
    }

    /// Sets the flag and notifies observers when it flips.
    /// Returns whether it changed.
    pub fn set_connected(&self, connected: bool) -> bool {
        self.refresh(|| connected)
    }

    /// Recomputes the flag with `probe` while holding the monitor lock, so
    /// concurrent refreshes are applied in the order their probes ran.
    ///
    /// Observers are called outside the lock. Whichever caller finds no
    /// announcement in progress delivers every pending flip in order; the
    /// others return at once. Returns whether the flag changed.
    pub fn refresh(&self, probe: impl FnOnce() -> bool) -> bool {
        {
            let mut flag = lock(&self.flag);
            let connected = probe();
            let changed = flag.connected != connected;
            flag.connected = connected;
            if flag.announcing || !changed {
                return changed;
            }
            flag.announcing = true;
        }
        self.announce();
        true
    }

    fn announce(&self) {
        loop {
            let connected = {
                let mut flag = lock(&self.flag);
                if flag.announced == flag.connected {
                    flag.announcing = false;
                    return;
                }
                flag.announced = flag.connected;
                flag.connected
            };

            tracing::info!(
                "Realtime connection {}",
                if connected { "established" } else { "lost" }
            );

            let observers = lock(&self.connection_observers).snapshot();
            for observer in observers {
                invoke_guarded("Connection observer", || observer(connected));
            }
        }
    }

    pub fn notify_error(&self, error: &TransportError) {
        let observers = lock(&self.error_observers).snapshot();
        for observer in observers {
            invoke_guarded("Error observer", || observer(error));
        }
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.connection_observers).entries.len() + lock(&self.error_observers).entries.len()
    }

    /// Drops every registered observer
    pub fn clear(&self) {
        lock(&self.connection_observers).entries.clear();
        lock(&self.error_observers).entries.clear();
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}
