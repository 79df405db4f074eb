use super::config::ReconnectConfig;
use crate::infrastructure::Backoff;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// What the policy did with a failure notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Scheduled { attempt: u32, delay: Duration },
    AlreadyPending,
    Exhausted { attempts: u32 },
}

struct PolicyState {
    backoff: Backoff,
    generation: u64,
    pending: Option<(u64, JoinHandle<()>)>,
}

/// Bounded exponential-backoff recovery shared by every channel.
///
/// The transport connection is process-wide, so attempts are counted
/// globally and at most one resubscribe is ever pending.
pub struct ReconnectionPolicy {
    state: Arc<Mutex<PolicyState>>,
}

fn lock(state: &Mutex<PolicyState>) -> MutexGuard<'_, PolicyState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ReconnectionPolicy {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(PolicyState {
                backoff: Backoff::from_config(config),
                generation: 0,
                pending: None,
            })),
        }
    }

    pub fn attempts(&self) -> u32 {
        lock(&self.state).backoff.attempts()
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.state).pending.is_some()
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        lock(&self.state).backoff.delay_for(attempt)
    }

    /// Records a failure and, unless one is already pending or attempts are
    /// exhausted, runs `resubscribe` after the next backoff delay.
    pub fn on_failure<F, Fut>(&self, resubscribe: F) -> ReconnectDecision
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = lock(&self.state);

        if state.pending.is_some() {
            tracing::debug!("Reconnection already scheduled, ignoring failure");
            return ReconnectDecision::AlreadyPending;
        }

        let Some(delay) = state.backoff.next_delay() else {
            let attempts = state.backoff.attempts();
            tracing::error!(
                "Reconnection exhausted after {} attempts; call force_reconnect() to retry",
                attempts
            );
            return ReconnectDecision::Exhausted { attempts };
        };

        let attempt = state.backoff.attempts();
        state.generation += 1;
        let generation = state.generation;

        tracing::info!(
            "Scheduling reconnection attempt {}/{} in {}ms",
            attempt,
            state.backoff.max_attempts(),
            delay.as_millis()
        );

        let shared = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = lock(&shared);
                if matches!(state.pending, Some((g, _)) if g == generation) {
                    state.pending = None;
                }
            }
            tracing::info!("Running reconnection attempt {}", attempt);
            resubscribe().await;
        });
        state.pending = Some((generation, handle));

        ReconnectDecision::Scheduled { attempt, delay }
    }

    /// Aborts the pending resubscribe, if any
    pub fn cancel_pending(&self) {
        if let Some((_, handle)) = lock(&self.state).pending.take() {
            handle.abort();
            tracing::debug!("Cancelled pending reconnection");
        }
    }

    pub fn reset(&self) {
        lock(&self.state).backoff.reset();
    }
}

impl Drop for ReconnectionPolicy {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(runs: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let runs = Arc::clone(runs);
        move || {
            runs.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_pending_reconnect() {
        let policy = ReconnectionPolicy::new(&ReconnectConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));

        let first = policy.on_failure(counting(&runs));
        let second = policy.on_failure(counting(&runs));

        assert_eq!(
            first,
            ReconnectDecision::Scheduled {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(second, ReconnectDecision::AlreadyPending);
        assert_eq!(policy.attempts(), 1);

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!policy.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let policy = ReconnectionPolicy::new(&ReconnectConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut delays = Vec::new();
        for _ in 0..5 {
            let delay = match policy.on_failure(counting(&runs)) {
                ReconnectDecision::Scheduled { delay, .. } => delay,
                other => panic!("unexpected decision {other:?}"),
            };
            delays.push(delay.as_millis());
            tokio::time::sleep(delay + Duration::from_millis(1)).await;
        }

        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(
            policy.on_failure(counting(&runs)),
            ReconnectDecision::Exhausted { attempts: 5 }
        );
        assert_eq!(runs.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_prevents_run() {
        let policy = ReconnectionPolicy::new(&ReconnectConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));

        policy.on_failure(counting(&runs));
        policy.cancel_pending();
        policy.reset();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(policy.attempts(), 0);
        assert!(!policy.is_pending());
    }
}
