//! Trailing-edge debouncing for rapid slider writes.

use std::future::Future;
use std::time::Duration;

use tokio_util::task::AbortOnDropHandle;

/// The window used for rotation speed writes coming from the controller UI.
pub const DEFAULT_DEBOUNCE_DELAY: Duration = Duration::from_millis(500);

/// Runs the most recent action once no new one has arrived for `delay`.
///
/// Each [`Debouncer::invoke`] replaces the previously scheduled action, so a
/// burst of calls collapses into the last one. Dropping the debouncer cancels
/// whatever is still pending.
pub struct Debouncer {
    delay: Duration,
    pending: Option<AbortOnDropHandle<()>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self { delay, pending: None }
    }

    pub fn invoke<F>(&mut self, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        // Replacing the handle aborts the previously scheduled action.
        self.pending = Some(AbortOnDropHandle::new(tokio::task::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        })));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU8, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_the_last_call() {
        let ran = Arc::new(AtomicU8::new(0));
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        for value in 1..=5 {
            let ran = Arc::clone(&ran);
            debouncer.invoke(async move {
                ran.store(value, Ordering::Relaxed);
            });
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert_eq!(ran.load(Ordering::Relaxed), 0);
        tokio::time::advance(Duration::from_millis(600)).await;
        // Let the scheduled task actually run.
        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::Relaxed), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels_the_pending_action() {
        let ran = Arc::new(AtomicU8::new(0));
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        {
            let ran = Arc::clone(&ran);
            debouncer.invoke(async move {
                ran.store(1, Ordering::Relaxed);
            });
        }
        drop(debouncer);
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_calls_each_run() {
        let ran = Arc::new(AtomicU8::new(0));
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        for _ in 0..2 {
            let ran = Arc::clone(&ran);
            debouncer.invoke(async move {
                ran.fetch_add(1, Ordering::Relaxed);
            });
            // Let the spawned task register its sleep before time moves.
            tokio::task::yield_now().await;
            tokio::time::advance(Duration::from_millis(600)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(ran.load(Ordering::Relaxed), 2);
    }
}
