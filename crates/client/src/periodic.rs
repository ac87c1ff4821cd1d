//! Fixed-period scheduler with drift correction
//!
//! Drives an async task every `period`, keeping ticks on the grid laid
//! down at start: the next fire is always a whole number of periods from
//! the first, however long each run takes. When a run overruns its slot
//! the missed ticks are skipped, never backlogged - polling twice in quick
//! succession tells a driver nothing new.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A repeating task on a fixed-period grid
pub struct Periodic {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Periodic {
    /// Spawn `task` to run every `period`, first fire one period from now
    pub fn spawn<F, Fut>(period: Duration, mut task: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        assert!(!period.is_zero(), "periodic with zero period");

        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut next = Instant::now() + period;
            loop {
                tokio::select! {
                    _ = child.cancelled() => return,
                    _ = sleep_until(next) => {}
                }

                task().await;

                next += period;
                let now = Instant::now();
                if next <= now {
                    // Overran one or more slots; jump forward on the grid
                    let behind = now.duration_since(next);
                    let skipped = (behind.as_nanos() / period.as_nanos() + 1) as u32;
                    next += period * skipped;
                    warn!(skipped, period_ms = period.as_millis() as u64,
                        "periodic task overran, skipping missed ticks");
                }
            }
        });

        Self { cancel, handle }
    }

    /// Stop the schedule and wait for any in-flight run to finish
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }

    /// Abort immediately without waiting
    pub fn abort(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}
