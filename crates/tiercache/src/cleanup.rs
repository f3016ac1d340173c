//! Periodic sweeping of expired entries
//!
//! [`CleanupScheduler::spawn`] runs every registered target once right away
//! and then on a fixed interval, until the returned handle is shut down or
//! dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::CLEANUP_INTERVAL;

/// Entries removed by one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    /// Removed from memory
    pub memory: usize,
    /// Removed from the persistent medium
    pub persistent: usize,
}

impl CleanupReport {
    /// Total removed
    pub fn total(&self) -> usize {
        self.memory + self.persistent
    }
}

/// Something that can drop its own expired entries
pub trait Sweep: Send + Sync {
    /// Remove expired entries
    fn sweep(&self) -> CleanupReport;

    /// Name used in logs
    fn label(&self) -> &str;
}

/// Set of sweep targets and the period to run them at
pub struct CleanupScheduler {
    interval: Duration,
    targets: Vec<Arc<dyn Sweep>>,
}

impl CleanupScheduler {
    /// Scheduler running every `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            targets: Vec::new(),
        }
    }

    /// Add a target
    pub fn register(mut self, target: Arc<dyn Sweep>) -> Self {
        self.targets.push(target);
        self
    }

    /// Number of registered targets
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Check if no targets are registered
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Sweep every target once, synchronously
    pub fn run_once(&self) -> CleanupReport {
        let mut total = CleanupReport::default();
        for target in &self.targets {
            let report = target.sweep();
            if report.total() > 0 {
                debug!(
                    target_name = target.label(),
                    memory = report.memory,
                    persistent = report.persistent,
                    "Swept expired cache entries"
                );
            }
            total.memory += report.memory;
            total.persistent += report.persistent;
        }
        total
    }

    /// Start sweeping on the current tokio runtime
    ///
    /// The first sweep runs immediately.
    pub fn spawn(self) -> CleanupHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let runs = Arc::new(AtomicU64::new(0));
        let task_runs = runs.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                interval_ms = self.interval.as_millis() as u64,
                targets = self.targets.len(),
                "Cache cleanup task started"
            );

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.run_once();
                        task_runs.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            info!("Cache cleanup task stopped");
        });

        CleanupHandle {
            shutdown_tx,
            task: Some(task),
            runs,
        }
    }
}

impl Default for CleanupScheduler {
    fn default() -> Self {
        Self::new(CLEANUP_INTERVAL)
    }
}

/// Handle to a running cleanup task; dropping it stops the task
pub struct CleanupHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    runs: Arc<AtomicU64>,
}

impl CleanupHandle {
    /// Number of completed sweep rounds
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Stop the task and wait for it to finish
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SetOptions;
    use crate::entry::ManualClock;
    use crate::fetch::FetchCache;
    use crate::manager::CacheManager;
    use cachestore::MemoryMedium;

    struct Fixed(usize);

    impl Sweep for Fixed {
        fn sweep(&self) -> CleanupReport {
            CleanupReport {
                memory: self.0,
                persistent: 0,
            }
        }

        fn label(&self) -> &str {
            "fixed"
        }
    }

    #[test]
    fn test_run_once_sums_targets() {
        let scheduler = CleanupScheduler::default()
            .register(Arc::new(Fixed(2)))
            .register(Arc::new(Fixed(3)));

        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.run_once().total(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_sweeps_immediately_then_periodically() {
        let medium = MemoryMedium::default();
        let clock = ManualClock::new(0);
        let cache: Arc<CacheManager<u32>> = Arc::new(
            CacheManager::builder(Arc::new(medium.clone()))
                .clock(Arc::new(clock.clone()))
                .build(),
        );
        cache.set("a", 1, SetOptions::ttl(Duration::from_millis(10)));
        clock.set(50);

        let handle = CleanupScheduler::new(Duration::from_secs(60))
            .register(cache.clone())
            .spawn();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.runs(), 1);
        assert_eq!(cache.memory_len(), 0);
        assert!(medium.is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(handle.runs(), 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_task() {
        let clock = ManualClock::new(0);
        let fetches: Arc<FetchCache<u32>> = Arc::new(FetchCache::with_clock(4, Arc::new(clock.clone())));
        fetches.insert("k", 1, Duration::from_millis(10));

        let handle = CleanupScheduler::new(Duration::from_secs(1))
            .register(fetches.clone())
            .spawn();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let runs = handle.runs.clone();
        drop(handle);

        clock.set(100);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(fetches.len(), 1);
    }
}
