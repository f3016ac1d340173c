//! Fetch coordination: dedup cache and supersession of in-flight producers
//!
//! A [`FetchCoordinator`] wraps one async producer under one key. Every
//! `fetch` call cancels the in-flight producer of the previous call, cache
//! hit or not, so a slow earlier call can never overwrite what a later call
//! observed. Calls that run the producer get a fresh [`CancellationToken`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::bounded::InsertionOrderCache;
use crate::cleanup::{CleanupReport, Sweep};
use crate::config::{DEFAULT_FETCH_CAPACITY, SCHEMA_VERSION};
use crate::entry::{CacheEntry, Clock, SystemClock};

/// Cooperative cancellation flag handed to a producer
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a live token
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the token cancelled
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the token was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Bounded, memory-only cache behind fetch coordinators
///
/// Holds at most `capacity` keys and evicts the oldest insertion first.
/// Shareable between coordinators through an `Arc`.
pub struct FetchCache<T> {
    entries: Mutex<InsertionOrderCache<String, CacheEntry<T>>>,
    clock: Arc<dyn Clock>,
    version: String,
}

impl<T: Clone> FetchCache<T> {
    /// Create a cache bounded to `capacity` keys
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, Arc::new(SystemClock))
    }

    /// Create a cache reading time from `clock`
    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(InsertionOrderCache::new(capacity)),
            clock,
            version: SCHEMA_VERSION.to_string(),
        }
    }

    /// Valid value under `key`; an invalid entry is evicted
    pub fn get(&self, key: &str) -> Option<T> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.is_valid(now, &self.version) => return Some(entry.data.clone()),
            Some(_) => {}
            None => return None,
        }
        entries.remove(key);
        None
    }

    /// Store `data` under `key` for `ttl`
    pub fn insert(&self, key: impl Into<String>, data: T, ttl: Duration) {
        let entry = CacheEntry::new(data, self.clock.now_ms(), ttl, self.version.as_str());
        if let Some(evicted) = self.entries.lock().insert(key.into(), entry) {
            debug!("Fetch cache full, evicted {}", evicted);
        }
    }

    /// Remove `key`, returning whether it was present
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Keys from oldest to newest insertion
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys()
    }

    /// Number of keys held, valid or not
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Maximum number of keys
    pub fn capacity(&self) -> usize {
        self.entries.lock().capacity()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Remove expired entries, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries
            .lock()
            .retain(|_, entry| entry.is_valid(now, &self.version))
    }
}

impl<T: Clone> Default for FetchCache<T> {
    fn default() -> Self {
        Self::new(DEFAULT_FETCH_CAPACITY)
    }
}

impl<T: Clone + Send> Sweep for FetchCache<T> {
    fn sweep(&self) -> CleanupReport {
        CleanupReport {
            memory: self.cleanup_expired(),
            persistent: 0,
        }
    }

    fn label(&self) -> &str {
        "fetch"
    }
}

/// Result of a [`FetchCoordinator::fetch`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome<T> {
    /// Served from the cache; the producer did not run
    Cached(T),
    /// Produced by this call and cached
    Fetched(T),
    /// A later call superseded this one; its result was discarded
    Superseded,
}

impl<T> FetchOutcome<T> {
    /// The value, unless superseded
    pub fn into_value(self) -> Option<T> {
        match self {
            FetchOutcome::Cached(value) | FetchOutcome::Fetched(value) => Some(value),
            FetchOutcome::Superseded => None,
        }
    }

    /// Borrow the value, unless superseded
    pub fn value(&self) -> Option<&T> {
        match self {
            FetchOutcome::Cached(value) | FetchOutcome::Fetched(value) => Some(value),
            FetchOutcome::Superseded => None,
        }
    }

    /// Whether the call was superseded
    pub fn is_superseded(&self) -> bool {
        matches!(self, FetchOutcome::Superseded)
    }
}

/// Deduplicating, cancel-on-supersede wrapper around an async producer
pub struct FetchCoordinator<T, P> {
    key: String,
    ttl: Duration,
    cache: Arc<FetchCache<T>>,
    producer: P,

    /// Token of the producer call currently allowed to commit
    live: Mutex<Option<CancellationToken>>,
}

impl<T, P> FetchCoordinator<T, P>
where
    T: Clone,
{
    /// Coordinate `producer` under `key`, caching results for `ttl`
    pub fn new(key: impl Into<String>, ttl: Duration, cache: Arc<FetchCache<T>>, producer: P) -> Self {
        Self {
            key: key.into(),
            ttl,
            cache,
            producer,
            live: Mutex::new(None),
        }
    }

    /// Return the cached value, or run the producer
    ///
    /// Any earlier in-flight call is superseded first, even when this one is
    /// served from the cache. With `force_refresh` the cache is bypassed. A
    /// producer error is returned as is and leaves the cache untouched.
    pub async fn fetch<Fut, E>(&self, force_refresh: bool) -> Result<FetchOutcome<T>, E>
    where
        P: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.cancel();

        if !force_refresh {
            if let Some(value) = self.cache.get(&self.key) {
                return Ok(FetchOutcome::Cached(value));
            }
        }

        let token = self.begin();
        let result = (self.producer)(token.clone()).await;

        let mut live = self.live.lock();
        if token.is_cancelled() {
            debug!("Discarding superseded fetch for {}", self.key);
            return Ok(FetchOutcome::Superseded);
        }
        *live = None;

        let value = result?;
        // Committed under the live lock so no newer call can interleave
        self.cache.insert(self.key.as_str(), value.clone(), self.ttl);
        Ok(FetchOutcome::Fetched(value))
    }

    /// Cached value, without running the producer
    pub fn cached(&self) -> Option<T> {
        self.cache.get(&self.key)
    }

    /// Drop this coordinator's key from the cache
    pub fn invalidate(&self) {
        self.cache.remove(&self.key);
    }

    /// Cancel the in-flight producer call, if any
    pub fn cancel(&self) {
        if let Some(token) = self.live.lock().take() {
            token.cancel();
        }
    }

    /// Cache key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// TTL applied to produced values
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.live.lock().replace(token.clone()) {
            previous.cancel();
        }
        token
    }
}

impl<T, P> Drop for FetchCoordinator<T, P> {
    fn drop(&mut self) {
        if let Some(token) = self.live.get_mut().take() {
            token.cancel();
        }
    }
}

/// Stable key for a fetch scope and its parameters: `scope:<json>`
///
/// Struct fields serialize in declaration order, so equal parameters always
/// give equal keys.
pub fn fetch_key<S: Serialize + ?Sized>(scope: &str, params: &S) -> serde_json::Result<String> {
    Ok(format!("{}:{}", scope, serde_json::to_string(params)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ManualClock;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn shared_cache() -> Arc<FetchCache<String>> {
        Arc::new(FetchCache::new(DEFAULT_FETCH_CAPACITY))
    }

    #[tokio::test]
    async fn test_fetch_caches_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let coordinator = FetchCoordinator::new("contracts", Duration::from_secs(60), shared_cache(), move |_token: CancellationToken| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>("list".to_string()) }
        });

        let first = coordinator.fetch(false).await.unwrap();
        let second = coordinator.fetch(false).await.unwrap();

        assert_eq!(first, FetchOutcome::Fetched("list".to_string()));
        assert_eq!(second, FetchOutcome::Cached("list".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let coordinator = FetchCoordinator::new("k", Duration::from_secs(60), shared_cache(), move |_token: CancellationToken| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, String>(format!("v{}", n)) }
        });

        coordinator.fetch(false).await.unwrap();
        let refreshed = coordinator.fetch(true).await.unwrap();

        assert_eq!(refreshed, FetchOutcome::Fetched("v1".to_string()));
        assert_eq!(coordinator.cached().as_deref(), Some("v1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_call_supersedes_slower_earlier_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = shared_cache();
        let coordinator = FetchCoordinator::new("report", Duration::from_secs(60), cache.clone(), move |token: CancellationToken| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    sleep(Duration::from_millis(100)).await;
                    assert!(token.is_cancelled());
                    Ok::<_, String>("slow".to_string())
                } else {
                    sleep(Duration::from_millis(10)).await;
                    Ok("fast".to_string())
                }
            }
        });

        let (first, second) = tokio::join!(coordinator.fetch(false), async {
            sleep(Duration::from_millis(1)).await;
            coordinator.fetch(false).await
        });

        assert_eq!(first.unwrap(), FetchOutcome::Superseded);
        assert_eq!(second.unwrap(), FetchOutcome::Fetched("fast".to_string()));
        assert_eq!(cache.get("report").as_deref(), Some("fast"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_supersedes_slow_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = shared_cache();
        let coordinator = FetchCoordinator::new("report", Duration::from_secs(60), cache.clone(), move |_token: CancellationToken| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Ok::<_, String>("first".to_string())
                } else {
                    sleep(Duration::from_millis(100)).await;
                    Ok("refreshed".to_string())
                }
            }
        });

        coordinator.fetch(false).await.unwrap();
        let (refresh, hit) = tokio::join!(coordinator.fetch(true), async {
            sleep(Duration::from_millis(1)).await;
            coordinator.fetch(false).await
        });

        assert_eq!(refresh.unwrap(), FetchOutcome::Superseded);
        assert_eq!(hit.unwrap(), FetchOutcome::Cached("first".to_string()));
        assert_eq!(cache.get("report").as_deref(), Some("first"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_producer_error_keeps_previous_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let coordinator = FetchCoordinator::new("k", Duration::from_secs(60), shared_cache(), move |_token: CancellationToken| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Ok("good".to_string())
                } else {
                    Err("backend down".to_string())
                }
            }
        });

        coordinator.fetch(false).await.unwrap();
        let failed = coordinator.fetch(true).await;

        assert_eq!(failed, Err("backend down".to_string()));
        assert_eq!(coordinator.fetch(false).await, Ok(FetchOutcome::Cached("good".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_in_flight_result() {
        let cache = shared_cache();
        let coordinator = FetchCoordinator::new("k", Duration::from_secs(60), cache.clone(), |_token: CancellationToken| async {
            sleep(Duration::from_millis(50)).await;
            Ok::<_, String>("late".to_string())
        });

        let (outcome, ()) = tokio::join!(coordinator.fetch(false), async {
            sleep(Duration::from_millis(5)).await;
            coordinator.cancel();
        });

        assert!(outcome.unwrap().is_superseded());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let coordinator = FetchCoordinator::new("k", Duration::from_secs(60), shared_cache(), move |_token: CancellationToken| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>("v".to_string()) }
        });

        coordinator.fetch(false).await.unwrap();
        coordinator.invalidate();
        assert_eq!(coordinator.cached(), None);

        coordinator.fetch(false).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fetch_cache_eviction_bound() {
        let cache: FetchCache<u32> = FetchCache::new(3);
        for (i, key) in ["a", "b", "c", "d"].into_iter().enumerate() {
            cache.insert(key, i as u32, Duration::from_secs(60));
        }

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.keys(), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_fetch_cache_expiry() {
        let clock = ManualClock::new(0);
        let cache: FetchCache<u32> = FetchCache::with_clock(10, Arc::new(clock.clone()));
        cache.insert("short", 1, Duration::from_millis(10));
        cache.insert("long", 2, Duration::from_secs(10));

        clock.set(10);
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.len(), 1);

        cache.insert("short", 3, Duration::from_millis(10));
        clock.set(100);
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.keys(), vec!["long"]);
    }

    #[test]
    fn test_fetch_key_is_stable() {
        #[derive(Serialize)]
        struct Filter<'a> {
            status: &'a str,
            page: u32,
        }

        let key = fetch_key("contracts", &Filter { status: "active", page: 2 }).unwrap();

        assert_eq!(key, r#"contracts:{"status":"active","page":2}"#);
        assert_eq!(key, fetch_key("contracts", &Filter { status: "active", page: 2 }).unwrap());
        assert_ne!(key, fetch_key("contracts", &Filter { status: "active", page: 3 }).unwrap());
    }
}
