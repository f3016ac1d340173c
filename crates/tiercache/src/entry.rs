//! Cache entry envelope and time sources

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A cached value with the metadata that decides its validity
///
/// Serialized form: `{"data":…,"timestampMs":…,"expiresInMs":…,"version":…}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// Cached value
    pub data: T,

    /// Creation time, epoch milliseconds
    #[serde(rename = "timestampMs")]
    pub timestamp: i64,

    /// Time-to-live measured from `timestamp`
    #[serde(rename = "expiresInMs", with = "duration_ms")]
    pub expires_in: Duration,

    /// Schema version the entry was written under
    pub version: String,
}

impl<T> CacheEntry<T> {
    /// Create an entry stamped at `now`
    pub fn new(data: T, now: i64, expires_in: Duration, version: impl Into<String>) -> Self {
        Self {
            data,
            timestamp: now,
            expires_in,
            version: version.into(),
        }
    }

    /// Valid iff younger than its TTL and written under `current_version`
    pub fn is_valid(&self, now: i64, current_version: &str) -> bool {
        is_fresh(self.timestamp, self.expires_in, now) && self.version == current_version
    }

    /// Metadata without the value
    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            timestamp: self.timestamp,
            expires_in: self.expires_in,
            version: self.version.clone(),
        }
    }
}

/// Entry metadata, decodable from a stored record without its value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Creation time, epoch milliseconds
    #[serde(rename = "timestampMs")]
    pub timestamp: i64,

    /// Time-to-live measured from `timestamp`
    #[serde(rename = "expiresInMs", with = "duration_ms")]
    pub expires_in: Duration,

    /// Schema version the entry was written under
    pub version: String,
}

impl EntryMeta {
    /// Same rule as [`CacheEntry::is_valid`]
    pub fn is_valid(&self, now: i64, current_version: &str) -> bool {
        is_fresh(self.timestamp, self.expires_in, now) && self.version == current_version
    }
}

fn is_fresh(timestamp: i64, expires_in: Duration, now: i64) -> bool {
    let ttl = i64::try_from(expires_in.as_millis()).unwrap_or(i64::MAX);
    now.saturating_sub(timestamp) < ttl
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Source of "now" for expiry decisions
pub trait Clock: Send + Sync {
    /// Current time in epoch milliseconds
    fn now_ms(&self) -> i64;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for simulating the passage of time
///
/// Clones share the same reading.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock reading `start` epoch milliseconds
    pub fn new(start: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start)),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move forward by `by`
    pub fn advance(&self, by: Duration) {
        let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
