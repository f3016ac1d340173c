//! Cache configuration and compiled-in defaults

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Schema version stamped on new entries; bump to invalidate everything stored
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Prefix applied to every key this cache writes to the persistent medium
pub const NAMESPACE_PREFIX: &str = "dfb_cache_";

/// TTL used when `set` is called without one (5 minutes)
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Largest encoded record the persistent tier accepts (5 MiB)
pub const MAX_ENTRY_BYTES: usize = 5 * 1024 * 1024;

/// Period of the background cleanup sweep (10 minutes)
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Key bound of a fetch coordinator cache
pub const DEFAULT_FETCH_CAPACITY: usize = 100;

/// Settings for one cache namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix of persisted keys; two caches sharing a medium need distinct prefixes
    pub namespace: String,

    /// Current schema version
    pub schema_version: String,

    /// Default TTL in milliseconds
    pub default_ttl_ms: u64,

    /// Per-entry cap on the encoded record size
    pub max_entry_bytes: usize,

    /// Background sweep period in milliseconds
    pub cleanup_interval_ms: u64,
}

impl CacheConfig {
    /// Default TTL as a duration
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    /// Sweep period as a duration
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// Persisted form of a cache key
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    /// Cache key of a persisted key, if it belongs to this namespace
    pub fn cache_key<'a>(&self, storage_key: &'a str) -> Option<&'a str> {
        storage_key.strip_prefix(self.namespace.as_str())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: NAMESPACE_PREFIX.to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            default_ttl_ms: DEFAULT_TTL.as_millis() as u64,
            max_entry_bytes: MAX_ENTRY_BYTES,
            cleanup_interval_ms: CLEANUP_INTERVAL.as_millis() as u64,
        }
    }
}

/// Per-call options for `set`
#[derive(Debug, Clone, PartialEq)]
pub struct SetOptions {
    /// Time-to-live; the cache default when `None`
    pub ttl: Option<Duration>,

    /// Version to stamp; the cache schema version when `None`
    pub version: Option<String>,

    /// Deflate the persisted record
    pub compress: bool,
}

impl SetOptions {
    /// Options with an explicit TTL
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    /// Override the stamped version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Enable or disable compression
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            version: None,
            compress: true,
        }
    }
}
