//! # tiercache
//!
//! Two-tier TTL cache for client-resident data: a process-memory map in
//! front of a quota-limited persistent medium.
//!
//! ## Pieces
//! - [`CacheManager`]: public get/set/delete API over both tiers
//! - [`MemoryTier`] and [`PersistentTier`]: the tiers themselves
//! - [`FetchCoordinator`]: dedup and supersession of async producers, backed
//!   by the bounded [`FetchCache`]
//! - [`StatsCollector`] and [`CacheMetrics`]: diagnostics
//! - [`CleanupScheduler`]: periodic sweep of expired entries
//!
//! Entries are valid while `now - timestamp < expires_in` and their version
//! equals the configured schema version. `get` and `set` never fail; a
//! missing, broken or full medium only makes the cache memory-only.

#![warn(missing_docs)]

mod bounded;
mod cleanup;
mod codec;
mod config;
mod entry;
mod fetch;
mod manager;
mod memory;
mod persistent;
mod stats;

pub use bounded::InsertionOrderCache;
pub use cleanup::{CleanupHandle, CleanupReport, CleanupScheduler, Sweep};
pub use codec::{Codec, JsonCodec};
pub use config::{
    CacheConfig, SetOptions, CLEANUP_INTERVAL, DEFAULT_FETCH_CAPACITY, DEFAULT_TTL,
    MAX_ENTRY_BYTES, NAMESPACE_PREFIX, SCHEMA_VERSION,
};
pub use entry::{CacheEntry, Clock, EntryMeta, ManualClock, SystemClock};
pub use fetch::{fetch_key, CancellationToken, FetchCache, FetchCoordinator, FetchOutcome};
pub use manager::{CacheManager, CacheManagerBuilder};
pub use memory::MemoryTier;
pub use persistent::{PersistentTier, WriteOutcome};
pub use stats::{CacheMetrics, CacheStats, StatsCollector};

pub use cachestore::{FileMedium, MemoryMedium, StorageMedium};

/// Route `tracing` output to the test harness; `RUST_LOG` picks the level
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
