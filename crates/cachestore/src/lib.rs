//! # cachestore
//!
//! Quota-limited persistent key/value media for TierCache.
//!
//! ## Pieces
//! - [`StorageMedium`]: flat byte key/value store with an aggregate quota
//! - [`MemoryMedium`]: medium held in process memory (tests, sandboxes)
//! - [`FileMedium`]: medium persisted as one file per key
//! - [`frame`]: optional deflate framing for stored records

#![warn(missing_docs)]

mod error;
mod file;
pub mod frame;
mod medium;

pub use error::{Error, Result};
pub use file::FileMedium;
pub use medium::{MemoryMedium, StorageMedium, DEFAULT_QUOTA};
