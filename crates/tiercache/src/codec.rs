//! Record codecs for the persistent tier

use cachestore::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::entry::{CacheEntry, EntryMeta};

/// Turns entries into stored bytes and back
///
/// Compression is applied by the persistent tier on top of the codec's
/// output, so codecs only deal with plain records.
pub trait Codec<T>: Send + Sync {
    /// Encode a whole entry
    fn encode(&self, entry: &CacheEntry<T>) -> Result<Vec<u8>>;

    /// Decode a whole entry
    fn decode(&self, raw: &[u8]) -> Result<CacheEntry<T>>;

    /// Decode only the metadata, used by cleanup sweeps
    fn decode_meta(&self, raw: &[u8]) -> Result<EntryMeta> {
        self.decode(raw).map(|entry| entry.meta())
    }
}

/// Structural JSON codec, the default
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, entry: &CacheEntry<T>) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(entry)?)
    }

    fn decode(&self, raw: &[u8]) -> Result<CacheEntry<T>> {
        Ok(serde_json::from_slice(raw)?)
    }

    fn decode_meta(&self, raw: &[u8]) -> Result<EntryMeta> {
        Ok(serde_json::from_slice(raw)?)
    }
}
