//! Durable local storage for the sync engine.
//!
//! The engine persists whole structures under a handful of keys, so the
//! storage contract is a small key-value trait. Every value is wrapped in a
//! versioned envelope (`{"version":1,"data":...}`) so a future layout change
//! can be detected instead of misread.
//!
//! # Backends
//!
//! - [`sqlite`] - SQLite `kv` table, multi-key writes in one transaction
//! - [`file`] - one JSON file per key, atomic temp-file + rename
//! - [`memory`] - in-process map for tests and ephemeral engines

pub mod file;
pub mod memory;
pub mod sqlite;

pub use file::FileKvStore;
pub use memory::MemoryKvStore;
pub use sqlite::SqliteKvStore;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Key holding the active operation queue.
pub const ACTIVE_QUEUE_KEY: &str = "active_queue";

/// Key holding dead-lettered operations.
pub const DEAD_LETTER_KEY: &str = "dead_letter";

/// Key holding the temporary → canonical identifier map.
pub const ID_MAP_KEY: &str = "id_map";

/// Envelope version written by this build.
pub const STORE_SCHEMA_VERSION: u32 = 1;

/// Key-value persistence used by the queue, dead-letter and id-map stores.
///
/// Implementations must make each `put` durable before returning; callers
/// rely on that for crash safety.
pub trait KvStore: Send + Sync {
    /// Read the raw value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Overwrite the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value could not be made durable.
    fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Overwrite several keys. Backends with transactions apply all or none.
    ///
    /// # Errors
    ///
    /// Returns an error if any value could not be made durable.
    fn put_many(&self, entries: &[(&str, String)]) -> Result<()> {
        for (key, value) in entries {
            self.put(key, value)?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeOwned<T> {
    version: u32,
    data: T,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// Serialize `value` inside a versioned envelope.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(&EnvelopeRef {
        version: STORE_SCHEMA_VERSION,
        data: value,
    })?)
}

/// Deserialize an envelope written by [`encode`].
///
/// # Errors
///
/// Returns [`Error::UnsupportedSchema`] for envelopes from a newer build and
/// a JSON error for malformed content.
pub fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T> {
    let probe: VersionProbe = serde_json::from_str(raw)?;
    if probe.version > STORE_SCHEMA_VERSION {
        return Err(Error::UnsupportedSchema {
            key: key.to_string(),
            found: probe.version,
            supported: STORE_SCHEMA_VERSION,
        });
    }
    let envelope: EnvelopeOwned<T> = serde_json::from_str(raw)?;
    tracing::trace!(key, version = envelope.version, "Decoded stored envelope");
    Ok(envelope.data)
}

/// Load and decode the value under `key`, if any.
///
/// # Errors
///
/// Returns an error if the backend read or decoding fails.
pub fn load<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<T>> {
    store.get(key)?.map(|raw| decode(key, &raw)).transpose()
}
