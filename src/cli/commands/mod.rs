//! Command implementations.

pub mod completions;
pub mod dead_letter;
pub mod entity;
pub mod flush;
pub mod queue;
pub mod status;
pub mod version;

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{load_config, resolve_store_path, SyncConfig};
use crate::error::{Error, Result};
use crate::storage::{FileKvStore, KvStore, SqliteKvStore};
use crate::sync::{HttpRemoteApi, SyncEngine};

/// Open the store at the resolved path.
///
/// An existing directory selects the file backend; anything else is a
/// SQLite database. Read-only commands pass `create = false` and get
/// [`Error::NotInitialized`] when nothing is there yet.
pub(crate) fn open_store(store_path: Option<&PathBuf>, create: bool) -> Result<Arc<dyn KvStore>> {
    let path = resolve_store_path(store_path.map(PathBuf::as_path))
        .ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))?;

    if !create && !path.exists() {
        return Err(Error::NotInitialized { path });
    }

    tracing::debug!(path = %path.display(), "Opening store");
    if path.is_dir() {
        Ok(Arc::new(FileKvStore::new(path)))
    } else {
        Ok(Arc::new(SqliteKvStore::open(&path)?))
    }
}

/// HTTP client for the configured server.
pub(crate) fn http_api(config: &SyncConfig) -> HttpRemoteApi {
    HttpRemoteApi::new(config.server.clone(), config.token.clone())
        .with_timeout(config.request_timeout)
}

/// Load config, open the store and rehydrate an engine from it.
pub(crate) fn open_engine(
    store_path: Option<&PathBuf>,
    create: bool,
) -> Result<SyncEngine<HttpRemoteApi>> {
    let config = load_config()?;
    open_engine_with(store_path, create, &config)
}

pub(crate) fn open_engine_with(
    store_path: Option<&PathBuf>,
    create: bool,
    config: &SyncConfig,
) -> Result<SyncEngine<HttpRemoteApi>> {
    let store = open_store(store_path, create)?;
    SyncEngine::open(http_api(config), store, config.settings)
}

/// Format a Unix-millisecond timestamp for human output.
pub(crate) fn format_timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
