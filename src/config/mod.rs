//! Configuration management.
//!
//! Resolves the local store location and the engine settings.
//!
//! # Layout
//!
//! Everything lives under `~/.tfsync/`:
//! - **Store**: `~/.tfsync/data/tfsync.db` (SQLite key-value table)
//! - **Config**: `~/.tfsync/config.json` (server, token, engine tunables)
//!
//! Environment variables override the config file, and CLI flags override
//! both.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::sync::{EngineSettings, DEFAULT_REQUEST_TIMEOUT};

/// Server used when neither the config file nor the environment names one.
pub const DEFAULT_SERVER: &str = "http://127.0.0.1:3000";

/// Get the global tfsync directory (`~/.tfsync/`).
#[must_use]
pub fn global_tfsync_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".tfsync"))
}

/// Default location of `config.json`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    global_tfsync_dir().map(|dir| dir.join("config.json"))
}

/// Resolve the store path.
///
/// Priority:
/// 1. If `explicit_path` is provided, use it directly
/// 2. `TFSYNC_STORE` environment variable
/// 3. Global location: `~/.tfsync/data/tfsync.db`
#[must_use]
pub fn resolve_store_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    resolve_store_path_with(explicit_path, |key| std::env::var(key).ok())
}

fn resolve_store_path_with(
    explicit_path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }

    if let Some(path) = env("TFSYNC_STORE").filter(|p| !p.trim().is_empty()) {
        return Some(PathBuf::from(path));
    }

    global_tfsync_dir().map(|dir| dir.join("data").join("tfsync.db"))
}

/// On-disk shape of `config.json`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigFile {
    server: Option<String>,
    token: Option<String>,
    max_per_run: Option<usize>,
    retry_limit: Option<u32>,
    flush_interval_secs: Option<u64>,
    max_queue_depth: Option<usize>,
    request_timeout_secs: Option<u64>,
}

/// Effective configuration after merging file, environment and defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Base URL of the remote mutation API.
    pub server: String,
    /// Bearer token sent with every request.
    pub token: Option<String>,
    pub settings: EngineSettings,
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            token: None,
            settings: EngineSettings::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Load `~/.tfsync/config.json` (if present) and apply `TFSYNC_*` overrides.
///
/// # Errors
///
/// Returns [`Error::Config`] for an unreadable file, malformed JSON, or a
/// non-numeric numeric override.
pub fn load_config() -> Result<SyncConfig> {
    load_config_with(default_config_path().as_deref(), |key| std::env::var(key).ok())
}

/// Like [`load_config`], with an explicit file and environment lookup.
///
/// # Errors
///
/// Same as [`load_config`].
pub fn load_config_with(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<SyncConfig> {
    let file = match path {
        Some(path) if path.exists() => read_config_file(path)?,
        _ => ConfigFile::default(),
    };

    let mut config = SyncConfig::default();
    if let Some(server) = file.server {
        config.server = server;
    }
    config.token = file.token;
    if let Some(n) = file.max_per_run {
        config.settings.max_per_run = n;
    }
    if let Some(n) = file.retry_limit {
        config.settings.retry.limit = n;
    }
    if let Some(secs) = file.flush_interval_secs {
        config.settings.flush_interval = Duration::from_secs(secs);
    }
    if let Some(n) = file.max_queue_depth {
        config.settings.max_queue_depth = n;
    }
    if let Some(secs) = file.request_timeout_secs {
        config.request_timeout = Duration::from_secs(secs);
    }

    let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());
    if let Some(server) = non_empty("TFSYNC_SERVER") {
        config.server = server;
    }
    if let Some(token) = non_empty("TFSYNC_TOKEN") {
        config.token = Some(token);
    }
    if let Some(raw) = non_empty("TFSYNC_MAX_PER_RUN") {
        config.settings.max_per_run = parse_env("TFSYNC_MAX_PER_RUN", &raw)?;
    }
    if let Some(raw) = non_empty("TFSYNC_RETRY_LIMIT") {
        config.settings.retry.limit = parse_env("TFSYNC_RETRY_LIMIT", &raw)?;
    }
    if let Some(raw) = non_empty("TFSYNC_FLUSH_INTERVAL_SECS") {
        config.settings.flush_interval =
            Duration::from_secs(parse_env("TFSYNC_FLUSH_INTERVAL_SECS", &raw)?);
    }

    validate(&config)?;
    tracing::debug!(server = %config.server, settings = ?config.settings, "Loaded config");
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::Config(format!("Invalid {}: {e}", path.display())))
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} must be a number, got '{raw}'")))
}

fn validate(config: &SyncConfig) -> Result<()> {
    if config.settings.max_per_run == 0 {
        return Err(Error::Config("maxPerRun must be at least 1".to_string()));
    }
    if config.settings.max_queue_depth == 0 {
        return Err(Error::Config("maxQueueDepth must be at least 1".to_string()));
    }
    if config.settings.flush_interval.is_zero() {
        return Err(Error::Config("flushIntervalSecs must be at least 1".to_string()));
    }
    Ok(())
}
