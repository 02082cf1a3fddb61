//! Store configuration.
//!
//! Values come from an optional `patternstore.toml` (or the file named by
//! `PATTERNSTORE_CONFIG`) and are then overridden by environment variables:
//!
//! - `PATTERNSTORE_DB`: database path
//! - `PATTERNSTORE_BACKENDS`: comma separated backend candidates, priority order
//! - `PATTERNSTORE_LOCK_STALE_MS`: lock staleness timeout
//! - `PATTERNSTORE_LOCK_WAIT_MS`: lock wait budget

use crate::core::db::{AdapterOptions, BackendKind};
use crate::core::error::{Result, StoreError};
use crate::core::migration_lock::LockOptions;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "patternstore.toml";
pub const DEFAULT_DB_PATH: &str = ".patternstore/patterns.db";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub backends: Vec<BackendKind>,
    pub busy_timeout_ms: u64,
    pub lock: LockConfig,
    pub migration: MigrationConfig,
    pub context: ContextConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub stale_after_ms: u64,
    pub max_wait_ms: u64,
    pub poll_interval_ms: u64,
    /// Remove held locks and exit on SIGINT/SIGTERM. The CLI turns this on.
    pub release_on_signal: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Skip checksum verification when migrating an existing database.
    pub force_on_existing: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_size_bytes: usize,
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            backends: BackendKind::default_order(),
            busy_timeout_ms: 5_000,
            lock: LockConfig::default(),
            migration: MigrationConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 60_000,
            max_wait_ms: 30_000,
            poll_interval_ms: 100,
            release_on_signal: false,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 30 * 1024,
            cache_ttl_secs: 300,
            cache_capacity: 64,
        }
    }
}

impl StoreConfig {
    /// Load from `PATTERNSTORE_CONFIG`, else `<dir>/patternstore.toml` if present,
    /// else defaults; then apply environment overrides.
    pub fn load(dir: &Path) -> Result<Self> {
        let explicit = env::var("PATTERNSTORE_CONFIG").ok().map(PathBuf::from);
        let candidate = explicit.unwrap_or_else(|| dir.join(CONFIG_FILE_NAME));
        let mut config = if candidate.is_file() {
            Self::from_file(&candidate)?
        } else {
            Self::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(db) = env::var("PATTERNSTORE_DB") {
            self.db_path = PathBuf::from(db);
        }
        if let Ok(list) = env::var("PATTERNSTORE_BACKENDS") {
            self.backends = BackendKind::parse_list(&list)?;
        }
        if let Ok(v) = env::var("PATTERNSTORE_LOCK_STALE_MS") {
            self.lock.stale_after_ms = parse_ms("PATTERNSTORE_LOCK_STALE_MS", &v)?;
        }
        if let Ok(v) = env::var("PATTERNSTORE_LOCK_WAIT_MS") {
            self.lock.max_wait_ms = parse_ms("PATTERNSTORE_LOCK_WAIT_MS", &v)?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(StoreError::ConfigError(
                "at least one backend candidate is required".to_string(),
            ));
        }
        if self.lock.poll_interval_ms == 0 {
            return Err(StoreError::ConfigError(
                "lock.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.context.max_size_bytes < 256 {
            return Err(StoreError::ConfigError(format!(
                "context.max_size_bytes too small: {}",
                self.context.max_size_bytes
            )));
        }
        Ok(())
    }

    pub fn adapter_options(&self) -> AdapterOptions {
        AdapterOptions {
            backends: self.backends.clone(),
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            stale_after: Duration::from_millis(self.lock.stale_after_ms),
            max_wait: Duration::from_millis(self.lock.max_wait_ms),
            poll_interval: Duration::from_millis(self.lock.poll_interval_ms),
            release_on_signal: self.lock.release_on_signal,
        }
    }
}

fn parse_ms(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| StoreError::ConfigError(format!("{} must be an integer, got '{}'", name, raw)))
}
