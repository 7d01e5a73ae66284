//! Engine configuration.
//!
//! Watermarks of zero are derived from `max_size` at load time, and the
//! hash-table sizing knobs accept zero to mean "pick a sensible default".

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration loading error.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error reading the config file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML syntax or schema error
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Semantically invalid combination of values
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on vbucket ids; requests outside are rejected.
    pub max_vbuckets: u16,
    /// Hash-table bucket count per vbucket (0 = auto).
    pub ht_size: usize,
    /// Hash-table lock count per vbucket (0 = auto).
    pub ht_locks: usize,
    /// Maximum items written per flush transaction.
    pub max_txn_size: usize,
    /// Memory ceiling in bytes; inserts beyond this fail with ENOMEM.
    pub max_size: u64,
    /// High watermark; crossing it makes the item pager start ejecting.
    /// Zero derives 75% of `max_size`.
    pub mem_high_wat: u64,
    /// Low watermark; ejection stops below it. Zero derives 60% of `max_size`.
    pub mem_low_wat: u64,
    /// Seconds a mutation must sit in memory before it may be persisted.
    pub min_data_age: u32,
    /// Seconds after which a queued mutation is persisted regardless of age.
    pub queue_age_cap: u32,
    /// Seconds to wait before running a scheduled background fetch.
    pub bg_fetch_delay: u64,
    /// Items expiring within this many seconds of a flush are dropped
    /// instead of written.
    pub expiry_window: u32,
    /// Seconds between expiry-pager scans.
    pub exp_pager_stime: u64,
    /// Share of ejection work taken from active vbuckets before replicas.
    pub pager_active_vb_pcnt: u8,
    /// Whether client traffic is admitted before a warmup completes.
    pub data_traffic_enabled: bool,
    /// Seconds the flusher sleeps when there is nothing to write.
    pub flush_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_vbuckets: 1024,
            ht_size: 0,
            ht_locks: 0,
            max_txn_size: 250,
            max_size: 256 * 1024 * 1024, // 256MB
            mem_high_wat: 0,
            mem_low_wat: 0,
            min_data_age: 0,
            queue_age_cap: 900,
            bg_fetch_delay: 0,
            expiry_window: 3,
            exp_pager_stime: 3600,
            pager_active_vb_pcnt: 40,
            data_traffic_enabled: true,
            flush_interval: 5,
        }
    }
}

impl CacheConfig {
    /// Parse a TOML document.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let mut config: CacheConfig = toml::from_str(s)?;
        config.finish()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// Derive defaulted fields and validate.
    pub fn finish(&mut self) -> Result<(), ConfigError> {
        if self.max_vbuckets == 0 {
            return Err(ConfigError::Invalid("max_vbuckets must be > 0".into()));
        }
        if self.max_txn_size == 0 {
            return Err(ConfigError::Invalid("max_txn_size must be > 0".into()));
        }
        if self.mem_high_wat == 0 {
            self.mem_high_wat = self.max_size * 75 / 100;
        }
        if self.mem_low_wat == 0 {
            self.mem_low_wat = self.max_size * 60 / 100;
        }
        if self.mem_low_wat > self.mem_high_wat || self.mem_high_wat > self.max_size {
            return Err(ConfigError::Invalid(
                "watermarks must satisfy mem_low_wat <= mem_high_wat <= max_size".into(),
            ));
        }
        if self.pager_active_vb_pcnt > 100 {
            return Err(ConfigError::Invalid(
                "pager_active_vb_pcnt must be <= 100".into(),
            ));
        }
        Ok(())
    }
}
