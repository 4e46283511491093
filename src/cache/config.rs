use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::ttl::{default_ttl_map, FALLBACK_TTL_MS};

/// Tuning for [`super::ScopedCache`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries per scope store before LRU eviction kicks in.
    pub max_size: usize,
    /// Extra entries evicted past `max_size` in one pass.
    pub batch_size: usize,
    pub enable_compression: bool,
    /// Serialized size (bytes) above which values are stored compressed.
    pub compression_threshold: usize,
    pub background_refresh: bool,
    pub max_background_refreshes: usize,
    /// Fraction of the TTL after which a hit schedules a refresh.
    pub refresh_threshold: f64,
    pub default_ttl_ms: u64,
    /// `scope` or `provider:scope` -> TTL in ms.
    pub ttl_ms: BTreeMap<String, u64>,
    /// Snapshot file; persistence is disabled when unset.
    pub snapshot_path: Option<PathBuf>,
    pub save_debounce_ms: u64,
    /// Debounce used right after a `set`.
    pub critical_save_debounce_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            batch_size: 50,
            enable_compression: true,
            compression_threshold: 10 * 1024,
            background_refresh: true,
            max_background_refreshes: 4,
            refresh_threshold: 0.8,
            default_ttl_ms: FALLBACK_TTL_MS,
            ttl_ms: default_ttl_map(),
            snapshot_path: None,
            save_debounce_ms: 2_000,
            critical_save_debounce_ms: 100,
        }
    }
}

impl CacheConfig {
    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn save_debounce(&self, critical: bool) -> Duration {
        Duration::from_millis(if critical {
            self.critical_save_debounce_ms
        } else {
            self.save_debounce_ms
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_size == 0 {
            return Err("cache.max_size must be greater than 0".into());
        }
        if self.batch_size == 0 {
            return Err("cache.batch_size must be greater than 0".into());
        }
        if !(0.0..=1.0).contains(&self.refresh_threshold) || self.refresh_threshold == 0.0 {
            return Err("cache.refresh_threshold must be in (0, 1]".into());
        }
        if self.background_refresh && self.max_background_refreshes == 0 {
            return Err("cache.max_background_refreshes must be greater than 0".into());
        }
        if let Some((scope, _)) = self.ttl_ms.iter().find(|(_, ttl)| **ttl == 0) {
            return Err(format!("cache.ttl_ms.{scope} must be greater than 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ttl_ms["mediaData"], 600_000);
        assert_eq!(config.save_debounce(true), Duration::from_millis(100));
    }

    #[test]
    fn rejects_zero_sizes() {
        let config = CacheConfig {
            max_size: 0,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
