use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::error::ErrorCoreConfig;
use crate::scheduler::SchedulerConfig;

/// Config file read when `ANISYNC_CONFIG` is not set.
pub const DEFAULT_CONFIG_FILE: &str = "anisync.toml";
/// Prefix for environment overrides, e.g. `ANISYNC__CACHE__MAX_SIZE=500`.
pub const ENV_PREFIX: &str = "ANISYNC";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    // Paths
    pub data_dir: PathBuf,
    /// Snapshot file name, relative to `data_dir` unless absolute.
    pub snapshot_file: PathBuf,

    /// Level for the `anisync` target; `RUST_LOG` still applies on top.
    pub log_level: String,

    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub errors: ErrorCoreConfig,
}

impl Config {
    /// Loads `.env`, then `anisync.toml` (or `$ANISYNC_CONFIG`), then
    /// `ANISYNC__*` environment variables. Later sources win.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = std::env::var("ANISYNC_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(Path::new(&file))
    }

    pub fn load_from(file: &Path) -> Result<Self> {
        let explicit = std::env::var_os("ANISYNC_CONFIG").is_some();
        let settings = config::Config::builder()
            .add_source(config::File::from(file).required(explicit))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("reading configuration from {}", file.display()))?;

        let config: Config = settings
            .try_deserialize()
            .context("configuración inválida")?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would make the data plane misbehave.
    ///
    /// # Validation Rules
    ///
    /// - Sizes, concurrency and timeouts must be non-zero
    /// - Rate buffers must lie in `(0, 1]`
    /// - `min_delay_ms <= base_delay_ms <= max_delay_ms`
    /// - `log_level` must be a tracing level
    pub fn validate(&self) -> Result<()> {
        self.cache.validate().map_err(anyhow::Error::msg)?;
        self.scheduler.validate().map_err(anyhow::Error::msg)?;

        if self.errors.max_buffer == 0 {
            anyhow::bail!("errors.max_buffer must be greater than 0");
        }
        if self.errors.fallback_capacity == 0 {
            anyhow::bail!("errors.fallback_capacity must be greater than 0");
        }
        if self.snapshot_file.as_os_str().is_empty() {
            anyhow::bail!("snapshot_file must not be empty");
        }
        self.log_level
            .parse::<tracing::Level>()
            .map_err(|_| anyhow::anyhow!("log_level '{}' is not a tracing level", self.log_level))?;
        Ok(())
    }

    pub fn snapshot_path(&self) -> PathBuf {
        if self.snapshot_file.is_absolute() {
            self.snapshot_file.clone()
        } else {
            self.data_dir.join(&self.snapshot_file)
        }
    }

    /// Cache settings with the snapshot path filled from `data_dir` when the
    /// `cache` section does not name one.
    pub fn cache_config(&self) -> CacheConfig {
        let mut cache = self.cache.clone();
        if cache.snapshot_path.is_none() {
            cache.snapshot_path = Some(self.snapshot_path());
        }
        cache
    }

    /// Secret-free summary for the startup log.
    pub fn summary(&self) -> String {
        let ms = |v: u64| humantime::format_duration(Duration::from_millis(v)).to_string();
        let providers: Vec<String> = self
            .scheduler
            .providers
            .iter()
            .map(|(name, limits)| {
                format!(
                    "{name} {}/{} (x{})",
                    limits.effective_cap(),
                    ms(limits.window_ms),
                    limits.max_concurrent
                )
            })
            .collect();

        format!(
            "Config Summary:\n  \
            Cache: {} per scope, compression={}, refresh={}, snapshot {}\n  \
            Scheduler: {} concurrent, {} attempts, timeout {}\n  \
            Providers: {}\n  \
            Errors: buffer {}, alert window {}\n  \
            Log level: {}",
            self.cache.max_size,
            self.cache.enable_compression,
            self.cache.background_refresh,
            self.cache_config()
                .snapshot_path
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            self.scheduler.max_concurrent,
            self.scheduler.max_retries,
            ms(self.scheduler.request_timeout_ms),
            providers.join(", "),
            self.errors.max_buffer,
            ms(self.errors.alert_window_ms),
            self.log_level,
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "data".into(),
            snapshot_file: "cache.json".into(),
            log_level: "info".to_string(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            errors: ErrorCoreConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.snapshot_path(), PathBuf::from("data").join("cache.json"));
        assert!(config.summary().contains("anilist 72/1m"));
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
data_dir = "/tmp/anisync"
log_level = "debug"

[cache]
max_size = 250

[scheduler.providers.anilist]
max_requests = 30
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.cache.max_size, 250);
        assert_eq!(config.scheduler.providers["anilist"].max_requests, 30);
        // Untouched fields of an overridden provider keep their defaults.
        assert_eq!(config.scheduler.providers["anilist"].window_ms, 60_000);
        assert_eq!(config.cache_config().snapshot_path, Some(PathBuf::from("/tmp/anisync/cache.json")));
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config::default();
        config.log_level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache.max_size = 0;
        assert!(config.validate().is_err());
    }
}
