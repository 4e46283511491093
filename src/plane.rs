use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::api::{ApiFacade, ProviderBackend};
use crate::cache::{CacheStatistics, ScopedCache};
use crate::config::Config;
use crate::error::{ErrorCore, ErrorHealth, HealthState};
use crate::scheduler::{RequestScheduler, SchedulerHealth, SchedulerMetrics, SchedulerStatus};

/// Owns the three shared components. Facades for individual providers are
/// cheap views over it.
#[derive(Clone)]
pub struct DataPlane {
    cache: ScopedCache,
    scheduler: RequestScheduler,
    errors: Arc<ErrorCore>,
}

/// Combined health report, as printed by `--health-check`.
#[derive(Debug, Clone, Serialize)]
pub struct PlaneHealth {
    pub healthy: bool,
    pub cache: CacheStatistics,
    pub scheduler: SchedulerHealth,
    pub scheduler_metrics: SchedulerMetrics,
    pub errors: ErrorHealth,
}

impl DataPlane {
    /// Builds the components from `config` and loads the cache snapshot.
    pub async fn start(config: &Config) -> Self {
        let plane = Self::from_parts(
            ScopedCache::new(config.cache_config()),
            RequestScheduler::new(config.scheduler.clone()),
            Arc::new(ErrorCore::new(config.errors.clone())),
        );
        ErrorCore::install_global(Arc::clone(&plane.errors));

        let restored = plane.cache.load_from_disk().await;
        info!("🚀 Data plane listo ({} entradas restauradas)", restored);
        plane
    }

    pub fn from_parts(cache: ScopedCache, scheduler: RequestScheduler, errors: Arc<ErrorCore>) -> Self {
        Self {
            cache,
            scheduler,
            errors,
        }
    }

    pub fn cache(&self) -> &ScopedCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    pub fn errors(&self) -> &Arc<ErrorCore> {
        &self.errors
    }

    /// Facade for one provider over the shared components.
    pub fn facade(&self, backend: Arc<dyn ProviderBackend>) -> ApiFacade {
        ApiFacade::new(backend, self.cache.clone(), self.scheduler.clone(), Arc::clone(&self.errors))
    }

    pub fn health(&self) -> PlaneHealth {
        let scheduler = self.scheduler.health();
        let errors = self.errors.health_status();
        PlaneHealth {
            healthy: scheduler.status != SchedulerStatus::Unhealthy && errors.status != HealthState::Critical,
            cache: self.cache.stats(),
            scheduler,
            scheduler_metrics: self.scheduler.metrics(),
            errors,
        }
    }

    /// Drains the scheduler first so in-flight writes land in the cache,
    /// then destroys the cache, which performs the final save. Pending
    /// error-log lines are flushed last.
    pub async fn shutdown(&self) {
        info!("⚠️ Cerrando data plane...");
        self.scheduler.destroy().await;
        self.cache.destroy().await;
        self.errors.flush_log().await;
        info!("✅ Data plane cerrado");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheOptions, Scope};
    use serde_json::json;

    #[tokio::test]
    async fn restart_restores_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };

        let plane = DataPlane::start(&config).await;
        let options = CacheOptions::new(Scope::MediaData);
        plane.cache().set("media:1", json!({"id": 1}), &options);
        assert!(plane.health().healthy);
        plane.shutdown().await;

        let restarted = DataPlane::start(&config).await;
        assert_eq!(restarted.cache().get("media:1", &options), Some(json!({"id": 1})));
        restarted.shutdown().await;
    }

    #[tokio::test]
    async fn health_serializes() {
        let plane = DataPlane::from_parts(
            ScopedCache::new(Default::default()),
            RequestScheduler::new(Default::default()),
            Arc::new(ErrorCore::new(Default::default())),
        );
        let value = serde_json::to_value(plane.health()).unwrap();
        assert_eq!(value["healthy"], json!(true));
        assert_eq!(value["scheduler"]["status"], json!("healthy"));
        assert_eq!(value["errors"]["status"], json!("healthy"));
    }
}
