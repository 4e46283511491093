use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::backend::ProviderBackend;
use super::descriptor::{DescriptorFields, MediaType, RequestDescriptor};
use crate::cache::{CacheOptions, ScopedCache};
use crate::error::{ApiError, ErrorContext, ErrorCore, GuardOutcome, Recovery};
use crate::scheduler::{Priority, RequestOptions, RequestScheduler};

/// Where a fetched value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Cache,
    Network,
    /// Last known good value served after a failed network call.
    Fallback,
    /// Placeholder returned by `degrade_gracefully`.
    Degraded,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataSource::Cache => "cache",
            DataSource::Network => "network",
            DataSource::Fallback => "fallback",
            DataSource::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResult {
    pub data: Value,
    pub source: DataSource,
}

/// Consumer-facing entry point for one provider: descriptor validation,
/// cache lookup, scheduled network access and guarded recovery.
#[derive(Clone)]
pub struct ApiFacade {
    backend: Arc<dyn ProviderBackend>,
    cache: ScopedCache,
    scheduler: RequestScheduler,
    errors: Arc<ErrorCore>,
}

impl ApiFacade {
    pub fn new(
        backend: Arc<dyn ProviderBackend>,
        cache: ScopedCache,
        scheduler: RequestScheduler,
        errors: Arc<ErrorCore>,
    ) -> Self {
        Self {
            backend,
            cache,
            scheduler,
            errors,
        }
    }

    pub fn provider(&self) -> &'static str {
        self.backend.id()
    }

    /// Validates host-supplied fields and resolves them.
    pub async fn fetch(&self, fields: DescriptorFields) -> Result<FetchResult, ApiError> {
        let descriptor = RequestDescriptor::parse(fields, self.backend.id())?;
        self.fetch_descriptor(descriptor).await
    }

    pub async fn fetch_descriptor(&self, descriptor: RequestDescriptor) -> Result<FetchResult, ApiError> {
        self.resolve(descriptor, Recovery::CacheFallback).await
    }

    /// Like [`fetch`](Self::fetch) but failures come back as a degraded
    /// placeholder instead of an error, for optional surfaces.
    pub async fn fetch_or_degrade(&self, fields: DescriptorFields) -> Result<FetchResult, ApiError> {
        let descriptor = RequestDescriptor::parse(fields, self.backend.id())?;
        self.resolve(descriptor, Recovery::DegradeGracefully).await
    }

    async fn resolve(&self, descriptor: RequestDescriptor, recovery: Recovery) -> Result<FetchResult, ApiError> {
        let provider = self.backend.id();
        let descriptor = descriptor.with_default_user(self.backend.current_user());
        let key = descriptor.cache_key();
        let options = CacheOptions::new(descriptor.scope())
            .provider(provider)
            .tag(descriptor.kind());

        if !descriptor.nocache() {
            if let Some(data) = self.cache.get(&key, &options) {
                debug!(provider, kind = descriptor.kind(), "🎯 Served from cache");
                return Ok(FetchResult {
                    data,
                    source: DataSource::Cache,
                });
            }
        }

        let context = ErrorContext::new("api")
            .with_operation(format!("fetch:{}", descriptor.kind()))
            .with_provider(provider)
            .with_fallback_key(key.canonical().to_string());
        let outcome = self
            .errors
            .guard(|| self.scheduled_fetch(descriptor.clone()), Some(recovery), context)
            .await?;

        let result = match outcome {
            GuardOutcome::Fresh(data) => {
                self.cache.set(&key, data.clone(), &options);
                FetchResult {
                    data,
                    source: DataSource::Network,
                }
            }
            GuardOutcome::Fallback(data) => FetchResult {
                data,
                source: DataSource::Fallback,
            },
            GuardOutcome::Degraded(degraded) => FetchResult {
                data: degraded.to_value(),
                source: DataSource::Degraded,
            },
        };
        Ok(result)
    }

    /// One scheduled network read, normalized.
    async fn scheduled_fetch(&self, descriptor: RequestDescriptor) -> Result<Value, ApiError> {
        let backend = Arc::clone(&self.backend);
        let request = descriptor.clone();
        let options = RequestOptions::new()
            .priority(Priority::Normal)
            .provider(backend.id())
            .metadata(serde_json::json!({ "type": descriptor.kind() }));
        let raw = self
            .scheduler
            .add(
                move || {
                    let backend = Arc::clone(&backend);
                    let request = request.clone();
                    async move { backend.fetch(&request).await }
                },
                options,
            )
            .await?;
        self.backend.normalize(&descriptor, raw)
    }

    /// Applies `updates` to `media_id` and drops every cached view it
    /// affects: the media itself and, when the status changed, the viewer's
    /// lists and stats.
    pub async fn update(&self, media_id: u64, updates: Value) -> Result<Value, ApiError> {
        let provider = self.backend.id();
        let updates = Arc::new(updates);
        let context = ErrorContext::new("api")
            .with_operation("update")
            .with_provider(provider);

        let outcome = self
            .errors
            .guard(|| self.scheduled_mutation(media_id, Arc::clone(&updates)), Some(Recovery::RetryOnce), context)
            .await?;
        let entry = outcome
            .value()
            .ok_or_else(|| ApiError::unknown("mutation produced no entry").with_provider(provider))?;

        let mut dropped = self.cache.invalidate_by_media(&media_id.to_string(), Some(provider));
        if updates.get("status").is_some() {
            if let Some(user) = self.backend.current_user() {
                dropped += self.cache.invalidate_by_user(&user, Some(provider));
            }
        }
        info!(provider, media_id, dropped, "✏️ Entry updated");
        Ok(entry)
    }

    async fn scheduled_mutation(&self, media_id: u64, updates: Arc<Value>) -> Result<Value, ApiError> {
        let backend = Arc::clone(&self.backend);
        let options = RequestOptions::new()
            .priority(Priority::High)
            .provider(backend.id())
            .max_attempts(1)
            .metadata(serde_json::json!({ "mutation": media_id }));
        self.scheduler
            .add(
                move || {
                    let backend = Arc::clone(&backend);
                    let updates = Arc::clone(&updates);
                    async move { backend.mutate(media_id, &updates).await }
                },
                options,
            )
            .await
    }

    pub fn get_url(&self, media_id: u64, media_type: MediaType) -> String {
        self.backend.media_url(media_id, media_type)
    }
}

impl fmt::Debug for ApiFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiFacade")
            .field("provider", &self.backend.id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::backend::MockProviderBackend;
    use crate::cache::{CacheConfig, KeyDescriptor, Scope};
    use crate::error::{ErrorCoreConfig, ErrorKind};
    use crate::scheduler::SchedulerConfig;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn facade(mock: MockProviderBackend) -> (ApiFacade, ScopedCache) {
        let cache = ScopedCache::new(CacheConfig::default());
        let mut config = SchedulerConfig::default();
        config.max_retries = 1;
        let errors = Arc::new(ErrorCore::new(ErrorCoreConfig {
            retry_once_delay_ms: 10,
            ..ErrorCoreConfig::default()
        }));
        let facade = ApiFacade::new(Arc::new(mock), cache.clone(), RequestScheduler::new(config), errors);
        (facade, cache)
    }

    fn base_mock() -> MockProviderBackend {
        let mut mock = MockProviderBackend::new();
        mock.expect_id().return_const("anilist");
        mock.expect_current_user().return_const(Some("u".to_string()));
        mock.expect_normalize().returning(|_, raw| Ok(raw));
        mock
    }

    fn single(id: u64) -> DescriptorFields {
        DescriptorFields {
            kind: Some("single".into()),
            media_id: Some(id),
            ..DescriptorFields::default()
        }
    }

    #[tokio::test]
    async fn cold_then_warm_read() {
        let mut mock = base_mock();
        mock.expect_fetch()
            .times(1)
            .returning(|_| Ok(json!({"id": 1, "title": "Frieren"})));
        let (facade, cache) = facade(mock);

        let cold = facade.fetch(single(1)).await.unwrap();
        assert_eq!(cold.source, DataSource::Network);
        let warm = facade.fetch(single(1)).await.unwrap();
        assert_eq!(warm.source, DataSource::Cache);
        assert_eq!(warm.data, cold.data);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn nocache_bypasses_lookup() {
        let mut mock = base_mock();
        mock.expect_fetch().times(2).returning(|_| Ok(json!({"id": 1})));
        let (facade, _) = facade(mock);

        let fields = DescriptorFields {
            nocache: true,
            ..single(1)
        };
        facade.fetch(fields.clone()).await.unwrap();
        let again = facade.fetch(fields).await.unwrap();
        assert_eq!(again.source, DataSource::Network);
    }

    #[tokio::test]
    async fn invalid_descriptor_never_reaches_backend() {
        let mut mock = base_mock();
        mock.expect_fetch().never();
        let (facade, _) = facade(mock);

        let err = facade
            .fetch(DescriptorFields {
                kind: Some("timeline".into()),
                ..DescriptorFields::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn failed_read_falls_back_to_last_good_value() {
        let mut mock = base_mock();
        let mut calls = 0;
        mock.expect_fetch().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(json!({"id": 7}))
            } else {
                Err(ApiError::new(ErrorKind::ClientError, "bad request"))
            }
        });
        let (facade, _) = facade(mock);

        let fields = DescriptorFields {
            nocache: true,
            ..single(7)
        };
        facade.fetch(fields.clone()).await.unwrap();
        let recovered = facade.fetch(fields).await.unwrap();
        assert_eq!(recovered.source, DataSource::Fallback);
        assert_eq!(recovered.data, json!({"id": 7}));
    }

    #[tokio::test]
    async fn optional_surface_degrades() {
        let mut mock = base_mock();
        mock.expect_fetch()
            .returning(|_| Err(ApiError::new(ErrorKind::PrivateList, "Private User")));
        let (facade, _) = facade(mock);

        let result = facade
            .fetch_or_degrade(DescriptorFields {
                kind: Some("stats".into()),
                ..DescriptorFields::default()
            })
            .await
            .unwrap();
        assert_eq!(result.source, DataSource::Degraded);
        assert_eq!(result.data["degraded"], json!(true));
        assert_eq!(result.data["errorType"], json!("PRIVATE_LIST"));
    }

    #[tokio::test]
    async fn update_invalidates_media_and_user_views() {
        let mut mock = base_mock();
        mock.expect_mutate()
            .times(1)
            .returning(|id, _| Ok(json!({"mediaId": id, "status": "COMPLETED"})));
        let (facade, cache) = facade(mock);

        let media = CacheOptions::new(Scope::MediaData).provider("anilist");
        let lists = CacheOptions::new(Scope::UserData).provider("anilist");
        let key = |id: u64| KeyDescriptor::new().field("type", "single").field("mediaId", id);
        let list_key = KeyDescriptor::new().field("type", "list").field("username", "u");
        cache.set(key(42), json!({"id": 42}), &media);
        cache.set(key(43), json!({"id": 43}), &media);
        cache.set(&list_key, json!([42, 43]), &lists);

        let entry = facade.update(42, json!({"status": "COMPLETED"})).await.unwrap();
        assert_eq!(entry["status"], json!("COMPLETED"));
        assert!(cache.get(key(42), &media).is_none());
        assert!(cache.get(&list_key, &lists).is_none());
        assert!(cache.get(key(43), &media).is_some());
    }

    #[tokio::test]
    async fn update_retries_once() {
        let mut mock = base_mock();
        let mut calls = 0;
        mock.expect_mutate().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(ApiError::server(502, "bad gateway"))
            } else {
                Ok(json!({"progress": 3}))
            }
        });
        let (facade, _) = facade(mock);

        let entry = facade.update(5, json!({"progress": 3})).await.unwrap();
        assert_eq!(entry, json!({"progress": 3}));
    }

    #[test]
    fn url_comes_from_backend() {
        let mut mock = base_mock();
        mock.expect_media_url()
            .returning(|id, kind| format!("https://anilist.co/{}/{}", kind.as_str().to_lowercase(), id));
        let (facade, _) = facade(mock);
        assert_eq!(facade.get_url(1, MediaType::Manga), "https://anilist.co/manga/1");
    }
}
