use anisync::api::{ApiFacade, DataSource, DescriptorFields, MediaType, ProviderBackend, RequestDescriptor};
use anisync::cache::{CacheConfig, CacheOptions, Scope, ScopeId, ScopedCache};
use anisync::clock::{ManualClock, SharedClock};
use anisync::error::{ApiError, ErrorCore, ErrorCoreConfig, ErrorKind};
use anisync::resilience::CircuitState;
use anisync::scheduler::{ProviderLimits, RequestOptions, RequestScheduler, SchedulerConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const PROVIDER: &str = "A";

/// Backend answering every read with its descriptor's id and counting calls.
#[derive(Debug, Default)]
struct FakeBackend {
    fetches: AtomicUsize,
    mutations: AtomicUsize,
}

#[async_trait]
impl ProviderBackend for FakeBackend {
    fn id(&self) -> &'static str {
        PROVIDER
    }

    async fn fetch(&self, request: &RequestDescriptor) -> Result<Value, ApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "type": request.kind(), "mediaId": request.media_id() }))
    }

    async fn mutate(&self, media_id: u64, updates: &Value) -> Result<Value, ApiError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "mediaId": media_id, "entry": updates }))
    }

    fn normalize(&self, _request: &RequestDescriptor, raw: Value) -> Result<Value, ApiError> {
        Ok(json!({ "normalized": raw }))
    }

    fn media_url(&self, media_id: u64, media_type: MediaType) -> String {
        format!("https://example.org/{}/{}", media_type.as_str().to_lowercase(), media_id)
    }

    fn current_user(&self) -> Option<String> {
        Some("u".to_string())
    }
}

fn facade(backend: Arc<FakeBackend>) -> (ApiFacade, ScopedCache, RequestScheduler) {
    let cache = ScopedCache::new(CacheConfig::default());
    let scheduler = RequestScheduler::new(SchedulerConfig::default());
    let errors = Arc::new(ErrorCore::new(ErrorCoreConfig::default()));
    let facade = ApiFacade::new(backend, cache.clone(), scheduler.clone(), errors);
    (facade, cache, scheduler)
}

fn single(media_id: u64) -> DescriptorFields {
    DescriptorFields {
        kind: Some("single".into()),
        provider: Some(PROVIDER.into()),
        media_type: Some("ANIME".into()),
        username: Some("u".into()),
        media_id: Some(media_id),
        ..DescriptorFields::default()
    }
}

fn strict_limits() -> ProviderLimits {
    ProviderLimits {
        max_requests: 3,
        window_ms: 1_000,
        buffer: 1.0,
        ..ProviderLimits::default()
    }
}

#[tokio::test]
async fn cold_read_then_warm_read() {
    let backend = Arc::new(FakeBackend::default());
    let (facade, cache, scheduler) = facade(Arc::clone(&backend));

    let cold = facade.fetch(single(1)).await.unwrap();
    assert_eq!(cold.source, DataSource::Network);
    assert_eq!(backend.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.metrics().completed, 1);

    let media = ScopeId::for_provider(PROVIDER, Scope::MediaData);
    assert_eq!(cache.scope_len(&media), 1);
    assert_eq!(cache.effective_ttl(&media), Duration::from_millis(600_000));

    let warm = facade.fetch(single(1)).await.unwrap();
    assert_eq!(warm.source, DataSource::Cache);
    assert_eq!(warm.data, cold.data);
    assert_eq!(backend.fetches.load(Ordering::SeqCst), 1);

    scheduler.destroy().await;
}

#[tokio::test]
async fn mutation_invalidates_media_and_user_views() {
    let backend = Arc::new(FakeBackend::default());
    let (facade, _cache, scheduler) = facade(Arc::clone(&backend));
    let list = DescriptorFields {
        kind: Some("list".into()),
        username: Some("u".into()),
        ..DescriptorFields::default()
    };

    facade.fetch(single(42)).await.unwrap();
    facade.fetch(single(43)).await.unwrap();
    facade.fetch(list.clone()).await.unwrap();
    assert_eq!(backend.fetches.load(Ordering::SeqCst), 3);

    facade.update(42, json!({ "status": "COMPLETED" })).await.unwrap();
    assert_eq!(backend.mutations.load(Ordering::SeqCst), 1);

    assert_eq!(facade.fetch(single(42)).await.unwrap().source, DataSource::Network);
    assert_eq!(facade.fetch(list).await.unwrap().source, DataSource::Network);
    assert_eq!(facade.fetch(single(43)).await.unwrap().source, DataSource::Cache);

    assert_eq!(facade.get_url(42, MediaType::Anime), "https://example.org/anime/42");
    scheduler.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn rate_window_applies_back_pressure() {
    let scheduler = RequestScheduler::new(SchedulerConfig::default().with_provider(PROVIDER, strict_limits()));
    let start = Instant::now();
    let dispatched = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let dispatched = Arc::clone(&dispatched);
            scheduler.submit(
                move || {
                    let dispatched = Arc::clone(&dispatched);
                    async move {
                        dispatched.lock().push((i, Instant::now()));
                        Ok::<_, ApiError>(i)
                    }
                },
                RequestOptions::new().provider(PROVIDER),
            )
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let times: Vec<Duration> = dispatched.lock().iter().map(|(_, at)| *at - start).collect();
    assert_eq!(times.len(), 5);
    assert!(times[..3].iter().all(|t| *t < Duration::from_millis(100)), "{times:?}");
    assert!(times[3] >= Duration::from_millis(1_000), "{times:?}");
    assert!(times[4] >= times[3] + Duration::from_millis(700), "{times:?}");
    assert_eq!(scheduler.metrics().rate_limit_hits, 2);
}

#[tokio::test(start_paused = true)]
async fn server_errors_retry_with_growing_delay() {
    let scheduler = RequestScheduler::new(SchedulerConfig::default().with_provider(
        PROVIDER,
        ProviderLimits {
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 10_000,
            ..ProviderLimits::default()
        },
    ));
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let tracker = Arc::clone(&attempts);
    let result = scheduler
        .add(
            move || {
                let tracker = Arc::clone(&tracker);
                async move {
                    let mut calls = tracker.lock();
                    calls.push(Instant::now());
                    if calls.len() < 3 {
                        Err(ApiError::server(503, "upstream unavailable"))
                    } else {
                        Ok("done")
                    }
                }
            },
            RequestOptions::new().provider(PROVIDER).max_attempts(3),
        )
        .await;

    assert_eq!(result.unwrap(), "done");
    let calls = attempts.lock().clone();
    assert_eq!(calls.len(), 3);
    let first_gap = calls[1] - calls[0];
    let second_gap = calls[2] - calls[1];
    assert!(first_gap >= Duration::from_millis(1_000) && first_gap <= Duration::from_millis(3_000), "{first_gap:?}");
    assert!(second_gap >= Duration::from_millis(2_000) && second_gap <= Duration::from_millis(5_000), "{second_gap:?}");
    assert_eq!(scheduler.metrics().retries, 2);
}

#[tokio::test(start_paused = true)]
async fn breaker_trips_and_recovers() {
    let scheduler = RequestScheduler::new(SchedulerConfig::default().with_provider(
        PROVIDER,
        ProviderLimits {
            breaker_threshold: 3,
            breaker_cooldown_ms: 60_000,
            ..ProviderLimits::default()
        },
    ));
    let network_calls = Arc::new(AtomicUsize::new(0));
    let options = || RequestOptions::new().provider(PROVIDER).max_attempts(1);

    let mut kinds = Vec::new();
    for _ in 0..5 {
        let calls = Arc::clone(&network_calls);
        let err = scheduler
            .add(
                move || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(ApiError::network("connection reset"))
                    }
                },
                options(),
            )
            .await
            .unwrap_err();
        kinds.push(err.kind);
    }
    assert_eq!(network_calls.load(Ordering::SeqCst), 3);
    assert_eq!(&kinds[..3], &[ErrorKind::NetworkError; 3]);
    assert_eq!(&kinds[3..], &[ErrorKind::ServiceUnavailable; 2]);
    assert_eq!(scheduler.breaker(PROVIDER).state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(30)).await;
    let early = scheduler.add(|| async { Ok::<_, ApiError>(1) }, options()).await;
    assert_eq!(early.unwrap_err().kind, ErrorKind::ServiceUnavailable);

    tokio::time::advance(Duration::from_secs(30)).await;
    let trial = scheduler.add(|| async { Ok::<_, ApiError>(2) }, options()).await;
    assert_eq!(trial.unwrap(), 2);

    let breaker = scheduler.breaker(PROVIDER);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.snapshot().consecutive_failures, 0);
    assert_eq!(network_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig::default().with_snapshot(dir.path().join("cache.json"));
    let clock = Arc::new(ManualClock::starting_now());
    let shared: SharedClock = clock.clone();

    let user = CacheOptions::new(Scope::UserData).provider(PROVIDER);
    let media = CacheOptions::new(Scope::MediaData).provider(PROVIDER);
    let search = CacheOptions::new(Scope::SearchResults).provider(PROVIDER);

    let cache = ScopedCache::with_clock(config.clone(), Arc::clone(&shared));
    assert!(cache.set("list:u", json!(["a", "b"]), &user));
    assert!(cache.set("media:1", json!({"id": 1}), &media));
    assert!(cache.set("search:frieren", json!([1, 2, 3]), &search));
    cache.destroy().await;

    // searchResults (2 min) expires while the process is down, the rest does not.
    clock.advance(Duration::from_secs(5 * 60));
    let restarted = ScopedCache::with_clock(config, shared);
    assert!(restarted.load_from_disk().await > 0);
    assert_eq!(restarted.get("list:u", &user), Some(json!(["a", "b"])));
    assert_eq!(restarted.get("media:1", &media), Some(json!({"id": 1})));
    assert_eq!(restarted.get("search:frieren", &search), None);
    restarted.destroy().await;
}
