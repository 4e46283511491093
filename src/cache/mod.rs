//! # Cache Module
//!
//! Multi-scope response cache for the data plane.
//!
//! Entries live in one store per [`ScopeId`] (`userData`, `anilist:userData`,
//! ...). Each store is keyed by a canonical [`CacheKey`], built either from a
//! raw string or from a [`KeyDescriptor`] whose field order does not matter.
//!
//! ## Features
//!
//! - **TTL per scope**: `custom ?? ttl[provider:scope] ?? ttl[scope] ?? 5 min`
//! - **Targeted invalidation**: `byUser`, `byMedia` and `byTag` indexes
//! - **LRU eviction**: per-store bound, evicted in batches
//! - **Compression**: large values are stored as an opaque text blob
//! - **Background refresh**: hits close to expiry re-fetch off the hot path
//! - **Persistence**: debounced snapshot to a single JSON file
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use anisync::cache::{CacheConfig, CacheOptions, KeyDescriptor, Scope, ScopedCache};
//! use serde_json::json;
//!
//! let cache = ScopedCache::new(CacheConfig::default());
//! let key = KeyDescriptor::new().field("type", "single").field("mediaId", 1);
//! let opts = CacheOptions::new(Scope::MediaData).provider("anilist");
//!
//! cache.set(&key, json!({"id": 1}), &opts);
//! assert_eq!(cache.get(&key, &opts), Some(json!({"id": 1})));
//! ```

pub mod compression;
pub mod config;
pub mod entry;
pub mod index;
pub mod key;
pub mod persistence;
pub mod refresh;
pub mod stats;
pub mod ttl;

pub use config::CacheConfig;
pub use entry::CacheEntry;
pub use index::{IndexKind, IndexRef, Indexes};
pub use key::{CacheKey, KeyDescriptor, KeyInput, Scope, ScopeId};
pub use refresh::{refresh_with, RefreshCallback};
pub use stats::CacheStatistics;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::clock::{self, SharedClock};
use crate::storage::{JsonStorage, StorageStats};
use entry::Payload;
use persistence::{Snapshot, MIN_SNAPSHOT_VERSION, SNAPSHOT_VERSION};
use refresh::RefreshCoordinator;
use stats::CacheStats;

/// Per-call placement and policy.
#[derive(Clone)]
pub struct CacheOptions {
    pub scope: Scope,
    pub provider: Option<String>,
    /// Overrides the scope TTL for this entry.
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    pub refresh: Option<RefreshCallback>,
}

impl CacheOptions {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            provider: None,
            ttl: None,
            tags: Vec::new(),
            refresh: None,
        }
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn refresh(mut self, callback: RefreshCallback) -> Self {
        self.refresh = Some(callback);
        self
    }

    pub fn scope_id(&self) -> ScopeId {
        ScopeId::new(self.scope, self.provider.as_deref())
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("scope", &self.scope_id().to_string())
            .field("ttl", &self.ttl)
            .field("tags", &self.tags)
            .field("refresh", &self.refresh.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct CacheState {
    stores: HashMap<ScopeId, HashMap<CacheKey, CacheEntry>>,
    indexes: Indexes,
    access_log: HashMap<IndexRef, i64>,
}

impl CacheState {
    fn index(&mut self, target: &IndexRef, entry: &CacheEntry) {
        if let Some(user) = &entry.user {
            self.indexes.add(IndexKind::ByUser, user, target.clone());
        }
        if let Some(media) = &entry.media_id {
            self.indexes.add(IndexKind::ByMedia, media, target.clone());
        }
        for tag in &entry.tags {
            self.indexes.add(IndexKind::ByTag, tag, target.clone());
        }
    }

    fn unindex(&mut self, target: &IndexRef, entry: &CacheEntry) {
        if let Some(user) = &entry.user {
            self.indexes.remove(IndexKind::ByUser, user, target);
        }
        if let Some(media) = &entry.media_id {
            self.indexes.remove(IndexKind::ByMedia, media, target);
        }
        for tag in &entry.tags {
            self.indexes.remove(IndexKind::ByTag, tag, target);
        }
        self.access_log.remove(target);
    }

    fn remove(&mut self, target: &IndexRef) -> Option<CacheEntry> {
        let store = self.stores.get_mut(&target.0)?;
        let entry = store.remove(&target.1)?;
        if store.is_empty() {
            self.stores.remove(&target.0);
        }
        self.unindex(target, &entry);
        Some(entry)
    }

    fn contains(&self, target: &IndexRef) -> bool {
        self.stores
            .get(&target.0)
            .is_some_and(|store| store.contains_key(&target.1))
    }

    /// Drops index references and access-log rows whose entry is gone.
    fn prune_dangling(&mut self) -> usize {
        let CacheState {
            stores,
            indexes,
            access_log,
        } = self;
        let live = |r: &IndexRef| stores.get(&r.0).is_some_and(|s| s.contains_key(&r.1));
        let dropped = indexes.retain(|r| live(r));
        access_log.retain(|r, _| live(r));
        dropped
    }

    fn len(&self) -> usize {
        self.stores.values().map(HashMap::len).sum()
    }
}

struct CacheInner {
    config: CacheConfig,
    clock: SharedClock,
    state: Mutex<CacheState>,
    stats: CacheStats,
    storage: Option<JsonStorage>,
    save_lock: tokio::sync::Mutex<()>,
    save_generation: AtomicU64,
    critical_pending: AtomicBool,
    refresh: RefreshCoordinator,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    destroyed: AtomicBool,
}

/// Shared handle to the cache; clones point at the same stores.
#[derive(Clone)]
pub struct ScopedCache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for ScopedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedCache")
            .field("entries", &self.len())
            .field("snapshot", &self.inner.storage.as_ref().map(|s| s.path().to_path_buf()))
            .finish()
    }
}

enum Lookup {
    Miss,
    Expired,
    Hit { payload: Payload, near_expiry: bool },
}

impl ScopedCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, clock::system())
    }

    pub fn with_clock(config: CacheConfig, clock: SharedClock) -> Self {
        let storage = config.snapshot_path.clone().map(JsonStorage::new);
        info!(
            "🗄️ Caché iniciado: {} entradas por scope, persistencia {}",
            config.max_size,
            storage
                .as_ref()
                .map(|s| s.path().display().to_string())
                .unwrap_or_else(|| "desactivada".to_string())
        );

        Self {
            inner: Arc::new(CacheInner {
                refresh: RefreshCoordinator::new(config.max_background_refreshes),
                config,
                clock,
                state: Mutex::new(CacheState::default()),
                stats: CacheStats::default(),
                storage,
                save_lock: tokio::sync::Mutex::new(()),
                save_generation: AtomicU64::new(0),
                critical_pending: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn now(&self) -> i64 {
        self.inner.clock.now_ms()
    }

    fn ttl_ms(&self, scope: &ScopeId, custom_ms: Option<u64>) -> u64 {
        let config = &self.inner.config;
        ttl::resolve_ttl(&config.ttl_ms, config.default_ttl_ms, scope, custom_ms)
    }

    /// TTL applied to entries of `scope` without a custom TTL.
    pub fn effective_ttl(&self, scope: &ScopeId) -> Duration {
        Duration::from_millis(self.ttl_ms(scope, None))
    }

    /// Returns the fresh value stored under `key`, or `None` on miss or
    /// expiry. With a refresh callback in `options`, a miss or a hit older
    /// than `refresh_threshold` of the TTL schedules a background refresh.
    pub fn get(&self, key: impl Into<KeyInput>, options: &CacheOptions) -> Option<Value> {
        let input = key.into();
        let target = IndexRef(options.scope_id(), input.key());
        let now = self.now();
        let override_ms = options.ttl.map(|d| d.as_millis() as u64);

        let lookup = {
            let mut state = self.inner.state.lock();
            let found = state
                .stores
                .get_mut(&target.0)
                .and_then(|store| store.get_mut(&target.1));
            let lookup = match found {
                None => Lookup::Miss,
                Some(entry) => {
                    let ttl = self.ttl_ms(&target.0, entry.custom_ttl.or(override_ms));
                    if entry.is_fresh(now, ttl) {
                        entry.access_count += 1;
                        let near_expiry =
                            entry.age_ms(now) as f64 > ttl as f64 * self.inner.config.refresh_threshold;
                        Lookup::Hit {
                            payload: entry.payload(),
                            near_expiry,
                        }
                    } else {
                        Lookup::Expired
                    }
                }
            };
            match &lookup {
                Lookup::Hit { .. } => {
                    state.access_log.insert(target.clone(), now);
                }
                Lookup::Expired => {
                    state.remove(&target);
                }
                Lookup::Miss => {}
            }
            lookup
        };

        match lookup {
            Lookup::Miss | Lookup::Expired => {
                CacheStats::bump(&self.inner.stats.misses);
                if matches!(lookup, Lookup::Expired) {
                    CacheStats::bump(&self.inner.stats.expired);
                    debug!("⏰ Entrada expirada removida: {} [{}]", target.1, target.0);
                } else {
                    debug!("❌ Cache miss: {} [{}]", target.1, target.0);
                }
                self.spawn_refresh(target, input, options);
                None
            }
            Lookup::Hit { payload, near_expiry } => {
                CacheStats::bump(&self.inner.stats.hits);
                debug!("✅ Cache hit: {} [{}]", target.1, target.0);
                let (value, decoded) = payload.into_value();
                if !decoded {
                    CacheStats::bump(&self.inner.stats.decompression_failures);
                    warn!("Could not decompress {} [{}], returning raw blob", target.1, target.0);
                }
                if near_expiry {
                    self.spawn_refresh(target, input, options);
                }
                Some(value)
            }
        }
    }

    /// Typed [`get`](Self::get); a value that does not deserialize is a miss.
    pub fn get_as<T: DeserializeOwned>(&self, key: impl Into<KeyInput>, options: &CacheOptions) -> Option<T> {
        let value = self.get(key, options)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                debug!("Cached value has unexpected shape: {}", e);
                None
            }
        }
    }

    /// Stores `value`, replacing any previous entry and its index
    /// memberships, then enforces the store bound and schedules a save.
    /// Returns `false` once the cache has been destroyed.
    pub fn set(&self, key: impl Into<KeyInput>, value: Value, options: &CacheOptions) -> bool {
        if self.inner.destroyed.load(Ordering::Acquire) {
            warn!("Cache destroyed, ignoring set");
            return false;
        }

        let input = key.into();
        let target = IndexRef(options.scope_id(), input.key());
        let now = self.now();

        let mut entry = self.build_entry(value, now).with_custom_ttl(options.ttl);
        entry.tags = options.tags.iter().cloned().collect();
        entry.provider = options.provider.clone();
        if let Some(descriptor) = input.descriptor() {
            if target.0.scope.is_user_owned() {
                entry.user = descriptor.user();
            }
            entry.media_id = descriptor.media_id();
        }

        let evicted = {
            let mut state = self.inner.state.lock();
            if let Some(previous) = state.remove(&target) {
                if input.descriptor().is_none() {
                    entry.user = previous.user;
                    entry.media_id = previous.media_id;
                }
            }
            state.index(&target, &entry);
            state.access_log.insert(target.clone(), now);
            state
                .stores
                .entry(target.0.clone())
                .or_default()
                .insert(target.1.clone(), entry);
            self.enforce_size(&mut state, &target)
        };

        CacheStats::bump(&self.inner.stats.sets);
        if evicted > 0 {
            CacheStats::add(&self.inner.stats.evictions, evicted as u64);
            debug!("🧹 Evicted {} entries from {}", evicted, target.0);
        }
        self.schedule_save(true);
        true
    }

    /// Typed [`set`](Self::set).
    pub fn set_as<T: Serialize>(&self, key: impl Into<KeyInput>, value: &T, options: &CacheOptions) -> bool {
        match serde_json::to_value(value) {
            Ok(value) => self.set(key, value, options),
            Err(e) => {
                warn!("Could not serialize value for cache: {}", e);
                false
            }
        }
    }

    fn build_entry(&self, value: Value, now: i64) -> CacheEntry {
        let config = &self.inner.config;
        if config.enable_compression && compression::serialized_size(&value) > config.compression_threshold {
            match compression::compress(&value) {
                Ok(packed) => {
                    CacheStats::bump(&self.inner.stats.compressions);
                    return CacheEntry::packed(packed, now);
                }
                Err(e) => warn!("Compression failed, storing plain value: {}", e),
            }
        }
        CacheEntry::plain(value, now)
    }

    /// Evicts `len - max_size + batch_size` least recently accessed entries
    /// when the store is over its bound. The entry just written is never a
    /// candidate.
    fn enforce_size(&self, state: &mut CacheState, just_set: &IndexRef) -> usize {
        let config = &self.inner.config;
        let Some(store) = state.stores.get(&just_set.0) else {
            return 0;
        };
        if store.len() <= config.max_size {
            return 0;
        }
        let excess = store.len() - config.max_size + config.batch_size;

        let mut candidates: Vec<(i64, CacheKey)> = store
            .iter()
            .filter(|(key, _)| **key != just_set.1)
            .map(|(key, entry)| {
                let target = IndexRef(just_set.0.clone(), key.clone());
                let last = state.access_log.get(&target).copied().unwrap_or(entry.timestamp);
                (last, key.clone())
            })
            .collect();
        candidates.sort();

        let victims: Vec<IndexRef> = candidates
            .into_iter()
            .take(excess)
            .map(|(_, key)| IndexRef(just_set.0.clone(), key))
            .collect();
        for victim in &victims {
            state.remove(victim);
        }
        victims.len()
    }

    pub fn delete(&self, key: impl Into<KeyInput>, options: &CacheOptions) -> bool {
        let target = IndexRef(options.scope_id(), key.into().key());
        let removed = self.inner.state.lock().remove(&target).is_some();
        if removed {
            CacheStats::bump(&self.inner.stats.deletes);
            self.schedule_save(false);
        }
        removed
    }

    fn invalidate(&self, kind: IndexKind, name: &str, provider: Option<&str>) -> usize {
        let removed = {
            let mut state = self.inner.state.lock();
            let mut removed = 0;
            for target in state.indexes.refs(kind, name, provider) {
                if state.remove(&target).is_some() {
                    removed += 1;
                } else {
                    state.indexes.remove(kind, name, &target);
                }
            }
            removed
        };

        if removed > 0 {
            CacheStats::add(&self.inner.stats.deletes, removed as u64);
            debug!("🗑️ Invalidated {} entries for {:?} '{}'", removed, kind, name);
            self.schedule_save(false);
        }
        removed
    }

    /// Drops every entry indexed under `user`, across providers unless one is given.
    pub fn invalidate_by_user(&self, user: &str, provider: Option<&str>) -> usize {
        self.invalidate(IndexKind::ByUser, user, provider)
    }

    pub fn invalidate_by_media(&self, media_id: &str, provider: Option<&str>) -> usize {
        self.invalidate(IndexKind::ByMedia, media_id, provider)
    }

    pub fn invalidate_by_tag(&self, tag: &str, provider: Option<&str>) -> usize {
        self.invalidate(IndexKind::ByTag, tag, provider)
    }

    /// Clears one scope (under every provider prefix) or everything.
    pub fn clear(&self, scope: Option<Scope>) -> usize {
        let removed = self.drop_stores(|id| scope.is_none_or(|s| id.scope == s));
        info!("🧹 Cache cleared ({}): {} entries", scope.map_or("all", Scope::as_str), removed);
        removed
    }

    /// Clears every store belonging to `provider`.
    pub fn clear_by_source(&self, provider: &str) -> usize {
        let removed = self.drop_stores(|id| id.provider.as_deref() == Some(provider));
        info!("🧹 Cache cleared for provider {}: {} entries", provider, removed);
        removed
    }

    fn drop_stores(&self, matches: impl Fn(&ScopeId) -> bool) -> usize {
        let removed = {
            let mut state = self.inner.state.lock();
            let ids: Vec<ScopeId> = state.stores.keys().filter(|id| matches(id)).cloned().collect();
            let mut removed = 0;
            for id in ids {
                if let Some(store) = state.stores.remove(&id) {
                    removed += store.len();
                }
            }
            if state.stores.is_empty() {
                state.indexes.clear();
                state.access_log.clear();
            } else {
                state.prune_dangling();
            }
            removed
        };
        if removed > 0 {
            CacheStats::add(&self.inner.stats.deletes, removed as u64);
            self.schedule_save(false);
        }
        removed
    }

    /// Removes expired entries (optionally limited to a scope and/or
    /// provider) together with any dangling index or access-log rows.
    pub fn prune_expired(&self, scope: Option<Scope>, provider: Option<&str>) -> usize {
        let now = self.now();
        let removed = {
            let mut state = self.inner.state.lock();
            let expired: Vec<IndexRef> = state
                .stores
                .iter()
                .filter(|(id, _)| scope.is_none_or(|s| id.scope == s) && id.matches_provider(provider))
                .flat_map(|(id, store)| {
                    store
                        .iter()
                        .filter(|(_, entry)| !entry.is_fresh(now, self.ttl_ms(id, entry.custom_ttl)))
                        .map(|(key, _)| IndexRef(id.clone(), key.clone()))
                })
                .collect();
            for target in &expired {
                state.remove(target);
            }
            let dangling = state.prune_dangling();
            if dangling > 0 {
                debug!("Pruned {} dangling index references", dangling);
            }
            expired.len()
        };

        if removed > 0 {
            CacheStats::add(&self.inner.stats.expired, removed as u64);
            info!("🧹 Cache cleanup: removed {} expired entries", removed);
            self.schedule_save(false);
        }
        removed
    }

    pub fn contains(&self, key: impl Into<KeyInput>, options: &CacheOptions) -> bool {
        let target = IndexRef(options.scope_id(), key.into().key());
        self.inner.state.lock().contains(&target)
    }

    /// Whether any index still references `target`.
    pub fn is_indexed(&self, target: &IndexRef) -> bool {
        self.inner.state.lock().indexes.contains(target)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn scope_len(&self, scope: &ScopeId) -> usize {
        self.inner.state.lock().stores.get(scope).map_or(0, HashMap::len)
    }

    pub fn stats(&self) -> CacheStatistics {
        let (by_scope, index_names) = {
            let state = self.inner.state.lock();
            let by_scope: BTreeMap<String, usize> = state
                .stores
                .iter()
                .map(|(id, store)| (id.to_string(), store.len()))
                .collect();
            let names = [IndexKind::ByUser, IndexKind::ByMedia, IndexKind::ByTag]
                .into_iter()
                .map(|kind| state.indexes.len(kind))
                .sum();
            (by_scope, names)
        };
        self.inner.stats.snapshot(by_scope, index_names)
    }

    /// Location and size of the snapshot file, `None` without persistence.
    pub async fn snapshot_stats(&self) -> Option<StorageStats> {
        let storage = self.inner.storage.as_ref()?;
        match storage.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("⚠️ No se pudo consultar el snapshot de caché: {:#}", e);
                None
            }
        }
    }

    fn build_snapshot(&self) -> Snapshot {
        let state = self.inner.state.lock();
        let mut data: BTreeMap<String, Vec<(CacheKey, CacheEntry)>> = BTreeMap::new();
        for (id, store) in &state.stores {
            let mut entries: Vec<_> = store.iter().map(|(k, e)| (k.clone(), e.clone())).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            data.insert(id.to_string(), entries);
        }
        let mut access_log: Vec<(IndexRef, i64)> =
            state.access_log.iter().map(|(r, ts)| (r.clone(), *ts)).collect();
        access_log.sort();

        Snapshot {
            version: SNAPSHOT_VERSION.to_string(),
            timestamp: self.now(),
            stats: self.inner.stats.persisted(),
            data,
            indexes: state.indexes.to_snapshot(),
            access_log,
        }
    }

    /// Writes the full state to the snapshot file. Failures are logged and
    /// counted, never returned; the result says whether the write landed.
    pub async fn save_to_disk(&self) -> bool {
        let Some(storage) = &self.inner.storage else {
            return false;
        };
        let _serialized = self.inner.save_lock.lock().await;

        let snapshot = self.build_snapshot();
        let json = match serde_json::to_string(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                CacheStats::bump(&self.inner.stats.save_failures);
                warn!("⚠️ No se pudo serializar el snapshot de caché: {}", e);
                return false;
            }
        };

        match storage.write(&json).await {
            Ok(strategy) => {
                CacheStats::bump(&self.inner.stats.saves);
                debug!(?strategy, bytes = json.len(), "💾 Cache snapshot saved");
                true
            }
            Err(e) => {
                CacheStats::bump(&self.inner.stats.save_failures);
                warn!("⚠️ No se pudo guardar el snapshot de caché: {:#}", e);
                false
            }
        }
    }

    /// Merges the snapshot into memory, skipping entries whose TTL already
    /// elapsed. Unsupported or corrupt snapshots are discarded with a
    /// warning. Returns the number of entries restored.
    pub async fn load_from_disk(&self) -> usize {
        let Some(storage) = &self.inner.storage else {
            return 0;
        };
        let contents = match storage.read().await {
            Ok(Some(contents)) => contents,
            Ok(None) => {
                debug!("No cache snapshot at {}", storage.path().display());
                return 0;
            }
            Err(e) => {
                warn!("⚠️ No se pudo leer el snapshot de caché: {:#}", e);
                return 0;
            }
        };
        let snapshot: Snapshot = match serde_json::from_str(&contents) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("⚠️ Snapshot de caché corrupto, ignorando: {}", e);
                return 0;
            }
        };
        if !persistence::is_supported(&snapshot.version) {
            warn!(
                "Discarding cache snapshot version {} (minimum supported {})",
                snapshot.version, MIN_SNAPSHOT_VERSION
            );
            return 0;
        }

        let now = self.now();
        let (loaded, skipped) = {
            let mut state = self.inner.state.lock();
            let mut loaded = 0usize;
            let mut skipped = 0usize;
            for (scope, entries) in snapshot.data {
                let Ok(id) = scope.parse::<ScopeId>() else {
                    warn!("Skipping unknown scope '{}' in snapshot", scope);
                    continue;
                };
                for (key, entry) in entries {
                    if entry.is_fresh(now, self.ttl_ms(&id, entry.custom_ttl)) {
                        let target = IndexRef(id.clone(), key);
                        state.remove(&target);
                        state.stores.entry(id.clone()).or_default().insert(target.1, entry);
                        loaded += 1;
                    } else {
                        skipped += 1;
                    }
                }
            }

            state.indexes.extend(Indexes::from_snapshot(snapshot.indexes));
            for (target, ts) in snapshot.access_log {
                let last = state.access_log.entry(target).or_insert(ts);
                *last = (*last).max(ts);
            }
            state.prune_dangling();
            (loaded, skipped)
        };

        self.inner.stats.restore(snapshot.stats);
        CacheStats::bump(&self.inner.stats.loads);
        info!(
            "📂 Snapshot de caché cargado: {} entradas ({} expiradas descartadas)",
            loaded, skipped
        );
        loaded
    }

    /// Cancels pending timers and refreshes, waits for them, then performs
    /// a final save. Later `set` calls are ignored.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        if self.inner.storage.is_some() {
            self.save_to_disk().await;
        }
        info!("🛑 Cache destroyed ({} entries)", self.len());
    }

    fn schedule_save(&self, critical: bool) {
        if self.inner.storage.is_none() || self.inner.destroyed.load(Ordering::Acquire) {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        // a pending critical save keeps its deadline and captures this mutation too
        let pending = if critical {
            self.inner.critical_pending.swap(true, Ordering::AcqRel)
        } else {
            self.inner.critical_pending.load(Ordering::Acquire)
        };
        if pending {
            return;
        }

        let generation = self.inner.save_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let delay = self.inner.config.save_debounce(critical);
        let cache = self.clone();
        let token = self.inner.shutdown.clone();

        self.inner.tasks.spawn_on(
            async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        if cache.inner.save_generation.load(Ordering::Acquire) == generation {
                            cache.inner.critical_pending.store(false, Ordering::Release);
                            cache.save_to_disk().await;
                        }
                    }
                }
            },
            &handle,
        );
    }

    fn spawn_refresh(&self, target: IndexRef, input: KeyInput, options: &CacheOptions) {
        let Some(callback) = options.refresh.clone() else {
            return;
        };
        if !self.inner.config.background_refresh || self.inner.destroyed.load(Ordering::Acquire) {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let Some(guard) = self.inner.refresh.begin(target.clone()) else {
            debug!("Refresh already in flight for {}", target.1);
            return;
        };

        let permits = self.inner.refresh.permits();
        let cache = self.clone();
        let token = self.inner.shutdown.clone();
        let options = options.clone();

        self.inner.tasks.spawn_on(
            async move {
                let _guard = guard;
                let _permit = tokio::select! {
                    _ = token.cancelled() => return,
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };
                let result = tokio::select! {
                    _ = token.cancelled() => return,
                    result = callback() => result,
                };
                match result {
                    Ok(value) => {
                        if cache.set(input, value, &options) {
                            CacheStats::bump(&cache.inner.stats.background_refreshes);
                            debug!("🔄 Background refresh stored {} [{}]", target.1, target.0);
                        }
                    }
                    Err(e) => debug!("Background refresh for {} failed: {}", target.1, e),
                }
            },
            &handle,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ApiError;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn cache_at(clock: &Arc<ManualClock>, config: CacheConfig) -> ScopedCache {
        ScopedCache::with_clock(config, clock.clone())
    }

    fn media(provider: &str) -> CacheOptions {
        CacheOptions::new(Scope::MediaData).provider(provider)
    }

    fn media_key(user: &str, id: u32) -> KeyDescriptor {
        KeyDescriptor::new()
            .field("type", "single")
            .field("username", user)
            .field("mediaId", id)
    }

    #[test]
    fn set_then_get_with_equivalent_descriptor() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_at(&clock, CacheConfig::default());
        let written = KeyDescriptor::new().field("mediaId", 1).field("type", "single");
        let read = KeyDescriptor::new().field("type", "single").field("mediaId", 1).field("page", Value::Null);

        assert!(cache.set(&written, json!({"id": 1}), &media("anilist")));
        assert_eq!(cache.get(&read, &media("anilist")), Some(json!({"id": 1})));
        assert_eq!(cache.get(&read, &media("mal")), None);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn entries_expire_at_scope_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_at(&clock, CacheConfig::default());
        let opts = media("anilist");
        cache.set("k", json!(1), &opts);

        clock.set(600_000);
        assert_eq!(cache.get("k", &opts), Some(json!(1)));
        clock.set(600_001);
        assert_eq!(cache.get("k", &opts), None);
        assert!(!cache.contains("k", &opts));
        assert_eq!(cache.stats().expired, 1);
    }

    #[test]
    fn custom_ttl_wins() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_at(&clock, CacheConfig::default());
        let opts = CacheOptions::new(Scope::UserData).ttl(Duration::from_millis(10));
        cache.set("k", json!("v"), &opts);
        clock.advance(Duration::from_millis(11));
        assert_eq!(cache.get("k", &CacheOptions::new(Scope::UserData)), None);
    }

    #[test]
    fn large_values_are_compressed_transparently() {
        let clock = Arc::new(ManualClock::new(0));
        let config = CacheConfig {
            compression_threshold: 32,
            ..CacheConfig::default()
        };
        let cache = cache_at(&clock, config);
        let big = json!({"entries": (0..50).map(|i| json!({"id": i, "title": "ñ"})).collect::<Vec<_>>()});

        cache.set("list", big.clone(), &CacheOptions::new(Scope::UserData));
        cache.set("small", json!(1), &CacheOptions::new(Scope::UserData));
        assert_eq!(cache.get("list", &CacheOptions::new(Scope::UserData)), Some(big));
        assert_eq!(cache.stats().compressions, 1);
    }

    #[test]
    fn typed_helpers() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Stats {
            count: u32,
        }
        let cache = ScopedCache::new(CacheConfig::default());
        let opts = CacheOptions::new(Scope::UserData);
        assert!(cache.set_as("s", &Stats { count: 3 }, &opts));
        assert_eq!(cache.get_as::<Stats>("s", &opts), Some(Stats { count: 3 }));
        assert_eq!(cache.get_as::<Vec<u8>>("s", &opts), None);
    }

    #[test]
    fn eviction_drops_least_recently_used_batch() {
        let clock = Arc::new(ManualClock::new(0));
        let config = CacheConfig {
            max_size: 3,
            batch_size: 1,
            ..CacheConfig::default()
        };
        let cache = cache_at(&clock, config);
        let opts = media("anilist");

        for id in 1..=3 {
            clock.advance(Duration::from_millis(1));
            cache.set(&media_key("u", id), json!(id), &opts);
        }
        clock.advance(Duration::from_millis(1));
        assert!(cache.get(&media_key("u", 1), &opts).is_some());

        clock.advance(Duration::from_millis(1));
        cache.set(&media_key("u", 4), json!(4), &opts);

        let scope = opts.scope_id();
        assert_eq!(cache.scope_len(&scope), 2);
        assert!(cache.contains(&media_key("u", 1), &opts));
        assert!(cache.contains(&media_key("u", 4), &opts));
        for evicted in [2, 3] {
            let target = IndexRef(scope.clone(), media_key("u", evicted).canonical());
            assert!(!cache.contains(&media_key("u", evicted), &opts));
            assert!(!cache.is_indexed(&target));
        }
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn media_invalidation_is_idempotent() {
        let cache = ScopedCache::new(CacheConfig::default());
        cache.set(&media_key("u", 42), json!(42), &media("anilist"));
        cache.set(&media_key("u", 42), json!(42), &media("mal"));
        cache.set(&media_key("u", 43), json!(43), &media("anilist"));

        assert_eq!(cache.invalidate_by_media("42", Some("anilist")), 1);
        assert!(cache.contains(&media_key("u", 42), &media("mal")));
        assert_eq!(cache.invalidate_by_media("42", None), 1);
        assert_eq!(cache.invalidate_by_media("42", None), 0);
        assert!(cache.contains(&media_key("u", 43), &media("anilist")));
    }

    #[test]
    fn user_index_covers_user_owned_scopes_only() {
        let cache = ScopedCache::new(CacheConfig::default());
        let list = KeyDescriptor::new().field("type", "list").field("username", "u");
        let user_opts = CacheOptions::new(Scope::UserData).provider("anilist");
        cache.set(&list, json!([42, 43]), &user_opts);
        cache.set(&media_key("u", 43), json!(43), &media("anilist"));

        assert_eq!(cache.invalidate_by_user("u", None), 1);
        assert!(!cache.contains(&list, &user_opts));
        assert!(cache.contains(&media_key("u", 43), &media("anilist")));
    }

    #[test]
    fn tag_invalidation() {
        let cache = ScopedCache::new(CacheConfig::default());
        let opts = CacheOptions::new(Scope::SearchResults).tag("trending");
        cache.set("a", json!(1), &opts);
        cache.set("b", json!(2), &opts);
        cache.set("c", json!(3), &CacheOptions::new(Scope::SearchResults));
        assert_eq!(cache.invalidate_by_tag("trending", None), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn overwrite_moves_index_membership() {
        let cache = ScopedCache::new(CacheConfig::default());
        let opts = CacheOptions::new(Scope::SearchResults);
        cache.set("k", json!(1), &opts.clone().tag("old"));
        cache.set("k", json!(2), &opts.clone().tag("new"));
        assert_eq!(cache.invalidate_by_tag("old", None), 0);
        assert_eq!(cache.invalidate_by_tag("new", None), 1);
    }

    #[test]
    fn clear_scope_and_source() {
        let cache = ScopedCache::new(CacheConfig::default());
        cache.set("a", json!(1), &media("anilist"));
        cache.set("b", json!(1), &media("mal"));
        cache.set("c", json!(1), &CacheOptions::new(Scope::UserData).provider("mal"));

        assert_eq!(cache.clear_by_source("mal"), 2);
        assert_eq!(cache.len(), 1);
        cache.set("d", json!(1), &CacheOptions::new(Scope::UserData));
        assert_eq!(cache.clear(Some(Scope::MediaData)), 1);
        assert_eq!(cache.clear(None), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn clearing_everything_drops_indexes() {
        let cache = ScopedCache::new(CacheConfig::default());
        cache.set(&media_key("u", 7), json!(1), &media("anilist"));
        cache.set("list", json!([7]), &CacheOptions::new(Scope::UserData).tag("lists"));
        assert!(cache.stats().index_names > 0);

        assert_eq!(cache.clear(None), 2);
        assert_eq!(cache.stats().index_names, 0);
        assert_eq!(cache.invalidate_by_tag("lists", None), 0);
    }

    #[test]
    fn prune_expired_respects_filters() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_at(&clock, CacheConfig::default());
        cache.set("search", json!(1), &CacheOptions::new(Scope::SearchResults).tag("t"));
        cache.set("media", json!(1), &media("anilist"));
        cache.set("user", json!(1), &CacheOptions::new(Scope::UserData));

        clock.set(700_000);
        assert_eq!(cache.prune_expired(Some(Scope::SearchResults), None), 1);
        assert_eq!(cache.prune_expired(None, Some("mal")), 0);
        assert_eq!(cache.prune_expired(None, None), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().index_names, 0);
    }

    #[tokio::test]
    async fn snapshot_round_trip_skips_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let clock = Arc::new(ManualClock::new(1_000));
        let config = CacheConfig::default().with_snapshot(&path);

        let cache = cache_at(&clock, config.clone());
        cache.set(&media_key("u", 1), json!({"id": 1}), &media("anilist"));
        cache.set("q", json!(["hit"]), &CacheOptions::new(Scope::SearchResults));
        cache.set("list", json!([1]), &CacheOptions::new(Scope::UserData).tag("lists"));
        assert!(cache.save_to_disk().await);

        clock.advance(Duration::from_millis(300_000));
        let restored = cache_at(&clock, config);
        assert_eq!(restored.load_from_disk().await, 2);
        assert_eq!(restored.get(&media_key("u", 1), &media("anilist")), Some(json!({"id": 1})));
        assert_eq!(restored.get("q", &CacheOptions::new(Scope::SearchResults)), None);
        assert_eq!(restored.invalidate_by_tag("lists", None), 1);
        assert_eq!(restored.invalidate_by_media("1", None), 1);
    }

    #[tokio::test]
    async fn loading_over_a_live_entry_replaces_its_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::default().with_snapshot(dir.path().join("cache.json"));
        let opts = CacheOptions::new(Scope::UserData);

        let saved = ScopedCache::new(config.clone());
        saved.set("list", json!("saved"), &opts.clone().tag("saved"));
        assert!(saved.save_to_disk().await);

        let live = ScopedCache::new(config);
        live.set("list", json!("live"), &opts.clone().tag("live"));
        assert_eq!(live.load_from_disk().await, 1);

        assert_eq!(live.get("list", &opts), Some(json!("saved")));
        assert_eq!(live.invalidate_by_tag("live", None), 0);
        assert_eq!(live.invalidate_by_tag("saved", None), 1);
    }

    #[tokio::test]
    async fn snapshot_stats_report_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = ScopedCache::new(CacheConfig::default().with_snapshot(&path));
        assert_eq!(cache.snapshot_stats().await.unwrap().size_bytes, None);

        cache.set("k", json!(1), &CacheOptions::new(Scope::UserData));
        assert!(cache.save_to_disk().await);
        let stats = cache.snapshot_stats().await.unwrap();
        assert_eq!(stats.path, path);
        assert_eq!(stats.size_bytes, Some(std::fs::metadata(&path).unwrap().len()));

        assert!(ScopedCache::new(CacheConfig::default()).snapshot_stats().await.is_none());
    }

    #[tokio::test]
    async fn old_snapshot_versions_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(
            &path,
            r#"{"version":"1.4.0","timestamp":0,"data":{"userData":[["k",{"data":1,"compressed":false,"timestamp":0}]]}}"#,
        )
        .unwrap();
        let cache = cache_at(&Arc::new(ManualClock::new(0)), CacheConfig::default().with_snapshot(&path));
        assert_eq!(cache.load_from_disk().await, 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{not json").unwrap();
        let cache = ScopedCache::new(CacheConfig::default().with_snapshot(&path));
        assert_eq!(cache.load_from_disk().await, 0);
    }

    #[tokio::test]
    async fn set_schedules_a_debounced_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = ScopedCache::new(CacheConfig::default().with_snapshot(&path));
        cache.set("k", json!(1), &CacheOptions::new(Scope::UserData));
        assert!(!path.exists());

        for _ in 0..40 {
            if cache.stats().saves > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(cache.stats().saves, 1);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn steady_writes_still_persist_before_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = ScopedCache::new(CacheConfig::default().with_snapshot(&path));
        let opts = CacheOptions::new(Scope::UserData);

        // each set lands well inside the previous one's 100 ms window
        for i in 0..15 {
            cache.set("progress", json!(i), &opts);
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        assert!(cache.stats().saves >= 1);
        assert!(path.exists());
        cache.destroy().await;
    }

    #[tokio::test]
    async fn destroy_forces_final_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let config = CacheConfig::default().with_snapshot(&path);
        let cache = ScopedCache::new(config.clone());
        cache.set("k", json!("v"), &CacheOptions::new(Scope::UserData));
        cache.destroy().await;

        assert!(!cache.set("late", json!(1), &CacheOptions::new(Scope::UserData)));
        let fresh = ScopedCache::new(config);
        assert_eq!(fresh.load_from_disk().await, 1);
        assert_eq!(fresh.get("k", &CacheOptions::new(Scope::UserData)), Some(json!("v")));
    }

    #[tokio::test]
    async fn near_expiry_hit_refreshes_once_in_background() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_at(&clock, CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let opts = CacheOptions::new(Scope::SearchResults)
            .ttl(Duration::from_millis(1_000))
            .refresh(refresh_with(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ApiError>(json!("fresh")) }
            }));

        cache.set("q", json!("stale"), &opts);
        clock.set(500);
        assert_eq!(cache.get("q", &opts), Some(json!("stale")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        clock.set(900);
        assert_eq!(cache.get("q", &opts), Some(json!("stale")));
        assert_eq!(cache.get("q", &opts), Some(json!("stale")));

        for _ in 0..100 {
            if cache.stats().background_refreshes > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("q", &opts), Some(json!("fresh")));
    }

    #[test]
    fn refresh_is_skipped_without_runtime() {
        let cache = ScopedCache::new(CacheConfig::default());
        let opts = CacheOptions::new(Scope::SearchResults)
            .refresh(refresh_with(|| async { Ok::<_, ApiError>(json!(1)) }));
        assert_eq!(cache.get("missing", &opts), None);
    }
}
