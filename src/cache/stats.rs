use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated without taking the store lock.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) sets: AtomicU64,
    pub(crate) deletes: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) expired: AtomicU64,
    pub(crate) compressions: AtomicU64,
    pub(crate) decompression_failures: AtomicU64,
    pub(crate) background_refreshes: AtomicU64,
    pub(crate) saves: AtomicU64,
    pub(crate) save_failures: AtomicU64,
    pub(crate) loads: AtomicU64,
}

/// Counters carried across restarts in the snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub compressions: u64,
}

impl CacheStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub(crate) fn persisted(&self) -> PersistedStats {
        PersistedStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            compressions: self.compressions.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn restore(&self, persisted: PersistedStats) {
        Self::add(&self.hits, persisted.hits);
        Self::add(&self.misses, persisted.misses);
        Self::add(&self.sets, persisted.sets);
        Self::add(&self.evictions, persisted.evictions);
        Self::add(&self.compressions, persisted.compressions);
    }

    pub(crate) fn snapshot(&self, entries_by_scope: BTreeMap<String, usize>, index_names: usize) -> CacheStatistics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStatistics {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            compressions: self.compressions.load(Ordering::Relaxed),
            decompression_failures: self.decompression_failures.load(Ordering::Relaxed),
            background_refreshes: self.background_refreshes.load(Ordering::Relaxed),
            saves: self.saves.load(Ordering::Relaxed),
            save_failures: self.save_failures.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            total_entries: entries_by_scope.values().sum(),
            entries_by_scope,
            index_names,
            hit_ratio: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
        }
    }
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expired: u64,
    pub compressions: u64,
    pub decompression_failures: u64,
    pub background_refreshes: u64,
    pub saves: u64,
    pub save_failures: u64,
    pub loads: u64,
    pub total_entries: usize,
    pub entries_by_scope: BTreeMap<String, usize>,
    pub index_names: usize,
    pub hit_ratio: f64,
}

impl fmt::Display for CacheStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "📊 Cache Stats:")?;
        writeln!(
            f,
            "📦 Entries: {} across {} scopes",
            self.total_entries.to_formatted_string(&Locale::en),
            self.entries_by_scope.len()
        )?;
        writeln!(
            f,
            "🎯 Hits/Misses: {}/{} ({:.1}%)",
            self.hits.to_formatted_string(&Locale::en),
            self.misses.to_formatted_string(&Locale::en),
            self.hit_ratio * 100.0
        )?;
        writeln!(
            f,
            "🗑️ Evictions: {}, expired: {}",
            self.evictions.to_formatted_string(&Locale::en),
            self.expired.to_formatted_string(&Locale::en)
        )?;
        write!(
            f,
            "💾 Saves: {} ({} failed), loads: {}",
            self.saves.to_formatted_string(&Locale::en),
            self.save_failures,
            self.loads
        )
    }
}
