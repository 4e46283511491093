//! Snapshot document written by [`super::ScopedCache::save_to_disk`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::entry::CacheEntry;
use super::index::{IndexRef, IndexSnapshot};
use super::key::CacheKey;
use super::stats::PersistedStats;

pub const SNAPSHOT_VERSION: &str = "2.1.0";
pub const MIN_SNAPSHOT_VERSION: &str = "2.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: String,
    pub timestamp: i64,
    #[serde(default)]
    pub stats: PersistedStats,
    /// `scopeId -> [[key, entry]]`
    #[serde(default)]
    pub data: BTreeMap<String, Vec<(CacheKey, CacheEntry)>>,
    #[serde(default)]
    pub indexes: IndexSnapshot,
    #[serde(default)]
    pub access_log: Vec<(IndexRef, i64)>,
}

/// Parses `major.minor.patch`; missing parts count as 0.
pub fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0,
    };
    let patch = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

/// True when `version` parses and is at least [`MIN_SNAPSHOT_VERSION`].
pub fn is_supported(version: &str) -> bool {
    match (parse_version(version), parse_version(MIN_SNAPSHOT_VERSION)) {
        (Some(v), Some(min)) => v >= min,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_gate() {
        assert!(is_supported("2.0.0"));
        assert!(is_supported("2.1.0"));
        assert!(is_supported("10.0"));
        assert!(!is_supported("1.9.9"));
        assert!(!is_supported("garbage"));
        assert!(!is_supported("2.0.0.1"));
    }

    #[test]
    fn minimal_document_parses() {
        let snapshot: Snapshot = serde_json::from_str(r#"{"version":"2.1.0","timestamp":0}"#).unwrap();
        assert!(snapshot.data.is_empty());
        assert!(snapshot.access_log.is_empty());
    }
}
