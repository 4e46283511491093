use std::collections::BTreeMap;

use super::key::ScopeId;

/// TTL for scopes missing from the map.
pub const FALLBACK_TTL_MS: u64 = 300_000;

/// Default TTLs per scope and per `provider:scope`, in milliseconds.
pub fn default_ttl_map() -> BTreeMap<String, u64> {
    [
        ("userData", 1_800_000),
        ("mediaData", 600_000),
        ("searchResults", 120_000),
        ("mediaDetails", 3_600_000),
        ("malData", 3_600_000),
        ("anilist:userData", 1_800_000),
        ("mal:userData", 3_600_000),
    ]
    .into_iter()
    .map(|(scope, ttl)| (scope.to_string(), ttl))
    .collect()
}

/// `custom ?? map[provider:scope] ?? map[scope] ?? fallback`
pub fn resolve_ttl(
    map: &BTreeMap<String, u64>,
    fallback_ms: u64,
    scope: &ScopeId,
    custom_ms: Option<u64>,
) -> u64 {
    if let Some(custom) = custom_ms {
        return custom;
    }
    if scope.provider.is_some() {
        if let Some(ttl) = map.get(&scope.to_string()) {
            return *ttl;
        }
    }
    map.get(scope.scope.as_str()).copied().unwrap_or(fallback_ms)
}
