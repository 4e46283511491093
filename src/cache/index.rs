use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use super::key::{CacheKey, ScopeId};

/// Location of an entry: which store, which key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexRef(pub ScopeId, pub CacheKey);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    ByUser,
    ByMedia,
    ByTag,
}

/// Secondary name -> entries maps, used only for targeted invalidation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Indexes {
    by_user: HashMap<String, BTreeSet<IndexRef>>,
    by_media: HashMap<String, BTreeSet<IndexRef>>,
    by_tag: HashMap<String, BTreeSet<IndexRef>>,
}

/// Snapshot form: `[[name, [refs]]]` per index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSnapshot {
    #[serde(default)]
    pub by_user: Vec<(String, Vec<IndexRef>)>,
    #[serde(default)]
    pub by_media: Vec<(String, Vec<IndexRef>)>,
    #[serde(default)]
    pub by_tag: Vec<(String, Vec<IndexRef>)>,
}

impl Indexes {
    fn map(&self, kind: IndexKind) -> &HashMap<String, BTreeSet<IndexRef>> {
        match kind {
            IndexKind::ByUser => &self.by_user,
            IndexKind::ByMedia => &self.by_media,
            IndexKind::ByTag => &self.by_tag,
        }
    }

    fn map_mut(&mut self, kind: IndexKind) -> &mut HashMap<String, BTreeSet<IndexRef>> {
        match kind {
            IndexKind::ByUser => &mut self.by_user,
            IndexKind::ByMedia => &mut self.by_media,
            IndexKind::ByTag => &mut self.by_tag,
        }
    }

    pub fn add(&mut self, kind: IndexKind, name: &str, entry: IndexRef) {
        self.map_mut(kind).entry(name.to_string()).or_default().insert(entry);
    }

    pub fn remove(&mut self, kind: IndexKind, name: &str, entry: &IndexRef) {
        let map = self.map_mut(kind);
        if let Some(set) = map.get_mut(name) {
            set.remove(entry);
            if set.is_empty() {
                map.remove(name);
            }
        }
    }

    /// References under `name`, restricted to `provider` when given.
    pub fn refs(&self, kind: IndexKind, name: &str, provider: Option<&str>) -> Vec<IndexRef> {
        self.map(kind)
            .get(name)
            .map(|set| {
                set.iter()
                    .filter(|r| r.0.matches_provider(provider))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Keeps only references accepted by `keep`; drops empty names.
    pub fn retain(&mut self, mut keep: impl FnMut(&IndexRef) -> bool) -> usize {
        let mut dropped = 0;
        for map in [&mut self.by_user, &mut self.by_media, &mut self.by_tag] {
            map.retain(|_, set| {
                let before = set.len();
                set.retain(|r| keep(r));
                dropped += before - set.len();
                !set.is_empty()
            });
        }
        dropped
    }

    pub fn extend(&mut self, other: Indexes) {
        for (mine, theirs) in [
            (&mut self.by_user, other.by_user),
            (&mut self.by_media, other.by_media),
            (&mut self.by_tag, other.by_tag),
        ] {
            for (name, refs) in theirs {
                mine.entry(name).or_default().extend(refs);
            }
        }
    }

    pub fn clear(&mut self) {
        self.by_user.clear();
        self.by_media.clear();
        self.by_tag.clear();
    }

    pub fn len(&self, kind: IndexKind) -> usize {
        self.map(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty() && self.by_media.is_empty() && self.by_tag.is_empty()
    }

    pub fn contains(&self, entry: &IndexRef) -> bool {
        [&self.by_user, &self.by_media, &self.by_tag]
            .iter()
            .any(|map| map.values().any(|set| set.contains(entry)))
    }

    pub fn to_snapshot(&self) -> IndexSnapshot {
        fn pairs(map: &HashMap<String, BTreeSet<IndexRef>>) -> Vec<(String, Vec<IndexRef>)> {
            let mut pairs: Vec<_> = map
                .iter()
                .map(|(name, set)| (name.clone(), set.iter().cloned().collect()))
                .collect();
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            pairs
        }
        IndexSnapshot {
            by_user: pairs(&self.by_user),
            by_media: pairs(&self.by_media),
            by_tag: pairs(&self.by_tag),
        }
    }

    pub fn from_snapshot(snapshot: IndexSnapshot) -> Self {
        fn collect(pairs: Vec<(String, Vec<IndexRef>)>) -> HashMap<String, BTreeSet<IndexRef>> {
            pairs
                .into_iter()
                .filter(|(_, refs)| !refs.is_empty())
                .map(|(name, refs)| (name, refs.into_iter().collect()))
                .collect()
        }
        Self {
            by_user: collect(snapshot.by_user),
            by_media: collect(snapshot.by_media),
            by_tag: collect(snapshot.by_tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::Scope;

    fn r(provider: &str, key: &str) -> IndexRef {
        IndexRef(ScopeId::for_provider(provider, Scope::MediaData), CacheKey::from(key))
    }

    #[test]
    fn provider_filter() {
        let mut idx = Indexes::default();
        idx.add(IndexKind::ByMedia, "42", r("anilist", "a"));
        idx.add(IndexKind::ByMedia, "42", r("mal", "b"));

        assert_eq!(idx.refs(IndexKind::ByMedia, "42", None).len(), 2);
        assert_eq!(idx.refs(IndexKind::ByMedia, "42", Some("mal")), vec![r("mal", "b")]);
        assert!(idx.refs(IndexKind::ByUser, "42", None).is_empty());
    }

    #[test]
    fn removing_last_ref_drops_name() {
        let mut idx = Indexes::default();
        idx.add(IndexKind::ByTag, "list", r("anilist", "a"));
        idx.remove(IndexKind::ByTag, "list", &r("anilist", "a"));
        assert_eq!(idx.len(IndexKind::ByTag), 0);
        assert!(idx.is_empty());
    }

    #[test]
    fn retain_prunes_dangling() {
        let mut idx = Indexes::default();
        idx.add(IndexKind::ByUser, "u", r("anilist", "live"));
        idx.add(IndexKind::ByUser, "u", r("anilist", "gone"));
        let dropped = idx.retain(|e| e.1.as_str() == "live");
        assert_eq!(dropped, 1);
        assert!(idx.contains(&r("anilist", "live")));
        assert!(!idx.contains(&r("anilist", "gone")));
    }

    #[test]
    fn snapshot_round_trip() {
        let mut idx = Indexes::default();
        idx.add(IndexKind::ByUser, "u", r("anilist", "a"));
        idx.add(IndexKind::ByTag, "t", r("mal", "b"));
        let json = serde_json::to_string(&idx.to_snapshot()).unwrap();
        let back: IndexSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(Indexes::from_snapshot(back), idx);
    }
}
