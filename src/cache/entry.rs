use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

use super::compression::{self, Compressed};

/// One cached artifact. Exactly one of `data` / `compressed_blob` is set,
/// according to `compressed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_blob: Option<String>,
    pub compressed: bool,
    /// Creation time, epoch-ms.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_ttl: Option<u64>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_size: Option<usize>,
    /// `byUser` membership, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// `byMedia` membership, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
}

/// What a read hands back before decompression.
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Plain(Value),
    Blob(String),
}

impl Payload {
    /// Decodes a blob; on failure the raw blob is returned as a string.
    pub(crate) fn into_value(self) -> (Value, bool) {
        match self {
            Payload::Plain(value) => (value, true),
            Payload::Blob(blob) => match compression::decompress(&blob) {
                Some(value) => (value, true),
                None => (Value::String(blob), false),
            },
        }
    }
}

impl CacheEntry {
    pub fn plain(value: Value, timestamp: i64) -> Self {
        Self {
            data: Some(value),
            compressed_blob: None,
            compressed: false,
            timestamp,
            custom_ttl: None,
            tags: BTreeSet::new(),
            access_count: 0,
            provider: None,
            original_size: None,
            user: None,
            media_id: None,
        }
    }

    pub fn packed(compressed: Compressed, timestamp: i64) -> Self {
        Self {
            data: None,
            compressed_blob: Some(compressed.blob),
            compressed: true,
            original_size: Some(compressed.original_size),
            ..Self::plain(Value::Null, timestamp)
        }
    }

    pub fn with_custom_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.custom_ttl = ttl.map(|d| d.as_millis() as u64);
        self
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.timestamp)
    }

    /// Fresh while `age <= ttl`.
    pub fn is_fresh(&self, now_ms: i64, ttl_ms: u64) -> bool {
        self.age_ms(now_ms) <= ttl_ms as i64
    }

    pub(crate) fn payload(&self) -> Payload {
        match (&self.compressed_blob, &self.data) {
            (Some(blob), _) if self.compressed => Payload::Blob(blob.clone()),
            (_, Some(value)) => Payload::Plain(value.clone()),
            (Some(blob), None) => Payload::Blob(blob.clone()),
            (None, None) => Payload::Plain(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn freshness_is_inclusive() {
        let entry = CacheEntry::plain(json!(1), 1_000);
        assert!(entry.is_fresh(1_500, 500));
        assert!(!entry.is_fresh(1_501, 500));
    }

    #[test]
    fn packed_entry_decodes() {
        let value = json!({"id": 42});
        let entry = CacheEntry::packed(compression::compress(&value).unwrap(), 0);
        assert!(entry.compressed);
        assert!(entry.data.is_none());
        assert_eq!(entry.payload().into_value(), (value, true));
    }

    #[test]
    fn corrupt_blob_comes_back_raw() {
        let mut entry = CacheEntry::plain(Value::Null, 0);
        entry.data = None;
        entry.compressed = true;
        entry.compressed_blob = Some("%%%".into());
        assert_eq!(entry.payload().into_value(), (json!("%%%"), false));
    }

    #[test]
    fn snapshot_shape_is_camel_case() {
        let entry = CacheEntry::plain(json!([1]), 5).with_custom_ttl(Some(Duration::from_secs(1)));
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["customTtl"], 1000);
        assert_eq!(value["accessCount"], 0);
        assert!(value.get("compressedBlob").is_none());
    }
}
