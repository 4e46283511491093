//! Text-safe value encoding: JSON text, percent-escaped, then base64url.
//! Reversible and opaque to callers.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;

/// Encoded blob plus the length of the JSON text it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    pub blob: String,
    pub original_size: usize,
}

pub fn serialized_size(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

pub fn compress(value: &Value) -> Result<Compressed, serde_json::Error> {
    let json = serde_json::to_string(value)?;
    let escaped = urlencoding::encode(&json);
    Ok(Compressed {
        blob: URL_SAFE_NO_PAD.encode(escaped.as_bytes()),
        original_size: json.len(),
    })
}

/// Returns `None` when the blob is not something [`compress`] produced.
pub fn decompress(blob: &str) -> Option<Value> {
    let bytes = URL_SAFE_NO_PAD.decode(blob).ok()?;
    let escaped = String::from_utf8(bytes).ok()?;
    let json = urlencoding::decode(&escaped).ok()?;
    serde_json::from_str(&json).ok()
}
