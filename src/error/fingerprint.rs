use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

fn digits() -> Option<&'static Regex> {
    static DIGITS: OnceLock<Option<Regex>> = OnceLock::new();
    DIGITS.get_or_init(|| Regex::new(r"\d+").ok()).as_ref()
}

/// Replaces every run of decimal digits with `N` so that messages differing
/// only in ids, counts or timestamps collapse together.
pub fn normalize_message(message: &str) -> String {
    match digits() {
        Some(re) => re.replace_all(message.trim(), "N").into_owned(),
        None => message.trim().to_string(),
    }
}

/// Stable 16-hex-char digest of `{type, normalized message}`.
pub fn fingerprint(error_type: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(error_type.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(normalize_message(message).as_bytes());
    let hash = hasher.finalize();
    hex::encode(&hash[..8])
}
