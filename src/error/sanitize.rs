use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";

/// Terms that mark a meta key as carrying a credential.
const SENSITIVE_TERMS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "apikey",
    "api_key",
    "authorization",
    "credential",
    "cookie",
    "session",
    "private_key",
    "client_secret",
    "code_verifier",
];

pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase().replace('-', "_");
    SENSITIVE_TERMS.iter().any(|term| lower.contains(term))
}

/// Returns a copy of `meta` with every sensitive key's value replaced by
/// [`REDACTED`], recursing into nested objects and arrays.
pub fn sanitize(meta: &Value) -> Value {
    match meta {
        Value::Object(map) => {
            let mut clean = Map::with_capacity(map.len());
            for (key, value) in map {
                if is_sensitive_key(key) {
                    clean.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    clean.insert(key.clone(), sanitize(value));
                }
            }
            Value::Object(clean)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn redacts_nested_credentials() {
        let meta = json!({
            "provider": "anilist",
            "accessToken": "abc",
            "request": {
                "headers": { "Authorization": "Bearer xyz", "accept": "json" },
                "client_secret": "s3cr3t"
            },
            "attempts": [ { "api-key": "k" } ]
        });

        assert_eq!(
            sanitize(&meta),
            json!({
                "provider": "anilist",
                "accessToken": REDACTED,
                "request": {
                    "headers": { "Authorization": REDACTED, "accept": "json" },
                    "client_secret": REDACTED
                },
                "attempts": [ { "api-key": REDACTED } ]
            })
        );
    }

    #[test]
    fn plain_values_pass_through() {
        assert_eq!(sanitize(&json!(42)), json!(42));
        assert!(!is_sensitive_key("mediaId"));
    }
}
