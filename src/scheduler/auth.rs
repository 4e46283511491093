//! Provider pre-dispatch hook.
//!
//! Providers that need a valid token before any request register an
//! [`AuthGate`]. The scheduler caches a positive answer for
//! `auth_cache_ttl` and re-queues (or, after `max_auth_failures`, rejects)
//! requests on a negative one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCheck {
    pub valid: bool,
    pub error: Option<String>,
}

impl AuthCheck {
    pub fn valid() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(reason.into()),
        }
    }
}

/// Must be idempotent and cheap; it runs on the dispatch path.
#[async_trait]
pub trait AuthGate: Send + Sync + fmt::Debug {
    async fn ensure_valid(&self, provider: &str) -> AuthCheck;
}

#[derive(Clone)]
pub struct BearerToken {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Gate backed by a shared token slot the host keeps up to date.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthGate {
    slot: Arc<RwLock<Option<BearerToken>>>,
}

impl TokenAuthGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_token(&self, access_token: impl Into<String>, expires_at: Option<DateTime<Utc>>) {
        *self.slot.write() = Some(BearerToken {
            access_token: access_token.into(),
            expires_at,
        });
    }

    pub fn clear(&self) {
        *self.slot.write() = None;
    }

    pub fn token(&self) -> Option<BearerToken> {
        self.slot.read().clone()
    }
}

#[async_trait]
impl AuthGate for TokenAuthGate {
    async fn ensure_valid(&self, provider: &str) -> AuthCheck {
        match self.token() {
            None => AuthCheck::invalid(format!("no access token for {provider}")),
            Some(token) if token.access_token.is_empty() => {
                AuthCheck::invalid(format!("empty access token for {provider}"))
            }
            Some(BearerToken {
                expires_at: Some(expiry),
                ..
            }) if expiry <= Utc::now() => AuthCheck::invalid(format!("access token for {provider} expired")),
            Some(_) => AuthCheck::valid(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn token_gate_checks_presence_and_expiry() {
        let gate = TokenAuthGate::new();
        assert!(!gate.ensure_valid("mal").await.valid);

        gate.set_token("abc", Some(Utc::now() - Duration::minutes(1)));
        let expired = gate.ensure_valid("mal").await;
        assert!(!expired.valid);
        assert!(expired.error.unwrap().contains("expired"));

        gate.set_token("abc", Some(Utc::now() + Duration::hours(1)));
        assert_eq!(gate.ensure_valid("mal").await, AuthCheck::valid());

        gate.clear();
        assert!(gate.token().is_none());
    }

    #[test]
    fn token_is_redacted_in_debug() {
        let gate = TokenAuthGate::new();
        gate.set_token("secret", None);
        assert!(!format!("{:?}", gate.token()).contains("secret"));
    }
}
