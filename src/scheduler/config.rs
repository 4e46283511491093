use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::resilience::BreakerConfig;

/// Limits and pacing for one provider. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderLimits {
    /// Published cap per `window_ms`.
    pub max_requests: u32,
    pub window_ms: u64,
    /// Safety factor in (0, 1] applied to `max_requests`.
    pub buffer: f64,
    pub max_concurrent: usize,
    pub base_delay_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub auth_retry_delay_ms: u64,
    pub auth_cache_ttl_ms: u64,
    pub max_auth_failures: u32,
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_ms: 60_000,
            buffer: 0.8,
            max_concurrent: 3,
            base_delay_ms: 700,
            min_delay_ms: 100,
            max_delay_ms: 5_000,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 10_000,
            auth_retry_delay_ms: 2_000,
            auth_cache_ttl_ms: 300_000,
            max_auth_failures: 3,
            breaker_threshold: 5,
            breaker_cooldown_ms: 60_000,
        }
    }
}

impl ProviderLimits {
    /// AniList: 90 requests/minute.
    pub fn anilist() -> Self {
        Self {
            max_requests: 90,
            ..Self::default()
        }
    }

    /// MyAnimeList is the conservative one.
    pub fn myanimelist() -> Self {
        Self {
            max_requests: 60,
            buffer: 0.7,
            max_concurrent: 2,
            base_delay_ms: 1_000,
            auth_retry_delay_ms: 1_500,
            ..Self::default()
        }
    }

    pub fn simkl() -> Self {
        Self {
            max_requests: 30,
            max_concurrent: 2,
            base_delay_ms: 1_000,
            ..Self::default()
        }
    }

    /// `⌊max_requests · buffer⌋`; zero means the provider can never dispatch.
    pub fn rate_floor(&self) -> usize {
        (self.max_requests as f64 * self.buffer + 1e-9).floor() as usize
    }

    /// Dispatches allowed per window. Equal to [`rate_floor`](Self::rate_floor)
    /// for any config that passes `validate`; the lower bound of one only keeps
    /// an unvalidated config from stalling its queue forever.
    pub fn effective_cap(&self) -> usize {
        self.rate_floor().max(1)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms.clamp(self.min_delay_ms, self.max_delay_ms.max(self.min_delay_ms)))
    }

    pub fn auth_retry_delay(&self) -> Duration {
        Duration::from_millis(self.auth_retry_delay_ms)
    }

    pub fn auth_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.auth_cache_ttl_ms)
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig::new(self.breaker_threshold, Duration::from_millis(self.breaker_cooldown_ms))
    }

    /// `min(base · 2^(attempt-1) + jitter, max)` with jitter in `[0, base)`.
    /// A server-provided `Retry-After` lower-bounds the result.
    pub fn retry_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base = self.base_retry_delay_ms;
        let exponential = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
        let jitter = if base > 0 { fastrand::u64(0..base) } else { 0 };
        let delay = Duration::from_millis(exponential.saturating_add(jitter).min(self.max_retry_delay_ms));
        match retry_after {
            Some(floor) => delay.max(floor),
            None => delay,
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), String> {
        if self.max_requests == 0 || self.window_ms == 0 {
            return Err(format!("scheduler.providers.{name}: max_requests and window_ms must be > 0"));
        }
        if !(self.buffer > 0.0 && self.buffer <= 1.0) {
            return Err(format!("scheduler.providers.{name}.buffer must be in (0, 1]"));
        }
        if self.rate_floor() == 0 {
            return Err(format!(
                "scheduler.providers.{name}: max_requests · buffer rounds down to 0 requests per window"
            ));
        }
        if self.max_concurrent == 0 {
            return Err(format!("scheduler.providers.{name}.max_concurrent must be > 0"));
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(format!("scheduler.providers.{name}: min_delay_ms > max_delay_ms"));
        }
        if self.base_retry_delay_ms > self.max_retry_delay_ms {
            return Err(format!(
                "scheduler.providers.{name}: base_retry_delay_ms > max_retry_delay_ms"
            ));
        }
        Ok(())
    }
}

/// Configuración del scheduler de peticiones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Global in-flight cap across providers.
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub request_timeout_ms: u64,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    /// Limits for providers without an explicit entry.
    pub defaults: ProviderLimits,
    pub providers: BTreeMap<String, ProviderLimits>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let providers = [
            ("anilist", ProviderLimits::anilist()),
            ("mal", ProviderLimits::myanimelist()),
            ("simkl", ProviderLimits::simkl()),
        ]
        .into_iter()
        .map(|(name, limits)| (name.to_string(), limits))
        .collect();

        Self {
            max_concurrent: 3,
            max_retries: 3,
            request_timeout_ms: 30_000,
            batch_size: 5,
            batch_delay_ms: 100,
            defaults: ProviderLimits::default(),
            providers,
        }
    }
}

impl SchedulerConfig {
    pub fn limits_for(&self, provider: &str) -> ProviderLimits {
        self.providers.get(provider).cloned().unwrap_or_else(|| self.defaults.clone())
    }

    pub fn with_provider(mut self, name: impl Into<String>, limits: ProviderLimits) -> Self {
        self.providers.insert(name.into(), limits);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("scheduler.max_concurrent must be greater than 0".into());
        }
        if self.max_retries == 0 {
            return Err("scheduler.max_retries must be at least 1".into());
        }
        if self.request_timeout_ms == 0 {
            return Err("scheduler.request_timeout_ms must be greater than 0".into());
        }
        self.defaults.validate("defaults")?;
        for (name, limits) in &self.providers {
            limits.validate(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_and_caps() {
        assert_eq!(ProviderLimits::anilist().effective_cap(), 72);
        assert_eq!(ProviderLimits::myanimelist().effective_cap(), 42);
        let strict = ProviderLimits {
            max_requests: 3,
            buffer: 1.0,
            ..ProviderLimits::default()
        };
        assert_eq!(strict.effective_cap(), 3);
    }

    #[test]
    fn retry_delays_stay_in_band() {
        let limits = ProviderLimits::default();
        for _ in 0..50 {
            let first = limits.retry_delay(1, None).as_millis();
            let second = limits.retry_delay(2, None).as_millis();
            assert!((1_000..2_000).contains(&first));
            assert!((2_000..3_000).contains(&second));
        }
        assert_eq!(limits.retry_delay(10, None), Duration::from_millis(10_000));
        assert_eq!(
            limits.retry_delay(1, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn validation() {
        assert!(SchedulerConfig::default().validate().is_ok());
        let bad = SchedulerConfig::default().with_provider(
            "x",
            ProviderLimits {
                buffer: 1.5,
                ..ProviderLimits::default()
            },
        );
        assert!(bad.validate().is_err());
    }

    #[test]
    fn rejects_limits_that_round_to_zero() {
        let starved = ProviderLimits {
            max_requests: 1,
            buffer: 0.5,
            ..ProviderLimits::default()
        };
        assert_eq!(starved.rate_floor(), 0);
        assert!(starved.validate("starved").is_err());
        assert!(SchedulerConfig::default()
            .with_provider("starved", starved)
            .validate()
            .is_err());

        let single = ProviderLimits {
            max_requests: 2,
            buffer: 0.5,
            ..ProviderLimits::default()
        };
        assert!(single.validate("single").is_ok());
        assert_eq!(single.effective_cap(), single.rate_floor());
    }
}
