use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{ApiError, ErrorContext, ErrorKind};

/// Named recovery strategies understood by [`super::ErrorCore::guard`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recovery {
    /// Serve the last value remembered for the same operation and fallback key.
    CacheFallback,
    /// Wait briefly and run the operation one more time.
    RetryOnce,
    /// Hand back a [`DegradedResponse`] the caller can render.
    DegradeGracefully,
    /// A strategy registered with [`super::ErrorCore::register_strategy`].
    Custom(String),
}

impl Recovery {
    pub fn name(&self) -> &str {
        match self {
            Recovery::CacheFallback => "cache_fallback",
            Recovery::RetryOnce => "retry_once",
            Recovery::DegradeGracefully => "degrade_gracefully",
            Recovery::Custom(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "cache_fallback" => Recovery::CacheFallback,
            "retry_once" => Recovery::RetryOnce,
            "degrade_gracefully" => Recovery::DegradeGracefully,
            other => Recovery::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pluggable recovery. Returning `None` means "could not recover" and the
/// original error is propagated.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    async fn recover(&self, error: &ApiError, context: &ErrorContext) -> Option<Value>;
}

/// Sentinel returned by `degrade_gracefully`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradedResponse {
    pub error: bool,
    pub degraded: bool,
    pub message: String,
    pub error_type: ErrorKind,
}

impl DegradedResponse {
    pub fn from_error(error: &ApiError) -> Self {
        Self {
            error: true,
            degraded: true,
            message: error.user_message().to_string(),
            error_type: error.kind,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Result of a guarded call.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardOutcome<T> {
    /// The operation itself (or its single retry) produced the value.
    Fresh(T),
    /// A recovery strategy supplied a previously known value.
    Fallback(T),
    Degraded(DegradedResponse),
}

impl<T> GuardOutcome<T> {
    pub fn is_recovered(&self) -> bool {
        !matches!(self, GuardOutcome::Fresh(_))
    }

    pub fn value(self) -> Option<T> {
        match self {
            GuardOutcome::Fresh(v) | GuardOutcome::Fallback(v) => Some(v),
            GuardOutcome::Degraded(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> GuardOutcome<U> {
        match self {
            GuardOutcome::Fresh(v) => GuardOutcome::Fresh(f(v)),
            GuardOutcome::Fallback(v) => GuardOutcome::Fallback(f(v)),
            GuardOutcome::Degraded(d) => GuardOutcome::Degraded(d),
        }
    }
}

type RetryCondition = Arc<dyn Fn(&ApiError) -> bool + Send + Sync>;

/// Options for [`super::ErrorCore::with_retry`].
#[derive(Clone)]
pub struct RetryOptions {
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    pub backoff: Duration,
    condition: Option<RetryCondition>,
}

impl RetryOptions {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            condition: None,
        }
    }

    /// Overrides the default "retryable kinds only" condition.
    pub fn with_condition(mut self, condition: impl Fn(&ApiError) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn should_retry(&self, error: &ApiError) -> bool {
        match &self.condition {
            Some(condition) => condition(error),
            None => error.is_retryable(),
        }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(retry))
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("custom_condition", &self.condition.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for recovery in [Recovery::CacheFallback, Recovery::RetryOnce, Recovery::DegradeGracefully] {
            assert_eq!(Recovery::from_name(recovery.name()), recovery);
        }
        assert_eq!(Recovery::from_name("mine"), Recovery::Custom("mine".into()));
    }

    #[test]
    fn degraded_sentinel_shape() {
        let sentinel = DegradedResponse::from_error(&ApiError::network("down")).to_value();
        assert_eq!(sentinel["error"], true);
        assert_eq!(sentinel["degraded"], true);
        assert_eq!(sentinel["errorType"], "NETWORK_ERROR");
    }

    #[test]
    fn retry_backoff_doubles() {
        let options = RetryOptions::new(3, Duration::from_millis(100));
        assert_eq!(options.delay_for(0), Duration::from_millis(100));
        assert_eq!(options.delay_for(2), Duration::from_millis(400));
        assert!(options.should_retry(&ApiError::network("x")));
        assert!(!options.should_retry(&ApiError::auth("x")));
        let always = options.with_condition(|_| true);
        assert!(always.should_retry(&ApiError::auth("x")));
    }
}
