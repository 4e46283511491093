//! # Circuit Breaker
//!
//! Classic three-state breaker: Closed (normal), Open (failing fast) and
//! Half-Open (one trial request). State lives behind a short-lived
//! `parking_lot` lock so the scheduler can consult it from its synchronous
//! dispatch step.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// All calls are allowed through
    Closed,
    /// All calls fail fast without executing
    Open,
    /// A single trial call is allowed through
    HalfOpen,
}

/// Point-in-time view of a breaker, for metrics and health reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected: u64,
    pub times_opened: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    rejected: u64,
    times_opened: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let name = name.into();
        debug!(
            provider = %name,
            failure_threshold = config.failure_threshold,
            cooldown_secs = config.cooldown.as_secs(),
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
                total_successes: 0,
                total_failures: 0,
                rejected: 0,
                times_opened: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Current state, promoting Open to Half-Open once the cooldown elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// True while calls must fail fast: open and still cooling down, or
    /// half-open with the trial already taken.
    pub fn is_rejecting(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => true,
            CircuitState::HalfOpen => inner.trial_in_flight,
        }
    }

    /// Admits a call. In half-open only the first caller gets through; the
    /// caller must later report the outcome or [`release`](Self::release).
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen if inner.trial_in_flight => false,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                debug!(provider = %self.name, "🟡 Admitting half-open trial");
                true
            }
        };
        if !admitted {
            inner.rejected += 1;
        }
        admitted
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                info!(provider = %self.name, "🟢 Circuit breaker closed (recovered)");
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::Open => {
                warn!(provider = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    /// Records a failed call. Only tripping failures count toward the
    /// threshold; other failures leave the streak untouched and hand the
    /// half-open trial back.
    pub fn record_failure(&self, trips: bool) {
        let mut inner = self.inner.lock();
        if !trips {
            inner.trial_in_flight = false;
            return;
        }

        inner.total_failures += 1;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold.max(1) {
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                self.open(&mut inner);
            }
            CircuitState::Open => inner.consecutive_failures += 1,
        }
    }

    /// Returns an acquired half-open trial without an outcome (cancelled or
    /// never executed).
    pub fn release(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    pub fn force_open(&self) {
        warn!(provider = %self.name, "🚨 Circuit breaker forced open");
        let mut inner = self.inner.lock();
        self.open(&mut inner);
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected: inner.rejected,
            times_opened: inner.times_opened,
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
        inner.times_opened += 1;
        error!(
            provider = %self.name,
            consecutive_failures = inner.consecutive_failures,
            failure_threshold = self.config.failure_threshold,
            cooldown_secs = self.config.cooldown.as_secs(),
            "🔴 Circuit breaker opened (failing fast)"
        );
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let cooled = inner
            .opened_at
            .is_none_or(|opened| opened.elapsed() >= self.config.cooldown);
        if cooled {
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
            info!(provider = %self.name, "🟡 Circuit breaker half-open (testing recovery)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new("test", BreakerConfig::new(threshold, Duration::from_secs(60)))
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_consecutive_failures() {
        let cb = breaker(3);
        for _ in 0..2 {
            assert!(cb.try_acquire());
            cb.record_failure(true);
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        assert!(cb.try_acquire());
        cb.record_failure(true);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_rejecting());
        assert!(!cb.try_acquire());
        assert_eq!(cb.snapshot().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_streak() {
        let cb = breaker(3);
        cb.record_failure(true);
        cb.record_failure(true);
        cb.record_success();
        cb.record_failure(true);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_tripping_failures_are_ignored() {
        let cb = breaker(2);
        for _ in 0..10 {
            cb.record_failure(false);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_trial_and_closes_on_success() {
        let cb = breaker(1);
        cb.record_failure(true);
        assert!(!cb.try_acquire());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire());
        assert!(!cb.try_acquire());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
        assert!(cb.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let cb = breaker(1);
        cb.record_failure(true);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cb.try_acquire());
        cb.record_failure(true);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().times_opened, 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.is_rejecting());
    }

    #[tokio::test(start_paused = true)]
    async fn released_trial_can_be_retaken() {
        let cb = breaker(1);
        cb.record_failure(true);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.try_acquire());
        cb.release();
        assert!(cb.try_acquire());
    }
}
