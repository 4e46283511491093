use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::config::ProviderLimits;
use crate::resilience::CircuitState;

/// Dispatch bookkeeping for one provider.
#[derive(Debug)]
pub(crate) struct ProviderState {
    pub limits: ProviderLimits,
    /// Dispatch instants inside the current window, oldest first.
    window: VecDeque<Instant>,
    pub inflight: usize,
    current_delay: Duration,
    success_streak: u32,
    error_streak: u32,
    /// Set after a rate-limit stall or a failure; consecutive dispatches are
    /// then spaced by the current delay. Cleared when the queue drains.
    pub paced: bool,
    pub last_dispatch: Option<Instant>,
    pub auth_valid_until: Option<Instant>,
    pub auth_failures: u32,
    pub auth_blocked_until: Option<Instant>,
    pub dispatched: u64,
    pub rate_limit_hits: u64,
}

/// Per-provider view in [`super::SchedulerMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSnapshot {
    pub inflight: usize,
    pub window_used: usize,
    pub window_cap: usize,
    pub current_delay_ms: u64,
    pub paced: bool,
    pub dispatched: u64,
    pub rate_limit_hits: u64,
    pub breaker: CircuitState,
}

impl ProviderState {
    pub fn new(limits: ProviderLimits) -> Self {
        Self {
            current_delay: limits.base_delay(),
            limits,
            window: VecDeque::new(),
            inflight: 0,
            success_streak: 0,
            error_streak: 0,
            paced: false,
            last_dispatch: None,
            auth_valid_until: None,
            auth_failures: 0,
            auth_blocked_until: None,
            dispatched: 0,
            rate_limit_hits: 0,
        }
    }

    /// Drops dispatches older than the window.
    pub fn prune_window(&mut self, now: Instant) {
        let window = self.limits.window();
        while let Some(oldest) = self.window.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn is_saturated(&self) -> bool {
        self.window.len() >= self.limits.effective_cap()
    }

    /// When the oldest dispatch leaves the window.
    pub fn window_release(&self, now: Instant) -> Instant {
        self.window
            .front()
            .map(|oldest| *oldest + self.limits.window())
            .unwrap_or(now)
    }

    pub fn utilization(&self) -> f64 {
        self.window.len() as f64 / self.limits.effective_cap() as f64
    }

    /// Earliest instant the next paced dispatch may start.
    pub fn paced_until(&self) -> Option<Instant> {
        if !self.paced {
            return None;
        }
        self.last_dispatch.map(|last| last + self.calculate_delay())
    }

    pub fn record_dispatch(&mut self, now: Instant) {
        self.window.push_back(now);
        self.inflight += 1;
        self.dispatched += 1;
        self.last_dispatch = Some(now);

        let utilization = self.utilization();
        if utilization > 0.8 {
            self.scale_delay(1.2);
        } else if utilization < 0.3 && self.success_streak >= 3 {
            self.scale_delay(0.9);
        }
    }

    pub fn record_success(&mut self) {
        self.inflight = self.inflight.saturating_sub(1);
        self.error_streak = 0;
        self.success_streak += 1;
        if self.success_streak % 5 == 0 {
            self.scale_delay(0.9);
        }
    }

    pub fn record_failure(&mut self) {
        self.inflight = self.inflight.saturating_sub(1);
        self.success_streak = 0;
        self.error_streak += 1;
        self.paced = true;
        self.scale_delay(1.5);
    }

    /// Advisory spacing between consecutive dispatches.
    pub fn calculate_delay(&self) -> Duration {
        self.current_delay
    }

    fn scale_delay(&mut self, factor: f64) {
        let min = Duration::from_millis(self.limits.min_delay_ms);
        let max = Duration::from_millis(self.limits.max_delay_ms.max(self.limits.min_delay_ms));
        self.current_delay = self.current_delay.mul_f64(factor).clamp(min, max);
    }

    pub fn auth_is_fresh(&self, now: Instant) -> bool {
        self.auth_valid_until.is_some_and(|until| now < until)
    }

    pub fn snapshot(&self, breaker: CircuitState) -> ProviderSnapshot {
        ProviderSnapshot {
            inflight: self.inflight,
            window_used: self.window.len(),
            window_cap: self.limits.effective_cap(),
            current_delay_ms: self.current_delay.as_millis() as u64,
            paced: self.paced,
            dispatched: self.dispatched,
            rate_limit_hits: self.rate_limit_hits,
            breaker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_requests: u32) -> ProviderLimits {
        ProviderLimits {
            max_requests,
            window_ms: 1_000,
            buffer: 1.0,
            ..ProviderLimits::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_counts_only_recent_dispatches() {
        let mut state = ProviderState::new(limits(2));
        let start = Instant::now();
        state.record_dispatch(start);
        state.record_dispatch(start);
        assert!(state.is_saturated());
        assert_eq!(state.window_release(start), start + Duration::from_millis(1_000));

        state.prune_window(start + Duration::from_millis(999));
        assert!(state.is_saturated());
        state.prune_window(start + Duration::from_millis(1_000));
        assert!(!state.is_saturated());
    }

    #[tokio::test(start_paused = true)]
    async fn delay_adapts_within_bounds() {
        let mut state = ProviderState::new(limits(100));
        let base = state.calculate_delay();
        assert_eq!(base, Duration::from_millis(700));

        for _ in 0..20 {
            state.inflight += 1;
            state.record_failure();
        }
        assert_eq!(state.calculate_delay(), Duration::from_millis(5_000));
        assert!(state.paced);

        for _ in 0..200 {
            state.inflight += 1;
            state.record_success();
        }
        assert_eq!(state.calculate_delay(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn paced_dispatches_wait_for_the_current_delay() {
        let mut state = ProviderState::new(limits(100));
        let start = Instant::now();
        state.record_dispatch(start);
        assert_eq!(state.paced_until(), None);

        state.record_failure();
        assert_eq!(state.paced_until(), Some(start + state.calculate_delay()));
    }
}
