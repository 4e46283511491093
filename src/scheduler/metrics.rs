use num_format::{Locale, ToFormattedString};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::provider::ProviderSnapshot;
use crate::resilience::CircuitState;

#[derive(Debug, Default)]
pub(crate) struct SchedulerCounters {
    pub total: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub retries: AtomicU64,
    pub timeouts: AtomicU64,
    pub rate_limit_hits: AtomicU64,
    pub cancelled: AtomicU64,
    pub breaker_rejections: AtomicU64,
    pub auth_failures: AtomicU64,
    pub batches_flushed: AtomicU64,
}

impl SchedulerCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerMetrics {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub rate_limit_hits: u64,
    pub cancelled: u64,
    pub breaker_rejections: u64,
    pub auth_failures: u64,
    pub batches_flushed: u64,
    pub avg_latency_ms: f64,
    pub inflight: usize,
    pub queue_depth: BTreeMap<String, usize>,
    pub providers: BTreeMap<String, ProviderSnapshot>,
    pub paused: bool,
}

impl SchedulerMetrics {
    pub(crate) fn collect(
        counters: &SchedulerCounters,
        avg_latency_ms: f64,
        inflight: usize,
        queue_depth: BTreeMap<String, usize>,
        providers: BTreeMap<String, ProviderSnapshot>,
        paused: bool,
    ) -> Self {
        Self {
            total: SchedulerCounters::load(&counters.total),
            completed: SchedulerCounters::load(&counters.completed),
            failed: SchedulerCounters::load(&counters.failed),
            retries: SchedulerCounters::load(&counters.retries),
            timeouts: SchedulerCounters::load(&counters.timeouts),
            rate_limit_hits: SchedulerCounters::load(&counters.rate_limit_hits),
            cancelled: SchedulerCounters::load(&counters.cancelled),
            breaker_rejections: SchedulerCounters::load(&counters.breaker_rejections),
            auth_failures: SchedulerCounters::load(&counters.auth_failures),
            batches_flushed: SchedulerCounters::load(&counters.batches_flushed),
            avg_latency_ms,
            inflight,
            queue_depth,
            providers,
            paused,
        }
    }

    pub fn queued(&self) -> usize {
        self.queue_depth.values().sum()
    }

    pub fn failure_ratio(&self) -> f64 {
        let settled = self.completed + self.failed;
        if settled == 0 {
            0.0
        } else {
            self.failed as f64 / settled as f64
        }
    }
}

impl fmt::Display for SchedulerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "📡 Scheduler:")?;
        writeln!(
            f,
            "📥 Requests: {} total, {} completed, {} failed",
            self.total.to_formatted_string(&Locale::en),
            self.completed.to_formatted_string(&Locale::en),
            self.failed.to_formatted_string(&Locale::en)
        )?;
        writeln!(
            f,
            "🔁 Retries: {}, timeouts: {}, rate-limit hits: {}",
            self.retries, self.timeouts, self.rate_limit_hits
        )?;
        write!(
            f,
            "⏱️ Avg latency: {:.0} ms, queued: {}, in flight: {}",
            self.avg_latency_ms,
            self.queued(),
            self.inflight
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerHealth {
    pub status: SchedulerStatus,
    pub reasons: Vec<String>,
}

const MAX_HEALTHY_FAILURE_RATIO: f64 = 0.25;
const MAX_HEALTHY_QUEUE: usize = 100;

impl SchedulerHealth {
    pub(crate) fn assess(metrics: &SchedulerMetrics) -> Self {
        let mut reasons = Vec::new();
        let mut unhealthy = false;

        let open: Vec<&str> = metrics
            .providers
            .iter()
            .filter(|(_, p)| p.breaker == CircuitState::Open)
            .map(|(name, _)| name.as_str())
            .collect();
        if !open.is_empty() {
            reasons.push(format!("circuit open: {}", open.join(", ")));
            unhealthy = open.len() == metrics.providers.len();
        }
        if metrics.failure_ratio() > MAX_HEALTHY_FAILURE_RATIO {
            reasons.push(format!("failure ratio {:.0}%", metrics.failure_ratio() * 100.0));
        }
        if metrics.queued() > MAX_HEALTHY_QUEUE {
            reasons.push(format!("{} requests queued", metrics.queued()));
        }
        if metrics.paused {
            reasons.push("paused".to_string());
        }

        let status = match (unhealthy, reasons.is_empty()) {
            (true, _) => SchedulerStatus::Unhealthy,
            (false, true) => SchedulerStatus::Healthy,
            (false, false) => SchedulerStatus::Degraded,
        };
        Self { status, reasons }
    }
}
