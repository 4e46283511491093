use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::Severity;

/// Rolling error counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub total: u64,
    pub by_type: HashMap<String, u64>,
    pub by_severity: HashMap<Severity, u64>,
    /// Keyed by `YYYY-MM-DDTHH` (UTC); only the most recent 24 buckets are kept.
    pub by_hour: BTreeMap<String, u64>,
    pub recovery_attempts: u64,
    pub recovery_successes: u64,
    /// Occurrences per fingerprint.
    pub patterns: HashMap<String, u64>,
}

const MAX_HOUR_BUCKETS: usize = 24;

impl ErrorMetrics {
    pub fn record(&mut self, error_type: &str, severity: Severity, fingerprint: &str, ts_ms: i64) {
        self.total += 1;
        *self.by_type.entry(error_type.to_string()).or_insert(0) += 1;
        *self.by_severity.entry(severity).or_insert(0) += 1;
        *self.patterns.entry(fingerprint.to_string()).or_insert(0) += 1;

        *self.by_hour.entry(hour_bucket(ts_ms)).or_insert(0) += 1;
        while self.by_hour.len() > MAX_HOUR_BUCKETS {
            let Some(oldest) = self.by_hour.keys().next().cloned() else {
                break;
            };
            self.by_hour.remove(&oldest);
        }
    }

    pub fn recovery_rate(&self) -> f64 {
        if self.recovery_attempts == 0 {
            0.0
        } else {
            self.recovery_successes as f64 / self.recovery_attempts as f64
        }
    }

    /// Fingerprints seen at least `min` times, most frequent first.
    pub fn frequent_patterns(&self, min: u64) -> Vec<(String, u64)> {
        let mut patterns: Vec<_> = self
            .patterns
            .iter()
            .filter(|(_, count)| **count >= min)
            .map(|(fp, count)| (fp.clone(), *count))
            .collect();
        patterns.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        patterns
    }
}

fn hour_bucket(ts_ms: i64) -> String {
    match Utc.timestamp_millis_opt(ts_ms).single() {
        Some(dt) => dt.format("%Y-%m-%dT%H").to_string(),
        None => "invalid".to_string(),
    }
}
