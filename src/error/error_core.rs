use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::fingerprint::fingerprint;
use super::journal::ErrorJournal;
use super::metrics::ErrorMetrics;
use super::notify::{Notifier, TracingNotifier, UserNotice};
use super::recovery::{DegradedResponse, GuardOutcome, Recovery, RecoveryStrategy, RetryOptions};
use super::sanitize::sanitize;
use super::{ApiError, Severity};
use crate::clock::{self, SharedClock};

pub const ERROR_PATTERN: &str = "ERROR_PATTERN";
pub const ALERT_THRESHOLD: &str = "ALERT_THRESHOLD";

const MAX_CORRELATION_IDS: usize = 5;

static GLOBAL: OnceLock<Arc<ErrorCore>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub error: usize,
    pub warn: usize,
    pub fatal: usize,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error: 10,
            warn: 25,
            fatal: 1,
        }
    }
}

impl AlertThresholds {
    fn for_severity(&self, severity: Severity) -> Option<usize> {
        match severity {
            Severity::Fatal => Some(self.fatal),
            Severity::Error => Some(self.error),
            Severity::Warn => Some(self.warn),
            Severity::Info | Severity::Debug => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorCoreConfig {
    /// Size of the rolling entry buffer.
    pub max_buffer: usize,
    /// Minimum gap between two user notices of the same type.
    pub notification_interval_ms: u64,
    /// Window over which same-fingerprint entries are correlated.
    pub correlation_window_ms: u64,
    /// Occurrences inside the correlation window that emit `ERROR_PATTERN`.
    pub pattern_threshold: usize,
    pub alert_window_ms: u64,
    pub alert_thresholds: AlertThresholds,
    pub retry_once_delay_ms: u64,
    pub fallback_capacity: usize,
    /// Entries at this severity or above are surfaced to the user.
    pub notify_min_severity: Severity,
    /// When set, `error`/`fatal` entries are appended here as JSON lines.
    pub error_log_path: Option<PathBuf>,
}

impl Default for ErrorCoreConfig {
    fn default() -> Self {
        Self {
            max_buffer: 100,
            notification_interval_ms: 5_000,
            correlation_window_ms: 300_000,
            pattern_threshold: 3,
            alert_window_ms: 300_000,
            alert_thresholds: AlertThresholds::default(),
            retry_once_delay_ms: 1_000,
            fallback_capacity: 256,
            notify_min_severity: Severity::Error,
            error_log_path: None,
        }
    }
}

/// Where an error happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Identifies the value `cache_fallback` remembers for this operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_key: Option<String>,
}

impl ErrorContext {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            ..Default::default()
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_fallback_key(mut self, key: impl Into<String>) -> Self {
        self.fallback_key = Some(key.into());
        self
    }

    /// Fills in the component from the error type and meta when the caller
    /// did not name one.
    fn inferred(mut self, error_type: &str, meta: &Value) -> Self {
        if self.component.is_empty() {
            self.component = meta
                .get("component")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| infer_component(error_type).to_string());
        }
        if self.provider.is_none() {
            self.provider = meta.get("provider").and_then(Value::as_str).map(str::to_string);
        }
        self
    }
}

fn infer_component(error_type: &str) -> &'static str {
    let upper = error_type.to_ascii_uppercase();
    if upper.starts_with("CACHE") || upper.contains("SNAPSHOT") {
        "cache"
    } else if upper.starts_with("SCHEDULER") || upper.starts_with("RATE") || upper == "SERVICE_UNAVAILABLE" {
        "scheduler"
    } else if upper == ERROR_PATTERN || upper == ALERT_THRESHOLD {
        "error_core"
    } else if upper.starts_with("INVALID") {
        "config"
    } else {
        "api"
    }
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub severity: Severity,
    pub ts: i64,
    pub fingerprint: String,
    pub correlation_ids: Vec<String>,
    pub meta: Value,
    pub context: ErrorContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHealth {
    pub status: HealthState,
    pub recent_errors: usize,
    pub recent_fatal: usize,
    pub total_errors: u64,
    pub recovery_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDump {
    pub generated_at: i64,
    pub entries: Vec<ErrorEntry>,
    pub metrics: ErrorMetrics,
    pub patterns: Vec<(String, u64)>,
    pub health: ErrorHealth,
}

#[derive(Debug, Default)]
struct CoreState {
    seq: u64,
    buffer: VecDeque<ErrorEntry>,
    metrics: ErrorMetrics,
    /// fingerprint -> (ts, entry id) inside the correlation window
    recent: HashMap<String, VecDeque<(i64, String)>>,
    /// fingerprint -> ts of the last `ERROR_PATTERN` emitted for it
    patterns_emitted: HashMap<String, i64>,
    severity_window: HashMap<Severity, VecDeque<i64>>,
    /// severity -> ts of the last `ALERT_THRESHOLD` emitted for it
    alerted: HashMap<Severity, i64>,
    last_notice: HashMap<String, i64>,
    fallbacks: HashMap<String, Value>,
    fallback_order: VecDeque<String>,
}

enum Synthetic {
    Pattern { fingerprint: String, count: usize, original: String },
    Alert { severity: Severity, count: usize, threshold: usize },
}

/// Process-wide failure recorder and recovery dispatcher.
pub struct ErrorCore {
    config: ErrorCoreConfig,
    clock: SharedClock,
    notifier: Arc<dyn Notifier>,
    strategies: DashMap<String, Arc<dyn RecoveryStrategy>>,
    state: Mutex<CoreState>,
    journal: Option<ErrorJournal>,
}

impl std::fmt::Debug for ErrorCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorCore")
            .field("config", &self.config)
            .field("buffered", &self.state.lock().buffer.len())
            .finish()
    }
}

impl ErrorCore {
    pub fn new(config: ErrorCoreConfig) -> Self {
        Self {
            journal: config.error_log_path.clone().map(ErrorJournal::new),
            config,
            clock: clock::system(),
            notifier: Arc::new(TracingNotifier),
            strategies: DashMap::new(),
            state: Mutex::new(CoreState::default()),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Installs the process-wide instance. Returns `false` if one was already set.
    pub fn install_global(core: Arc<ErrorCore>) -> bool {
        GLOBAL.set(core).is_ok()
    }

    pub fn global() -> Option<Arc<ErrorCore>> {
        GLOBAL.get().cloned()
    }

    pub fn config(&self) -> &ErrorCoreConfig {
        &self.config
    }

    pub fn register_strategy(&self, name: impl Into<String>, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies.insert(name.into(), strategy);
    }

    /// Records a failure: sanitizes meta, correlates by fingerprint, logs,
    /// persists `error`/`fatal` entries, notifies the user and checks the
    /// pattern and alert thresholds.
    pub fn build(
        &self,
        error_type: &str,
        message: &str,
        meta: Value,
        severity: Severity,
    ) -> ErrorEntry {
        self.build_with_context(error_type, message, meta, severity, ErrorContext::default())
    }

    /// Records an [`ApiError`] raised in `context`.
    pub fn record(&self, err: &ApiError, context: &ErrorContext) -> ErrorEntry {
        let mut meta = json!({});
        if let Some(status) = err.status {
            meta["status"] = json!(status);
        }
        if let Some(provider) = err.provider.as_ref().or(context.provider.as_ref()) {
            meta["provider"] = json!(provider);
        }
        if let Some(operation) = &context.operation {
            meta["operation"] = json!(operation);
        }
        self.build_with_context(err.code(), &err.message, meta, err.severity(), context.clone())
    }

    pub fn build_with_context(
        &self,
        error_type: &str,
        message: &str,
        meta: Value,
        severity: Severity,
        context: ErrorContext,
    ) -> ErrorEntry {
        let (entry, synthetic) = self.push_entry(error_type, message, meta, severity, context, true);
        self.act(&entry);

        for event in synthetic {
            let (entry, _) = match event {
                Synthetic::Pattern { fingerprint, count, original } => self.push_entry(
                    ERROR_PATTERN,
                    &format!("{original} repeated {count} times within the correlation window"),
                    json!({ "fingerprint": fingerprint, "count": count, "originalType": original }),
                    Severity::Warn,
                    ErrorContext::new("error_core"),
                    false,
                ),
                Synthetic::Alert { severity, count, threshold } => self.push_entry(
                    ALERT_THRESHOLD,
                    &format!("{count} {severity} entries within the alert window (threshold {threshold})"),
                    json!({
                        "severity": severity,
                        "count": count,
                        "threshold": threshold,
                        "windowMs": self.config.alert_window_ms,
                    }),
                    Severity::Fatal,
                    ErrorContext::new("error_core"),
                    false,
                ),
            };
            self.act(&entry);
        }

        entry
    }

    fn push_entry(
        &self,
        error_type: &str,
        message: &str,
        meta: Value,
        severity: Severity,
        context: ErrorContext,
        check_thresholds: bool,
    ) -> (ErrorEntry, Vec<Synthetic>) {
        let now = self.clock.now_ms();
        let fp = fingerprint(error_type, message);
        let meta = sanitize(&meta);
        let context = context.inferred(error_type, &meta);
        let mut synthetic = Vec::new();

        let mut state = self.state.lock();
        state.seq += 1;
        let id = format!("err_{}_{}", now, state.seq);

        let correlation_window = self.config.correlation_window_ms as i64;
        let recent = state.recent.entry(fp.clone()).or_default();
        while recent.front().is_some_and(|(ts, _)| now - ts > correlation_window) {
            recent.pop_front();
        }
        let correlation_ids: Vec<String> = recent
            .iter()
            .rev()
            .take(MAX_CORRELATION_IDS)
            .map(|(_, id)| id.clone())
            .collect();
        recent.push_back((now, id.clone()));
        let occurrences = recent.len();

        let entry = ErrorEntry {
            id,
            error_type: error_type.to_string(),
            message: message.to_string(),
            severity,
            ts: now,
            fingerprint: fp.clone(),
            correlation_ids,
            meta,
            context,
        };

        state.buffer.push_back(entry.clone());
        while state.buffer.len() > self.config.max_buffer.max(1) {
            state.buffer.pop_front();
        }
        state.metrics.record(error_type, severity, &fp, now);

        if check_thresholds {
            if occurrences >= self.config.pattern_threshold.max(2) {
                let already = state
                    .patterns_emitted
                    .get(&fp)
                    .is_some_and(|ts| now - ts <= correlation_window);
                if !already {
                    state.patterns_emitted.insert(fp.clone(), now);
                    synthetic.push(Synthetic::Pattern {
                        fingerprint: fp,
                        count: occurrences,
                        original: error_type.to_string(),
                    });
                }
            }

            if let Some(threshold) = self.config.alert_thresholds.for_severity(severity) {
                let alert_window = self.config.alert_window_ms as i64;
                let window = state.severity_window.entry(severity).or_default();
                window.push_back(now);
                while window.front().is_some_and(|ts| now - ts > alert_window) {
                    window.pop_front();
                }
                let count = window.len();

                let highest_alerted = state
                    .alerted
                    .iter()
                    .filter(|(_, ts)| now - **ts <= alert_window)
                    .map(|(sev, _)| *sev)
                    .max();
                let escalates = highest_alerted.is_none_or(|highest| severity > highest);
                if threshold > 0 && count >= threshold && escalates {
                    state.alerted.insert(severity, now);
                    synthetic.push(Synthetic::Alert { severity, count, threshold });
                }
            }
        }

        (entry, synthetic)
    }

    fn act(&self, entry: &ErrorEntry) {
        match entry.severity {
            Severity::Fatal | Severity::Error => error!(
                error_type = %entry.error_type,
                fingerprint = %entry.fingerprint,
                component = %entry.context.component,
                "❌ {}", entry.message
            ),
            Severity::Warn => warn!(
                error_type = %entry.error_type,
                component = %entry.context.component,
                "⚠️ {}", entry.message
            ),
            Severity::Info => info!(error_type = %entry.error_type, "{}", entry.message),
            Severity::Debug => debug!(error_type = %entry.error_type, "{}", entry.message),
        }

        if entry.severity >= Severity::Error {
            self.persist(entry);
        }

        if entry.severity >= self.config.notify_min_severity {
            let message = super::ErrorKind::from_code(&entry.error_type)
                .map(|kind| kind.user_message().to_string())
                .unwrap_or_else(|| entry.message.clone());
            self.notify(&entry.error_type, &message, entry.severity, None);
        }
    }

    fn persist(&self, entry: &ErrorEntry) {
        let Some(journal) = &self.journal else {
            return;
        };
        match serde_json::to_string(entry) {
            Ok(line) => journal.append(line),
            Err(e) => warn!("Could not serialize error entry {}: {}", entry.id, e),
        }
    }

    /// Waits until every `error`/`fatal` entry recorded so far has reached
    /// the error log.
    pub async fn flush_log(&self) {
        if let Some(journal) = &self.journal {
            journal.flush().await;
        }
    }

    /// Surfaces a notice unless one of the same type went out within the
    /// notification interval. Returns whether the notice was shown.
    pub fn notify(
        &self,
        error_type: &str,
        message: &str,
        severity: Severity,
        duration: Option<Duration>,
    ) -> bool {
        let now = self.clock.now_ms();
        {
            let mut state = self.state.lock();
            let interval = self.config.notification_interval_ms as i64;
            if let Some(last) = state.last_notice.get(error_type) {
                if now - last < interval {
                    debug!(error_type, "Notice suppressed by rate limit");
                    return false;
                }
            }
            state.last_notice.insert(error_type.to_string(), now);
        }

        self.notifier.notify(&UserNotice {
            error_type: error_type.to_string(),
            message: message.to_string(),
            severity,
            duration: duration.unwrap_or(Duration::from_secs(5)),
        });
        true
    }

    /// Runs `operation`; on failure records the error and applies `recovery`.
    /// The original error is returned when there is no strategy or the
    /// strategy yields nothing.
    pub async fn guard<T, F, Fut>(
        &self,
        operation: F,
        recovery: Option<Recovery>,
        context: ErrorContext,
    ) -> Result<GuardOutcome<T>, ApiError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
        T: Serialize + DeserializeOwned,
    {
        let err = match operation().await {
            Ok(value) => {
                if recovery == Some(Recovery::CacheFallback) {
                    self.remember_fallback(&context, &value);
                }
                return Ok(GuardOutcome::Fresh(value));
            }
            Err(err) => err,
        };

        self.record(&err, &context);
        let Some(recovery) = recovery else {
            return Err(err);
        };

        self.state.lock().metrics.recovery_attempts += 1;
        debug!(strategy = %recovery, component = %context.component, "🔄 Attempting recovery");

        let recovered = match &recovery {
            Recovery::CacheFallback => self
                .lookup_fallback(&context)
                .and_then(|value| serde_json::from_value(value).ok())
                .map(GuardOutcome::Fallback),
            Recovery::RetryOnce => {
                tokio::time::sleep(Duration::from_millis(self.config.retry_once_delay_ms)).await;
                match operation().await {
                    Ok(value) => Some(GuardOutcome::Fresh(value)),
                    Err(retry_err) => {
                        self.record(&retry_err, &context);
                        None
                    }
                }
            }
            Recovery::DegradeGracefully => Some(GuardOutcome::Degraded(DegradedResponse::from_error(&err))),
            Recovery::Custom(name) => {
                let strategy = self.strategies.get(name).map(|s| Arc::clone(s.value()));
                match strategy {
                    Some(strategy) => strategy
                        .recover(&err, &context)
                        .await
                        .and_then(|value| serde_json::from_value(value).ok())
                        .map(GuardOutcome::Fallback),
                    None => {
                        warn!("Unknown recovery strategy '{}'", name);
                        None
                    }
                }
            }
        };

        match recovered {
            Some(outcome) => {
                self.state.lock().metrics.recovery_successes += 1;
                info!(strategy = %recovery, "✅ Recovered from {}", err.code());
                Ok(outcome)
            }
            None => Err(err),
        }
    }

    /// Retry wrapper for ad-hoc callers, independent of the scheduler's retry.
    pub async fn with_retry<T, F, Fut>(&self, mut operation: F, options: RetryOptions) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut retry = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if retry < options.max_retries && options.should_retry(&err) => {
                    let delay = options.delay_for(retry);
                    retry += 1;
                    debug!("🔄 Retry {}/{} in {:?} after {}", retry, options.max_retries, delay, err);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn fallback_slot(context: &ErrorContext) -> Option<String> {
        let key = context.fallback_key.as_ref()?;
        let operation = context.operation.as_deref().unwrap_or(&context.component);
        Some(fingerprint(operation, key))
    }

    fn remember_fallback<T: Serialize>(&self, context: &ErrorContext, value: &T) {
        let Some(slot) = Self::fallback_slot(context) else {
            return;
        };
        let Ok(value) = serde_json::to_value(value) else {
            return;
        };
        let mut state = self.state.lock();
        if state.fallbacks.insert(slot.clone(), value).is_none() {
            state.fallback_order.push_back(slot);
        }
        while state.fallback_order.len() > self.config.fallback_capacity.max(1) {
            if let Some(oldest) = state.fallback_order.pop_front() {
                state.fallbacks.remove(&oldest);
            }
        }
    }

    fn lookup_fallback(&self, context: &ErrorContext) -> Option<Value> {
        let slot = Self::fallback_slot(context)?;
        self.state.lock().fallbacks.get(&slot).cloned()
    }

    /// Most recent entries, newest last.
    pub fn recent(&self, limit: usize) -> Vec<ErrorEntry> {
        let state = self.state.lock();
        let skip = state.buffer.len().saturating_sub(limit);
        state.buffer.iter().skip(skip).cloned().collect()
    }

    pub fn metrics(&self) -> ErrorMetrics {
        self.state.lock().metrics.clone()
    }

    pub fn health_status(&self) -> ErrorHealth {
        let now = self.clock.now_ms();
        let window = self.config.alert_window_ms as i64;
        let state = self.state.lock();
        let in_window = |severity: Severity| {
            state
                .severity_window
                .get(&severity)
                .map_or(0, |w| w.iter().filter(|ts| now - **ts <= window).count())
        };
        let recent_fatal = in_window(Severity::Fatal);
        let recent_errors = in_window(Severity::Error) + recent_fatal;

        let status = if recent_fatal > 0 {
            HealthState::Critical
        } else if recent_errors >= self.config.alert_thresholds.error.div_ceil(2).max(1) {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        ErrorHealth {
            status,
            recent_errors,
            recent_fatal,
            total_errors: state.metrics.total,
            recovery_rate: state.metrics.recovery_rate(),
        }
    }

    pub fn dump(&self) -> ErrorDump {
        let health = self.health_status();
        let state = self.state.lock();
        ErrorDump {
            generated_at: self.clock.now_ms(),
            entries: state.buffer.iter().cloned().collect(),
            metrics: state.metrics.clone(),
            patterns: state.metrics.frequent_patterns(2),
            health,
        }
    }
}
