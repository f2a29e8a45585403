//! Engine statistics and guardrail limits.
//!
//! `EngineStats` collects the operational counters the pipeline bumps when
//! it drops, caps, or flags something. It is injected into the metrics
//! manager at construction; production shares one process-wide instance,
//! tests build their own.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Dimension-count soft limit: crossing it is reported, not enforced.
pub const DIMENSION_KEY_SIZE_SOFT_LIMIT: usize = 500;
/// Dimension-count hard limit: first-seen keys beyond it are dropped.
pub const DIMENSION_KEY_SIZE_HARD_LIMIT: usize = 800;
/// Configurable hard-limit ceiling; configs cannot raise it past this.
pub const DIMENSION_KEY_SIZE_HARD_LIMIT_MAX: usize = 3000;

pub const MAX_METRIC_COUNT_PER_CONFIG: usize = 1000;
pub const MAX_CONDITION_COUNT_PER_CONFIG: usize = 1000;
pub const MAX_MATCHER_COUNT_PER_CONFIG: usize = 2000;
pub const MAX_ALERT_COUNT_PER_CONFIG: usize = 100;
pub const MAX_LOG_SOURCE_COUNT: usize = 50;
pub const MAX_PULL_PACKAGES: usize = 100;

/// Default and ceiling for `max_metrics_memory_kb`, in bytes.
pub const DEFAULT_MAX_METRICS_BYTES: usize = 2 * 1024 * 1024;
pub const HARD_MAX_METRICS_BYTES: usize = 20 * 1024 * 1024;
/// Default and ceiling for `soft_metrics_memory_kb`, in bytes.
pub const DEFAULT_SOFT_METRICS_BYTES: usize = 192 * 1024;
pub const HARD_SOFT_METRICS_BYTES: usize = 10 * 1024 * 1024;

/// Gauge atoms retained per dimension per bucket.
pub const MAX_GAUGE_ATOMS_PER_DIMENSION: usize = 10;

/// Clamp a configured per-bucket dimension limit into the allowed band.
/// Zero (unset) selects the default hard limit.
pub fn clamp_dimension_hard_limit(configured: usize) -> usize {
    if configured == 0 {
        DIMENSION_KEY_SIZE_HARD_LIMIT
    } else {
        configured.clamp(DIMENSION_KEY_SIZE_HARD_LIMIT, DIMENSION_KEY_SIZE_HARD_LIMIT_MAX)
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    configs_received: u64,
    configs_rejected: u64,
    matcher_matched: HashMap<i64, u64>,
    hard_dimension_limit_reached: HashMap<i64, u64>,
    metric_dimension_peak: HashMap<i64, usize>,
    buckets_dropped: HashMap<i64, u64>,
    bucket_count: HashMap<i64, u64>,
    anomalies_declared: HashMap<i64, u64>,
    log_source_drops: u64,
    pull_timeouts: u64,
    pull_failures: u64,
    events_sampled_out: u64,
}

/// Process-wide operational counters. All methods take `&self`; interior
/// mutability keeps call sites terse on the hot path.
#[derive(Debug, Default)]
pub struct EngineStats {
    inner: Mutex<StatsInner>,
}

static SHARED: Lazy<Arc<EngineStats>> = Lazy::new(|| Arc::new(EngineStats::default()));

impl EngineStats {
    pub fn new() -> Self {
        EngineStats::default()
    }

    /// The shared process-wide instance.
    pub fn shared() -> Arc<EngineStats> {
        Arc::clone(&SHARED)
    }

    pub fn note_config_received(&self, valid: bool) {
        let mut inner = self.inner.lock();
        inner.configs_received += 1;
        if !valid {
            inner.configs_rejected += 1;
        }
    }

    pub fn note_matcher_matched(&self, matcher_id: i64) {
        *self.inner.lock().matcher_matched.entry(matcher_id).or_insert(0) += 1;
    }

    pub fn note_hard_dimension_limit_reached(&self, metric_id: i64) {
        *self
            .inner
            .lock()
            .hard_dimension_limit_reached
            .entry(metric_id)
            .or_insert(0) += 1;
    }

    /// Records the tuple count of a metric crossing the soft limit.
    pub fn note_metric_dimension_size(&self, metric_id: i64, size: usize) {
        let mut inner = self.inner.lock();
        let peak = inner.metric_dimension_peak.entry(metric_id).or_insert(0);
        if size > *peak {
            *peak = size;
        }
    }

    pub fn note_bucket_dropped(&self, metric_id: i64) {
        *self.inner.lock().buckets_dropped.entry(metric_id).or_insert(0) += 1;
    }

    pub fn note_bucket_count(&self, metric_id: i64) {
        *self.inner.lock().bucket_count.entry(metric_id).or_insert(0) += 1;
    }

    pub fn note_anomaly_declared(&self, alert_id: i64) {
        *self.inner.lock().anomalies_declared.entry(alert_id).or_insert(0) += 1;
    }

    pub fn note_log_source_dropped(&self) {
        self.inner.lock().log_source_drops += 1;
    }

    pub fn note_pull_timeout(&self) {
        self.inner.lock().pull_timeouts += 1;
    }

    pub fn note_pull_failure(&self) {
        self.inner.lock().pull_failures += 1;
    }

    pub fn note_event_sampled_out(&self) {
        self.inner.lock().events_sampled_out += 1;
    }

    /// Whether the hard dimension guardrail has fired for this metric since
    /// startup; reports carry it as a one-shot flag.
    pub fn has_hit_dimension_guardrail(&self, metric_id: i64) -> bool {
        self.inner
            .lock()
            .hard_dimension_limit_reached
            .contains_key(&metric_id)
    }

    pub fn matcher_matched_count(&self, matcher_id: i64) -> u64 {
        self.inner
            .lock()
            .matcher_matched
            .get(&matcher_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn anomalies_declared_count(&self, alert_id: i64) -> u64 {
        self.inner
            .lock()
            .anomalies_declared
            .get(&alert_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn log_source_drops(&self) -> u64 {
        self.inner.lock().log_source_drops
    }

    pub fn pull_timeouts(&self) -> u64 {
        self.inner.lock().pull_timeouts
    }
}
