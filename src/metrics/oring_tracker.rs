//! SUM-aggregation duration tracking.
//!
//! Multiple concurrent starts overlap ("oring"): the tracked value is the
//! wall time during which at least one start is live and the condition
//! holds. Starts are refcounted per internal dimension; a stop-all zeroes
//! every refcount at once.

use std::collections::HashMap;

use crate::anomaly::AnomalyTracker;
use crate::condition::{ConditionKey, ConditionState};
use crate::dimension::{DimensionKey, MetricDimensionKey};
use crate::metrics::{MetricCore, NumericBucket};

pub struct OringDurationTracker {
    what_key: DimensionKey,
    nested: bool,
    condition_sliced: bool,

    /// Internal-dimension refcounts currently accumulating.
    started: HashMap<DimensionKey, u32>,
    /// Refcounts waiting for the condition to come back.
    paused: HashMap<DimensionKey, u32>,
    /// Condition keys stored at first start, for sliced re-queries.
    condition_keys: HashMap<DimensionKey, ConditionKey>,

    /// When the current accumulation run began; valid while `started` is
    /// non-empty.
    last_start_ns: i64,
    /// Accumulated duration in the current bucket, per state-values key.
    state_durations: HashMap<DimensionKey, i64>,
    /// The state-values key accumulation is currently attributed to.
    current_state_key: DimensionKey,
}

impl OringDurationTracker {
    pub fn new(
        what_key: DimensionKey,
        state_key: DimensionKey,
        nested: bool,
        condition_sliced: bool,
    ) -> Self {
        OringDurationTracker {
            what_key,
            nested,
            condition_sliced,
            started: HashMap::new(),
            paused: HashMap::new(),
            condition_keys: HashMap::new(),
            last_start_ns: 0,
            state_durations: HashMap::new(),
            current_state_key: state_key,
        }
    }

    fn event_key(&self) -> MetricDimensionKey {
        MetricDimensionKey::new(self.what_key.clone(), self.current_state_key.clone())
    }

    pub fn current_state_key(&self) -> &DimensionKey {
        &self.current_state_key
    }

    fn current_bucket_total(&self) -> i64 {
        self.state_durations.values().sum()
    }

    pub fn note_start(
        &mut self,
        key: DimensionKey,
        condition: bool,
        timestamp_ns: i64,
        condition_key: ConditionKey,
        core: &MetricCore,
        anomaly: &mut [AnomalyTracker],
    ) {
        if self.condition_sliced {
            self.condition_keys.entry(key.clone()).or_insert(condition_key);
        }
        if condition {
            if self.started.is_empty() {
                self.last_start_ns = timestamp_ns;
                self.start_anomaly_alarms(timestamp_ns, core, anomaly);
            }
            *self.started.entry(key).or_insert(0) += 1;
        } else {
            *self.paused.entry(key).or_insert(0) += 1;
        }
    }

    pub fn note_stop(
        &mut self,
        key: &DimensionKey,
        timestamp_ns: i64,
        stop_all: bool,
        core: &MetricCore,
        anomaly: &mut [AnomalyTracker],
    ) {
        if let Some(count) = self.started.get_mut(key) {
            if !self.nested || stop_all {
                *count = 0;
            } else {
                *count = count.saturating_sub(1);
            }
            if *count == 0 {
                self.started.remove(key);
            }
            if self.started.is_empty() {
                self.accumulate(timestamp_ns);
                self.detect_anomalies(timestamp_ns, core, anomaly);
                self.stop_anomaly_alarms(timestamp_ns, core, anomaly);
            }
        }
        if let Some(count) = self.paused.get_mut(key) {
            if !self.nested || stop_all {
                *count = 0;
            } else {
                *count = count.saturating_sub(1);
            }
            if *count == 0 {
                self.paused.remove(key);
            }
        }
        if !self.started.contains_key(key) && !self.paused.contains_key(key) {
            self.condition_keys.remove(key);
        }
    }

    pub fn note_stop_all(
        &mut self,
        timestamp_ns: i64,
        core: &MetricCore,
        anomaly: &mut [AnomalyTracker],
    ) {
        if !self.started.is_empty() {
            self.accumulate(timestamp_ns);
            self.detect_anomalies(timestamp_ns, core, anomaly);
            self.stop_anomaly_alarms(timestamp_ns, core, anomaly);
        }
        self.started.clear();
        self.paused.clear();
        self.condition_keys.clear();
    }

    fn accumulate(&mut self, timestamp_ns: i64) {
        let elapsed = timestamp_ns - self.last_start_ns;
        if elapsed > 0 {
            *self
                .state_durations
                .entry(self.current_state_key.clone())
                .or_insert(0) += elapsed;
        }
        self.last_start_ns = timestamp_ns;
    }

    pub fn on_condition_changed(
        &mut self,
        condition: bool,
        timestamp_ns: i64,
        core: &MetricCore,
        anomaly: &mut [AnomalyTracker],
    ) {
        if condition {
            if !self.paused.is_empty() {
                if self.started.is_empty() {
                    self.last_start_ns = timestamp_ns;
                    self.start_anomaly_alarms(timestamp_ns, core, anomaly);
                }
                for (key, count) in self.paused.drain() {
                    *self.started.entry(key).or_insert(0) += count;
                }
            }
        } else if !self.started.is_empty() {
            self.accumulate(timestamp_ns);
            for (key, count) in self.started.drain() {
                *self.paused.entry(key).or_insert(0) += count;
            }
            self.stop_anomaly_alarms(timestamp_ns, core, anomaly);
        }
    }

    /// Re-query the sliced condition per live internal dimension, pausing
    /// and resuming individual refcounts.
    pub fn on_sliced_condition_may_change(
        &mut self,
        timestamp_ns: i64,
        query: &dyn Fn(&ConditionKey) -> ConditionState,
        core: &MetricCore,
        anomaly: &mut [AnomalyTracker],
    ) {
        let state_of = |keys: &HashMap<DimensionKey, ConditionKey>, key: &DimensionKey| {
            keys.get(key).map(|ck| query(ck)).unwrap_or(ConditionState::Unknown)
        };

        let to_pause: Vec<DimensionKey> = self
            .started
            .keys()
            .filter(|key| !state_of(&self.condition_keys, key).is_true())
            .cloned()
            .collect();
        if !to_pause.is_empty() {
            if to_pause.len() == self.started.len() {
                self.accumulate(timestamp_ns);
                self.stop_anomaly_alarms(timestamp_ns, core, anomaly);
            }
            for key in to_pause {
                if let Some(count) = self.started.remove(&key) {
                    *self.paused.entry(key).or_insert(0) += count;
                }
            }
        }

        let to_resume: Vec<DimensionKey> = self
            .paused
            .keys()
            .filter(|key| state_of(&self.condition_keys, key).is_true())
            .cloned()
            .collect();
        if !to_resume.is_empty() {
            if self.started.is_empty() {
                self.last_start_ns = timestamp_ns;
                self.start_anomaly_alarms(timestamp_ns, core, anomaly);
            }
            for key in to_resume {
                if let Some(count) = self.paused.remove(&key) {
                    *self.started.entry(key).or_insert(0) += count;
                }
            }
        }
    }

    /// Attribute accumulation to a new state-values key from this moment.
    pub fn on_state_changed(&mut self, timestamp_ns: i64, new_state_key: DimensionKey) {
        if !self.started.is_empty() {
            self.accumulate(timestamp_ns);
        }
        self.current_state_key = new_state_key;
    }

    /// Close the current bucket at `close_ns`. Returns true when the
    /// tracker holds no further state and can be dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn flush_current_bucket(
        &mut self,
        close_ns: i64,
        next_bucket_start_ns: i64,
        threshold: Option<crate::config::UploadThreshold>,
        global_condition_true_ns: Option<i64>,
        core: &MetricCore,
        anomaly: &mut [AnomalyTracker],
        past: &mut HashMap<MetricDimensionKey, Vec<NumericBucket>>,
    ) -> bool {
        let start_ns = core.current_bucket_start_ns;
        if !self.started.is_empty() {
            self.accumulate(close_ns);
            self.last_start_ns = next_bucket_start_ns;
        }

        let closed_bucket_num = core.current_bucket_num;
        for (state_key, duration) in self.state_durations.drain() {
            if duration <= 0 {
                continue;
            }
            if threshold.is_some_and(|t| !t.passes(duration)) {
                continue;
            }
            let key = MetricDimensionKey::new(self.what_key.clone(), state_key);
            past.entry(key.clone()).or_default().push(NumericBucket {
                start_ns,
                end_ns: close_ns,
                value: duration,
                condition_true_ns: global_condition_true_ns,
            });
            for tracker in anomaly.iter_mut() {
                tracker.add_past_bucket(&key, duration, closed_bucket_num);
            }
        }

        self.started.is_empty() && self.paused.is_empty()
    }

    pub fn has_accumulated_duration(&self) -> bool {
        !self.started.is_empty()
            || !self.paused.is_empty()
            || self.state_durations.values().any(|d| *d > 0)
    }

    /// Live refcount total, for invariant checks in tests.
    pub fn live_start_count(&self) -> u32 {
        self.started.values().sum::<u32>() + self.paused.values().sum::<u32>()
    }

    fn detect_anomalies(&self, timestamp_ns: i64, core: &MetricCore, anomaly: &mut [AnomalyTracker]) {
        let key = self.event_key();
        let value = self
            .state_durations
            .get(&self.current_state_key)
            .copied()
            .unwrap_or(0);
        for tracker in anomaly.iter_mut() {
            tracker.detect_and_declare(
                timestamp_ns,
                core.current_bucket_num,
                core.metric_id,
                &key,
                value,
            );
        }
    }

    /// Project the breach time assuming the condition stays true, and arm
    /// the alarm. Fired alarms substitute for events that never arrive.
    fn start_anomaly_alarms(
        &self,
        timestamp_ns: i64,
        _core: &MetricCore,
        anomaly: &mut [AnomalyTracker],
    ) {
        let key = self.event_key();
        let current = self.current_bucket_total();
        for tracker in anomaly.iter_mut() {
            let remaining =
                (tracker.threshold() - tracker.sum_over_past_buckets(&key) - current).max(0);
            tracker.start_alarm(&key, timestamp_ns + remaining + 1);
        }
    }

    fn stop_anomaly_alarms(
        &self,
        timestamp_ns: i64,
        core: &MetricCore,
        anomaly: &mut [AnomalyTracker],
    ) {
        let key = self.event_key();
        for tracker in anomaly.iter_mut() {
            tracker.stop_alarm(core.metric_id, &key, timestamp_ns);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionState;
    use crate::guardrail::EngineStats;
    use crate::metrics::{ActivationMap, ConditionTimer};
    use std::sync::Arc;

    const SEC: i64 = 1_000_000_000;

    fn core(bucket_secs: i64) -> MetricCore {
        MetricCore {
            metric_id: 7,
            config_id: 1,
            time_base_ns: 0,
            bucket_size_ns: bucket_secs * SEC,
            current_bucket_start_ns: 0,
            current_bucket_num: 0,
            condition: ConditionState::True,
            condition_sliced: false,
            condition_index: None,
            links: vec![],
            links_all_condition_dimensions: false,
            state_links: vec![],
            sliced_state_atoms: vec![],
            state_group_maps: Default::default(),
            sampler: None,
            dimension_soft_limit: 500,
            dimension_hard_limit: 800,
            has_hit_guardrail: false,
            condition_timer: ConditionTimer::new(0, true),
            activations: ActivationMap::default(),
            is_active: true,
            stats: Arc::new(EngineStats::new()),
        }
    }

    fn tracker(nested: bool) -> OringDurationTracker {
        OringDurationTracker::new(DimensionKey::empty(), DimensionKey::empty(), nested, false)
    }

    fn flush(
        t: &mut OringDurationTracker,
        close_ns: i64,
        core: &MetricCore,
    ) -> HashMap<MetricDimensionKey, Vec<NumericBucket>> {
        let mut past = HashMap::new();
        t.flush_current_bucket(close_ns, close_ns, None, None, core, &mut [], &mut past);
        past
    }

    #[test]
    fn test_basic_start_stop() {
        let core = core(60);
        let mut t = tracker(false);
        t.note_start(DimensionKey::empty(), true, 10 * SEC, ConditionKey::new(), &core, &mut []);
        t.note_stop(&DimensionKey::empty(), 40 * SEC, false, &core, &mut []);

        let past = flush(&mut t, 60 * SEC, &core);
        let buckets: Vec<_> = past.values().flatten().collect();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].value, 30 * SEC);
    }

    #[test]
    fn test_overlapping_starts_count_once() {
        let core = core(60);
        let mut t = tracker(true);
        let k = DimensionKey::empty();
        t.note_start(k.clone(), true, 10 * SEC, ConditionKey::new(), &core, &mut []);
        t.note_start(k.clone(), true, 20 * SEC, ConditionKey::new(), &core, &mut []);
        assert_eq!(t.live_start_count(), 2);

        t.note_stop(&k, 30 * SEC, false, &core, &mut []);
        // Still one live start; wall time keeps accumulating.
        t.note_stop(&k, 50 * SEC, false, &core, &mut []);
        assert_eq!(t.live_start_count(), 0);

        let past = flush(&mut t, 60 * SEC, &core);
        let buckets: Vec<_> = past.values().flatten().collect();
        assert_eq!(buckets[0].value, 40 * SEC);
    }

    #[test]
    fn test_non_nested_single_stop_releases() {
        let core = core(60);
        let mut t = tracker(false);
        let k = DimensionKey::empty();
        t.note_start(k.clone(), true, 10 * SEC, ConditionKey::new(), &core, &mut []);
        t.note_start(k.clone(), true, 20 * SEC, ConditionKey::new(), &core, &mut []);
        t.note_stop(&k, 30 * SEC, false, &core, &mut []);
        assert_eq!(t.live_start_count(), 0);

        let past = flush(&mut t, 60 * SEC, &core);
        let buckets: Vec<_> = past.values().flatten().collect();
        assert_eq!(buckets[0].value, 20 * SEC);
    }

    #[test]
    fn test_condition_pause_resume() {
        let core = core(60);
        let mut t = tracker(false);
        let k = DimensionKey::empty();
        t.note_start(k.clone(), true, 0, ConditionKey::new(), &core, &mut []);
        // Condition drops at 10s, resumes at 30s, stop at 40s: 20s total.
        t.on_condition_changed(false, 10 * SEC, &core, &mut []);
        t.on_condition_changed(true, 30 * SEC, &core, &mut []);
        t.note_stop(&k, 40 * SEC, false, &core, &mut []);

        let past = flush(&mut t, 60 * SEC, &core);
        let buckets: Vec<_> = past.values().flatten().collect();
        assert_eq!(buckets[0].value, 20 * SEC);
    }

    #[test]
    fn test_start_under_false_condition_is_paused() {
        let core = core(60);
        let mut t = tracker(false);
        let k = DimensionKey::empty();
        t.note_start(k.clone(), false, 0, ConditionKey::new(), &core, &mut []);
        assert!(t.has_accumulated_duration());

        t.on_condition_changed(true, 20 * SEC, &core, &mut []);
        t.note_stop(&k, 50 * SEC, false, &core, &mut []);

        let past = flush(&mut t, 60 * SEC, &core);
        let buckets: Vec<_> = past.values().flatten().collect();
        assert_eq!(buckets[0].value, 30 * SEC);
    }

    #[test]
    fn test_straddling_run_splits_at_boundary() {
        let c = core(60);
        let mut t = tracker(false);
        t.note_start(DimensionKey::empty(), true, 50 * SEC, ConditionKey::new(), &c, &mut []);

        // First bucket closes with 10s of the run; the run itself stays live.
        let past0 = flush(&mut t, 60 * SEC, &c);
        assert_eq!(past0.values().flatten().next().expect("bucket").value, 10 * SEC);
        assert!(t.has_accumulated_duration());
    }

    #[test]
    fn test_stop_all_zeroes_refcounts() {
        let core = core(60);
        let mut t = tracker(true);
        let k1 = DimensionKey::empty();
        t.note_start(k1.clone(), true, 10 * SEC, ConditionKey::new(), &core, &mut []);
        t.note_start(k1.clone(), true, 20 * SEC, ConditionKey::new(), &core, &mut []);
        t.note_stop_all(30 * SEC, &core, &mut []);
        assert_eq!(t.live_start_count(), 0);

        let past = flush(&mut t, 60 * SEC, &core);
        let buckets: Vec<_> = past.values().flatten().collect();
        assert_eq!(buckets[0].value, 20 * SEC);
    }

    #[test]
    fn test_zero_duration_run_produces_no_bucket() {
        let core = core(60);
        let mut t = tracker(false);
        let k = DimensionKey::empty();
        t.note_start(k.clone(), true, 10 * SEC, ConditionKey::new(), &core, &mut []);
        t.note_stop(&k, 10 * SEC, false, &core, &mut []);

        let past = flush(&mut t, 60 * SEC, &core);
        assert!(past.is_empty());
    }

    #[test]
    fn test_threshold_filters_buckets() {
        use crate::config::UploadThreshold;
        let core = core(60);
        let mut t = tracker(false);
        let k = DimensionKey::empty();
        t.note_start(k.clone(), true, 0, ConditionKey::new(), &core, &mut []);
        t.note_stop(&k, 10 * SEC, false, &core, &mut []);

        let mut past = HashMap::new();
        t.flush_current_bucket(
            60 * SEC,
            60 * SEC,
            Some(UploadThreshold::Gt(20 * SEC)),
            None,
            &core,
            &mut [],
            &mut past,
        );
        assert!(past.is_empty());
    }
}
