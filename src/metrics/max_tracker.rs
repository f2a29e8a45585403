//! MAX_SPARSE-aggregation duration tracking.
//!
//! The bucket value is the longest single run completed within the bucket.
//! A run straddling a rollover is split: each bucket sees the portion
//! overlapping it.

use std::collections::HashMap;

use tracing::debug;

use crate::anomaly::AnomalyTracker;
use crate::condition::{ConditionKey, ConditionState};
use crate::dimension::{DimensionKey, MetricDimensionKey};
use crate::metrics::{MetricCore, NumericBucket};

#[derive(Debug, Clone, Copy)]
struct RunInfo {
    start_count: u32,
    running: bool,
    last_start_ns: i64,
    accumulated_ns: i64,
}

pub struct MaxDurationTracker {
    what_key: DimensionKey,
    nested: bool,
    condition_sliced: bool,
    runs: HashMap<DimensionKey, RunInfo>,
    condition_keys: HashMap<DimensionKey, ConditionKey>,
    /// Longest run completed so far in the current bucket.
    current_max_ns: i64,
}

impl MaxDurationTracker {
    pub fn new(what_key: DimensionKey, nested: bool, condition_sliced: bool) -> Self {
        MaxDurationTracker {
            what_key,
            nested,
            condition_sliced,
            runs: HashMap::new(),
            condition_keys: HashMap::new(),
            current_max_ns: 0,
        }
    }

    pub fn note_start(
        &mut self,
        key: DimensionKey,
        condition: bool,
        timestamp_ns: i64,
        condition_key: ConditionKey,
    ) {
        if self.condition_sliced {
            self.condition_keys.entry(key.clone()).or_insert(condition_key);
        }
        let run = self.runs.entry(key).or_insert(RunInfo {
            start_count: 0,
            running: false,
            last_start_ns: timestamp_ns,
            accumulated_ns: 0,
        });
        if self.nested {
            run.start_count += 1;
        } else {
            run.start_count = 1;
        }
        if condition && !run.running {
            run.running = true;
            run.last_start_ns = timestamp_ns;
        }
    }

    pub fn note_stop(&mut self, key: &DimensionKey, timestamp_ns: i64, stop_all: bool) {
        let Some(run) = self.runs.get_mut(key) else {
            return;
        };
        if !self.nested || stop_all {
            run.start_count = 0;
        } else {
            run.start_count = run.start_count.saturating_sub(1);
        }
        if run.start_count > 0 {
            return;
        }
        let mut total = run.accumulated_ns;
        if run.running {
            total += timestamp_ns - run.last_start_ns;
        }
        if total > self.current_max_ns {
            self.current_max_ns = total;
        }
        self.runs.remove(key);
        self.condition_keys.remove(key);
    }

    pub fn note_stop_all(&mut self, timestamp_ns: i64) {
        let keys: Vec<DimensionKey> = self.runs.keys().cloned().collect();
        for key in keys {
            self.note_stop(&key, timestamp_ns, true);
        }
    }

    pub fn on_condition_changed(&mut self, condition: bool, timestamp_ns: i64) {
        for run in self.runs.values_mut() {
            if condition {
                if run.start_count > 0 && !run.running {
                    run.running = true;
                    run.last_start_ns = timestamp_ns;
                }
            } else if run.running {
                run.accumulated_ns += timestamp_ns - run.last_start_ns;
                run.running = false;
            }
        }
    }

    pub fn on_sliced_condition_may_change(
        &mut self,
        timestamp_ns: i64,
        query: &dyn Fn(&ConditionKey) -> ConditionState,
    ) {
        for (key, run) in self.runs.iter_mut() {
            let condition = self
                .condition_keys
                .get(key)
                .map(|ck| query(ck).is_true())
                .unwrap_or(false);
            if condition {
                if run.start_count > 0 && !run.running {
                    run.running = true;
                    run.last_start_ns = timestamp_ns;
                }
            } else if run.running {
                run.accumulated_ns += timestamp_ns - run.last_start_ns;
                run.running = false;
            }
        }
    }

    pub fn on_state_changed(&mut self, _timestamp_ns: i64) {
        // Max aggregation does not slice by state.
        debug!("state change ignored by max duration tracker");
    }

    /// Close the current bucket at `close_ns`, splitting in-progress runs
    /// at the boundary. Returns true when the tracker can be dropped.
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
        let mut bucket_max = self.current_max_ns;

        for run in self.runs.values_mut() {
            if run.running {
                run.accumulated_ns += close_ns - run.last_start_ns;
                run.last_start_ns = next_bucket_start_ns;
            }
            // The portion inside this bucket competes for its max and the
            // run restarts counting from the boundary.
            if run.accumulated_ns > bucket_max {
                bucket_max = run.accumulated_ns;
            }
            run.accumulated_ns = 0;
        }
        self.current_max_ns = 0;

        if bucket_max > 0 && !threshold.is_some_and(|t| !t.passes(bucket_max)) {
            let key = MetricDimensionKey::new(self.what_key.clone(), DimensionKey::empty());
            past.entry(key.clone()).or_default().push(NumericBucket {
                start_ns,
                end_ns: close_ns,
                value: bucket_max,
                condition_true_ns: global_condition_true_ns,
            });
            for tracker in anomaly.iter_mut() {
                tracker.add_past_bucket(&key, bucket_max, core.current_bucket_num);
            }
        }

        self.runs.is_empty()
    }

    pub fn has_accumulated_duration(&self) -> bool {
        !self.runs.is_empty() || self.current_max_ns > 0
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

    fn core_at(bucket_secs: i64, bucket_num: i64) -> MetricCore {
        MetricCore {
            metric_id: 7,
            config_id: 1,
            time_base_ns: 0,
            bucket_size_ns: bucket_secs * SEC,
            current_bucket_start_ns: bucket_num * bucket_secs * SEC,
            current_bucket_num: bucket_num,
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

    fn flush_at(
        t: &mut MaxDurationTracker,
        close_ns: i64,
        core: &MetricCore,
    ) -> Vec<NumericBucket> {
        let mut past = HashMap::new();
        t.flush_current_bucket(close_ns, close_ns, None, None, core, &mut [], &mut past);
        past.into_values().flatten().collect()
    }

    #[test]
    fn test_longest_run_wins() {
        let core = core_at(60, 0);
        let mut t = MaxDurationTracker::new(DimensionKey::empty(), false, false);
        let k = DimensionKey::empty();

        t.note_start(k.clone(), true, 0, ConditionKey::new());
        t.note_stop(&k, 10 * SEC, false);
        t.note_start(k.clone(), true, 20 * SEC, ConditionKey::new());
        t.note_stop(&k, 45 * SEC, false);

        let buckets = flush_at(&mut t, 60 * SEC, &core);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].value, 25 * SEC);
    }

    #[test]
    fn test_run_splits_across_buckets() {
        // Start at 50s, stop at 75s, bucket size 60s: 10s then 15s.
        let mut t = MaxDurationTracker::new(DimensionKey::empty(), false, false);
        let k = DimensionKey::empty();

        let bucket0 = core_at(60, 0);
        t.note_start(k.clone(), true, 50 * SEC, ConditionKey::new());
        let buckets = flush_at(&mut t, 60 * SEC, &bucket0);
        assert_eq!(buckets[0].value, 10 * SEC);
        assert!(t.has_accumulated_duration());

        let bucket1 = core_at(60, 1);
        t.note_stop(&k, 75 * SEC, false);
        let buckets = flush_at(&mut t, 120 * SEC, &bucket1);
        assert_eq!(buckets[0].value, 15 * SEC);
        assert!(!t.has_accumulated_duration());
    }

    #[test]
    fn test_condition_pause_excludes_time() {
        let core = core_at(60, 0);
        let mut t = MaxDurationTracker::new(DimensionKey::empty(), false, false);
        let k = DimensionKey::empty();

        t.note_start(k.clone(), true, 0, ConditionKey::new());
        t.on_condition_changed(false, 10 * SEC);
        t.on_condition_changed(true, 40 * SEC);
        t.note_stop(&k, 50 * SEC, false);

        let buckets = flush_at(&mut t, 60 * SEC, &core);
        assert_eq!(buckets[0].value, 20 * SEC);
    }

    #[test]
    fn test_nested_stops() {
        let core = core_at(60, 0);
        let mut t = MaxDurationTracker::new(DimensionKey::empty(), true, false);
        let k = DimensionKey::empty();

        t.note_start(k.clone(), true, 0, ConditionKey::new());
        t.note_start(k.clone(), true, 5 * SEC, ConditionKey::new());
        t.note_stop(&k, 10 * SEC, false);
        // Still one outstanding start; the run continues.
        t.note_stop(&k, 30 * SEC, false);

        let buckets = flush_at(&mut t, 60 * SEC, &core);
        assert_eq!(buckets[0].value, 30 * SEC);
    }

    #[test]
    fn test_stop_all_completes_runs() {
        let core = core_at(60, 0);
        let mut t = MaxDurationTracker::new(DimensionKey::empty(), true, false);
        let k = DimensionKey::empty();

        t.note_start(k.clone(), true, 0, ConditionKey::new());
        t.note_start(k.clone(), true, 0, ConditionKey::new());
        t.note_stop_all(25 * SEC);
        assert!(t.has_accumulated_duration());

        let buckets = flush_at(&mut t, 60 * SEC, &core);
        assert_eq!(buckets[0].value, 25 * SEC);
        assert!(!t.has_accumulated_duration());
    }

    #[test]
    fn test_zero_length_run_no_bucket() {
        let core = core_at(60, 0);
        let mut t = MaxDurationTracker::new(DimensionKey::empty(), false, false);
        let k = DimensionKey::empty();
        t.note_start(k.clone(), true, 10 * SEC, ConditionKey::new());
        t.note_stop(&k, 10 * SEC, false);

        let buckets = flush_at(&mut t, 60 * SEC, &core);
        assert!(buckets.is_empty());
    }
}
