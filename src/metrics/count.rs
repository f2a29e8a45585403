//! Count metric producer.
//!
//! Increments a per-dimension counter in the current bucket for every
//! matched event that passes the condition. On rollover the counts close
//! into past buckets and feed the anomaly trackers; empty dimensions are
//! pruned.

use std::collections::HashMap;

use crate::anomaly::AnomalyTracker;
use crate::condition::ConditionState;
use crate::dimension::MetricDimensionKey;
use crate::field::{Atom, FieldMatcher};
use crate::metrics::{DispatchContext, MetricCore, NumericBucket};
use crate::report::{hash_strings_in_key, DimensionReport, MetricData, MetricReport};

pub struct CountMetricProducer {
    pub core: MetricCore,
    pub dimensions_in_what: Vec<FieldMatcher>,
    current: HashMap<MetricDimensionKey, i64>,
    past: HashMap<MetricDimensionKey, Vec<NumericBucket>>,
    pub anomaly_trackers: Vec<AnomalyTracker>,
}

impl CountMetricProducer {
    pub fn new(
        core: MetricCore,
        dimensions_in_what: Vec<FieldMatcher>,
        anomaly_trackers: Vec<AnomalyTracker>,
    ) -> Self {
        CountMetricProducer {
            core,
            dimensions_in_what,
            current: HashMap::new(),
            past: HashMap::new(),
            anomaly_trackers,
        }
    }

    pub fn on_matched_event(&mut self, atom: &Atom, ctx: DispatchContext<'_>) {
        let event_ns = atom.elapsed_ns();
        if event_ns < self.core.time_base_ns || !self.core.is_active {
            return;
        }
        self.flush_if_needed(event_ns);

        let what_key = self.core.what_key(&self.dimensions_in_what, atom.values());
        if !self.core.passes_sample_check(&what_key) {
            return;
        }
        let (condition, _) = self.core.condition_for_event(ctx.wizard, atom.values());
        if !condition {
            return;
        }
        let (state_values, _) = self.core.state_values_for_event(ctx.states, atom.values());
        let key = MetricDimensionKey::new(what_key, state_values);

        if !self.current.contains_key(&key)
            && self.core.hit_dimension_guardrail(self.current.len())
        {
            return;
        }
        let count = self.current.entry(key.clone()).or_insert(0);
        *count += 1;
        let value = *count;

        for tracker in &mut self.anomaly_trackers {
            tracker.detect_and_declare(
                event_ns,
                self.core.current_bucket_num,
                self.core.metric_id,
                &key,
                value,
            );
        }
    }

    pub fn on_condition_changed(&mut self, condition: bool, timestamp_ns: i64) {
        self.flush_if_needed(timestamp_ns);
        self.core.condition = ConditionState::from_bool(condition);
        self.core
            .condition_timer
            .on_condition_changed(self.core.is_active && condition, timestamp_ns);
    }

    pub fn flush_if_needed(&mut self, event_ns: i64) {
        while self.core.needs_flush(event_ns) {
            let end = self.core.current_bucket_end_ns();
            self.flush_current_bucket(end, end);
            self.core.current_bucket_num += 1;
        }
    }

    /// Close the current bucket at `close_ns`, rebasing on
    /// `next_bucket_start_ns`. Does not advance the bucket number; callers
    /// do when crossing the grid.
    pub fn flush_current_bucket(&mut self, close_ns: i64, next_bucket_start_ns: i64) {
        let start_ns = self.core.current_bucket_start_ns;
        let condition_true_ns = self
            .core
            .condition_timer
            .new_bucket_start(close_ns, next_bucket_start_ns);
        let closed_bucket_num = self.core.current_bucket_num;
        let report_condition = self.core.reports_condition_true_ns();

        let drained: Vec<(MetricDimensionKey, i64)> = self.current.drain().collect();
        for (key, count) in drained {
            if count == 0 {
                continue;
            }
            self.past.entry(key.clone()).or_default().push(NumericBucket {
                start_ns,
                end_ns: close_ns,
                value: count,
                condition_true_ns: report_condition.then_some(condition_true_ns),
            });
            for tracker in &mut self.anomaly_trackers {
                tracker.add_past_bucket(&key, count, closed_bucket_num);
            }
        }

        self.core.stats.note_bucket_count(self.core.metric_id);
        self.core.current_bucket_start_ns = next_bucket_start_ns;
        self.core.has_hit_guardrail = false;
    }

    pub fn dump_report(
        &mut self,
        dump_ns: i64,
        include_current_partial: bool,
        erase_data: bool,
        hash_strings: bool,
    ) -> MetricReport {
        self.flush_if_needed(dump_ns);
        if include_current_partial {
            self.flush_current_bucket(dump_ns, dump_ns);
        }

        let mut entries = Vec::with_capacity(self.past.len());
        for (key, buckets) in &self.past {
            let dimension_key = if hash_strings {
                hash_strings_in_key(key.what())
            } else {
                key.what().clone()
            };
            entries.push(DimensionReport {
                dimension_key,
                state_values: key.state_values().clone(),
                buckets: buckets.iter().map(|b| b.to_report(&self.core)).collect(),
            });
        }

        let report = MetricReport {
            metric_id: self.core.metric_id,
            is_active: self.core.is_active,
            dimension_guardrail_hit: self
                .core
                .stats
                .has_hit_dimension_guardrail(self.core.metric_id),
            time_base_ns: self.core.time_base_ns,
            bucket_size_ns: self.core.bucket_size_ns,
            dimension_path_in_what: dimension_path(&self.dimensions_in_what),
            data: MetricData::Count(entries),
        };
        if erase_data {
            self.past.clear();
        }
        report
    }

    pub fn clear_past_buckets(&mut self, timestamp_ns: i64) {
        self.flush_if_needed(timestamp_ns);
        self.past.clear();
    }

    pub fn byte_size(&self) -> usize {
        self.past
            .values()
            .map(|buckets| buckets.len() * std::mem::size_of::<NumericBucket>())
            .sum()
    }
}

/// Packed dimension paths for the flat report layout.
pub(crate) fn dimension_path(dimensions: &[FieldMatcher]) -> Option<Vec<u32>> {
    if dimensions.is_empty() {
        None
    } else {
        Some(dimensions.iter().map(|m| m.field.path.raw()).collect())
    }
}
