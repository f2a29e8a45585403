//! Duration metric producer.
//!
//! Measures how long a start/stop predicate holds per dimension, under an
//! optional (possibly sliced) condition. SUM aggregation ors overlapping
//! starts; MAX_SPARSE keeps the longest completed run per bucket.

use std::collections::HashMap;

use tracing::debug;

use crate::anomaly::AnomalyTracker;
use crate::condition::{ConditionKey, ConditionState};
use crate::config::{DurationAggregation, UploadThreshold};
use crate::dimension::{
    dimension_for_condition, contains_linked_state_values, filter_values, DimensionKey,
    MetricDimensionKey,
};
use crate::field::{Atom, FieldMatcher, FieldValue};
use crate::metrics::max_tracker::MaxDurationTracker;
use crate::metrics::oring_tracker::OringDurationTracker;
use crate::metrics::{DispatchContext, MetricCore, NumericBucket};
use crate::report::{hash_strings_in_key, DimensionReport, MetricData, MetricReport};
use crate::state::map_state_value;

enum DurationTracker {
    Oring(OringDurationTracker),
    Max(MaxDurationTracker),
}

impl DurationTracker {
    #[allow(clippy::too_many_arguments)]
    fn flush_current_bucket(
        &mut self,
        close_ns: i64,
        next_bucket_start_ns: i64,
        threshold: Option<UploadThreshold>,
        global_condition_true_ns: Option<i64>,
        core: &MetricCore,
        anomaly: &mut [AnomalyTracker],
        past: &mut HashMap<MetricDimensionKey, Vec<NumericBucket>>,
    ) -> bool {
        match self {
            DurationTracker::Oring(t) => t.flush_current_bucket(
                close_ns,
                next_bucket_start_ns,
                threshold,
                global_condition_true_ns,
                core,
                anomaly,
                past,
            ),
            DurationTracker::Max(t) => t.flush_current_bucket(
                close_ns,
                next_bucket_start_ns,
                threshold,
                global_condition_true_ns,
                core,
                anomaly,
                past,
            ),
        }
    }

    fn has_accumulated_duration(&self) -> bool {
        match self {
            DurationTracker::Oring(t) => t.has_accumulated_duration(),
            DurationTracker::Max(t) => t.has_accumulated_duration(),
        }
    }
}

pub struct DurationMetricProducer {
    pub core: MetricCore,
    aggregation: DurationAggregation,
    start_index: usize,
    stop_index: Option<usize>,
    stop_all_index: Option<usize>,
    nested: bool,
    dimensions_in_what: Vec<FieldMatcher>,
    /// Dimensions of the underlying predicate; the keys starts and stops are
    /// matched under. `dimensions_in_what` must be a subset.
    internal_dimensions: Vec<FieldMatcher>,
    use_what_as_internal: bool,
    threshold: Option<UploadThreshold>,
    /// Value of the unsliced part of a combination condition, kept for the
    /// sliced-change fast path.
    unsliced_part_condition: ConditionState,
    trackers: HashMap<DimensionKey, DurationTracker>,
    past: HashMap<MetricDimensionKey, Vec<NumericBucket>>,
    pub anomaly_trackers: Vec<AnomalyTracker>,
}

impl DurationMetricProducer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core: MetricCore,
        aggregation: DurationAggregation,
        start_index: usize,
        stop_index: Option<usize>,
        stop_all_index: Option<usize>,
        nested: bool,
        dimensions_in_what: Vec<FieldMatcher>,
        internal_dimensions: Vec<FieldMatcher>,
        threshold: Option<UploadThreshold>,
        anomaly_trackers: Vec<AnomalyTracker>,
    ) -> Self {
        let use_what_as_internal = dimensions_in_what == internal_dimensions;
        DurationMetricProducer {
            core,
            aggregation,
            start_index,
            stop_index,
            stop_all_index,
            nested,
            dimensions_in_what,
            internal_dimensions,
            use_what_as_internal,
            threshold,
            unsliced_part_condition: ConditionState::Unknown,
            trackers: HashMap::new(),
            past: HashMap::new(),
            anomaly_trackers,
        }
    }

    /// Re-point indices after a config update that preserved this metric.
    pub fn rebind(
        &mut self,
        condition_index: Option<usize>,
        start_index: usize,
        stop_index: Option<usize>,
        stop_all_index: Option<usize>,
    ) {
        self.core.condition_index = condition_index;
        self.start_index = start_index;
        self.stop_index = stop_index;
        self.stop_all_index = stop_all_index;
    }

    /// Replay live dimensions of the underlying predicate as start events,
    /// used when a preserved predicate carries state across a config update.
    pub fn seed_live_starts(
        &mut self,
        sliced_map: &HashMap<DimensionKey, u32>,
        timestamp_ns: i64,
        ctx: DispatchContext<'_>,
    ) {
        for (internal_key, count) in sliced_map {
            for _ in 0..*count {
                self.handle_matched_values(self.start_index, internal_key.values().to_vec(), timestamp_ns, ctx);
            }
        }
    }

    pub fn on_matched_event(&mut self, matcher_index: usize, atom: &Atom, ctx: DispatchContext<'_>) {
        self.handle_matched_values(matcher_index, atom.values().to_vec(), atom.elapsed_ns(), ctx);
    }

    fn handle_matched_values(
        &mut self,
        matcher_index: usize,
        values: Vec<FieldValue>,
        event_ns: i64,
        ctx: DispatchContext<'_>,
    ) {
        if event_ns < self.core.time_base_ns {
            return;
        }
        if self.core.is_active {
            self.flush_if_needed(event_ns);
        }

        // Stop-all forces every refcount to zero at the event timestamp.
        if Some(matcher_index) == self.stop_all_index {
            let Self {
                core,
                trackers,
                anomaly_trackers,
                ..
            } = self;
            trackers.retain(|_, tracker| {
                match tracker {
                    DurationTracker::Oring(t) => t.note_stop_all(event_ns, core, anomaly_trackers),
                    DurationTracker::Max(t) => t.note_stop_all(event_ns),
                }
                tracker.has_accumulated_duration()
            });
            return;
        }

        let what_key = self.core.what_key(&self.dimensions_in_what, &values);
        if !self.core.passes_sample_check(&what_key) {
            return;
        }

        let internal_key = if self.use_what_as_internal {
            what_key.clone()
        } else if self.internal_dimensions.is_empty() {
            DimensionKey::empty()
        } else {
            match filter_values(&self.internal_dimensions, &values) {
                Some(key) => key,
                None => DimensionKey::empty(),
            }
        };

        if Some(matcher_index) == self.stop_index {
            let Self {
                core,
                trackers,
                anomaly_trackers,
                ..
            } = self;
            let mut prune = false;
            if let Some(tracker) = trackers.get_mut(&what_key) {
                match tracker {
                    DurationTracker::Oring(t) => {
                        t.note_stop(&internal_key, event_ns, false, core, anomaly_trackers)
                    }
                    DurationTracker::Max(t) => t.note_stop(&internal_key, event_ns, false),
                }
                prune = !tracker.has_accumulated_duration();
            }
            if prune {
                trackers.remove(&what_key);
            }
            return;
        }

        if matcher_index != self.start_index {
            return;
        }

        let (condition, condition_key) = self.core.condition_for_event(ctx.wizard, &values);
        let condition = condition && self.core.is_active;
        let (state_values, _) = self.core.state_values_for_event(ctx.states, &values);

        if !self.trackers.contains_key(&what_key) {
            if self.core.hit_dimension_guardrail(self.trackers.len()) {
                return;
            }
            let tracker = match self.aggregation {
                DurationAggregation::Sum => DurationTracker::Oring(OringDurationTracker::new(
                    what_key.clone(),
                    state_values.clone(),
                    self.nested,
                    self.core.condition_sliced,
                )),
                DurationAggregation::MaxSparse => DurationTracker::Max(MaxDurationTracker::new(
                    what_key.clone(),
                    self.nested,
                    self.core.condition_sliced,
                )),
            };
            self.trackers.insert(what_key.clone(), tracker);
        }

        let Self {
            core,
            trackers,
            anomaly_trackers,
            ..
        } = self;
        if let Some(tracker) = trackers.get_mut(&what_key) {
            match tracker {
                DurationTracker::Oring(t) => t.note_start(
                    internal_key,
                    condition,
                    event_ns,
                    condition_key,
                    core,
                    anomaly_trackers,
                ),
                DurationTracker::Max(t) => {
                    t.note_start(internal_key, condition, event_ns, condition_key)
                }
            }
        }
    }

    pub fn on_condition_changed(&mut self, condition: bool, timestamp_ns: i64) {
        self.core.condition = ConditionState::from_bool(condition);
        if !self.core.is_active {
            return;
        }
        self.flush_if_needed(timestamp_ns);

        let Self {
            core,
            trackers,
            anomaly_trackers,
            ..
        } = self;
        for tracker in trackers.values_mut() {
            match tracker {
                DurationTracker::Oring(t) => {
                    t.on_condition_changed(condition, timestamp_ns, core, anomaly_trackers)
                }
                DurationTracker::Max(t) => t.on_condition_changed(condition, timestamp_ns),
            }
        }
        core.condition_timer.on_condition_changed(condition, timestamp_ns);
    }

    pub fn on_sliced_condition_may_change(&mut self, timestamp_ns: i64, ctx: DispatchContext<'_>) {
        if !self.core.is_active {
            return;
        }
        self.flush_if_needed(timestamp_ns);
        if !self.core.condition_sliced {
            return;
        }
        let Some(condition_index) = self.core.condition_index else {
            return;
        };

        if ctx.wizard.is_changed_dimension_trackable(condition_index)
            && self.core.links_all_condition_dimensions
            && self.core.links.len() == 1
        {
            self.sliced_change_fast_path(timestamp_ns, ctx, condition_index);
            return;
        }

        // Slow path: re-query the condition for every live duration.
        let partial = !self.core.links_all_condition_dimensions;
        let wizard = ctx.wizard;
        let query = move |ck: &ConditionKey| wizard.query(condition_index, ck, partial);
        let Self {
            core,
            trackers,
            anomaly_trackers,
            ..
        } = self;
        for tracker in trackers.values_mut() {
            match tracker {
                DurationTracker::Oring(t) => {
                    t.on_sliced_condition_may_change(timestamp_ns, &query, core, anomaly_trackers)
                }
                DurationTracker::Max(t) => t.on_sliced_condition_may_change(timestamp_ns, &query),
            }
        }
    }

    /// Inspect only the dimensions the condition tracker reports as changed
    /// instead of re-querying each live duration. Requires a single link
    /// covering all of the sliced condition's dimensions.
    fn sliced_change_fast_path(
        &mut self,
        timestamp_ns: i64,
        ctx: DispatchContext<'_>,
        condition_index: usize,
    ) {
        let mut unsliced_ok = true;
        if !ctx.wizard.is_simple(condition_index) {
            let unsliced = ctx.wizard.unsliced_part_state(condition_index);
            if self.unsliced_part_condition == ConditionState::False
                && unsliced == ConditionState::False
            {
                return;
            }
            self.unsliced_part_condition = unsliced;
            unsliced_ok = unsliced.is_true();
        }

        let changed_true = ctx.wizard.changed_to_true_dimensions(condition_index);
        let changed_false = ctx.wizard.changed_to_false_dimensions(condition_index);
        let no_sliced_changes = changed_true.map_or(true, |s| s.is_empty())
            && changed_false.map_or(true, |s| s.is_empty());

        let link = self.core.links[0].clone();
        if no_sliced_changes {
            // The flip came from the unsliced predicates; apply it to every
            // duration whose linked dimension is live in the sliced child.
            let Some(sliced_map) = ctx.wizard.sliced_dimension_map(condition_index) else {
                return;
            };
            let Self {
                core,
                trackers,
                anomaly_trackers,
                ..
            } = self;
            for (what_key, tracker) in trackers.iter_mut() {
                let linked = dimension_for_condition(what_key.values(), &link);
                if sliced_map.get(&linked).copied().unwrap_or(0) == 0 {
                    continue;
                }
                match tracker {
                    DurationTracker::Oring(t) => {
                        t.on_condition_changed(unsliced_ok, timestamp_ns, core, anomaly_trackers)
                    }
                    DurationTracker::Max(t) => t.on_condition_changed(unsliced_ok, timestamp_ns),
                }
            }
        } else if unsliced_ok {
            let Self {
                core,
                trackers,
                anomaly_trackers,
                ..
            } = self;
            for (what_key, tracker) in trackers.iter_mut() {
                let linked = dimension_for_condition(what_key.values(), &link);
                let flip = if changed_true.is_some_and(|s| s.contains(&linked)) {
                    Some(true)
                } else if changed_false.is_some_and(|s| s.contains(&linked)) {
                    Some(false)
                } else {
                    None
                };
                if let Some(condition) = flip {
                    match tracker {
                        DurationTracker::Oring(t) => {
                            t.on_condition_changed(condition, timestamp_ns, core, anomaly_trackers)
                        }
                        DurationTracker::Max(t) => t.on_condition_changed(condition, timestamp_ns),
                    }
                }
            }
        }
    }

    pub fn on_active_state_changed(&mut self, active: bool, timestamp_ns: i64) {
        if self.core.condition_sliced {
            // Without an event there is nothing to re-query; pausing (or
            // resuming) every live duration mirrors the activation edge.
            let Self {
                core,
                trackers,
                anomaly_trackers,
                ..
            } = self;
            for tracker in trackers.values_mut() {
                match tracker {
                    DurationTracker::Oring(t) => {
                        t.on_condition_changed(active, timestamp_ns, core, anomaly_trackers)
                    }
                    DurationTracker::Max(t) => t.on_condition_changed(active, timestamp_ns),
                }
            }
            return;
        }
        if self.core.condition != ConditionState::True {
            return;
        }
        if active {
            self.flush_if_needed(timestamp_ns);
        }
        let Self {
            core,
            trackers,
            anomaly_trackers,
            ..
        } = self;
        for tracker in trackers.values_mut() {
            match tracker {
                DurationTracker::Oring(t) => {
                    t.on_condition_changed(active, timestamp_ns, core, anomaly_trackers)
                }
                DurationTracker::Max(t) => t.on_condition_changed(active, timestamp_ns),
            }
        }
        core.condition_timer.on_condition_changed(active, timestamp_ns);
    }

    pub fn on_state_changed(
        &mut self,
        timestamp_ns: i64,
        atom_id: i32,
        primary_key: &DimensionKey,
        new_value: &FieldValue,
    ) {
        let Some(position) = self
            .core
            .sliced_state_atoms
            .iter()
            .position(|a| *a == atom_id)
        else {
            return;
        };
        let mut value = new_value.clone();
        map_state_value(self.core.state_group_maps.get(&atom_id), &mut value);

        self.flush_if_needed(timestamp_ns);

        for (what_key, tracker) in self.trackers.iter_mut() {
            if !contains_linked_state_values(
                what_key,
                primary_key,
                &self.core.state_links,
                atom_id,
            ) {
                continue;
            }
            match tracker {
                DurationTracker::Oring(t) => {
                    let mut values = t.current_state_key().values().to_vec();
                    if position < values.len() {
                        values[position] = value.clone();
                    } else {
                        values.push(value.clone());
                    }
                    t.on_state_changed(timestamp_ns, DimensionKey::new(values));
                }
                DurationTracker::Max(t) => t.on_state_changed(timestamp_ns),
            }
        }
    }

    pub fn flush_if_needed(&mut self, event_ns: i64) {
        while self.core.needs_flush(event_ns) {
            let end = self.core.current_bucket_end_ns();
            self.flush_current_bucket(end, end);
            self.core.current_bucket_num += 1;
        }
    }

    pub fn flush_current_bucket(&mut self, close_ns: i64, next_bucket_start_ns: i64) {
        let global_condition_true = self
            .core
            .condition_timer
            .new_bucket_start(close_ns, next_bucket_start_ns);
        let report_condition = self
            .core
            .reports_condition_true_ns()
            .then_some(global_condition_true);

        let Self {
            core,
            trackers,
            anomaly_trackers,
            past,
            threshold,
            ..
        } = self;
        trackers.retain(|key, tracker| {
            let empty = tracker.flush_current_bucket(
                close_ns,
                next_bucket_start_ns,
                *threshold,
                report_condition,
                core,
                anomaly_trackers,
                past,
            );
            if empty {
                debug!(metric = core.metric_id, ?key, "dropping idle duration dimension");
            }
            !empty
        });

        core.stats.note_bucket_count(core.metric_id);
        core.current_bucket_start_ns = next_bucket_start_ns;
        core.has_hit_guardrail = false;
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
            dimension_path_in_what: super::count::dimension_path(&self.dimensions_in_what),
            data: MetricData::Duration(entries),
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

    /// Number of live duration dimensions, exposed for tests.
    pub fn live_dimension_count(&self) -> usize {
        self.trackers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionWizard;
    use crate::guardrail::EngineStats;
    use crate::metrics::{ActivationMap, ConditionTimer};
    use crate::report::BucketTime;
    use crate::state::StateManager;
    use std::sync::Arc;

    const SEC: i64 = 1_000_000_000;
    const TAG: i32 = 10;
    const START: usize = 0;
    const STOP: usize = 1;
    const STOP_ALL: usize = 2;

    fn test_core(bucket_secs: i64, with_condition: bool) -> MetricCore {
        MetricCore {
            metric_id: 100,
            config_id: 1,
            time_base_ns: 0,
            bucket_size_ns: bucket_secs * SEC,
            current_bucket_start_ns: 0,
            current_bucket_num: 0,
            condition: if with_condition {
                ConditionState::False
            } else {
                ConditionState::True
            },
            condition_sliced: false,
            condition_index: with_condition.then_some(0),
            links: vec![],
            links_all_condition_dimensions: false,
            state_links: vec![],
            sliced_state_atoms: vec![],
            state_group_maps: Default::default(),
            sampler: None,
            dimension_soft_limit: 500,
            dimension_hard_limit: 800,
            has_hit_guardrail: false,
            condition_timer: ConditionTimer::new(0, false),
            activations: ActivationMap::default(),
            is_active: true,
            stats: Arc::new(EngineStats::new()),
        }
    }

    fn producer(aggregation: DurationAggregation, bucket_secs: i64) -> DurationMetricProducer {
        DurationMetricProducer::new(
            test_core(bucket_secs, false),
            aggregation,
            START,
            Some(STOP),
            Some(STOP_ALL),
            false,
            vec![],
            vec![],
            None,
            vec![],
        )
    }

    fn atom(ts: i64) -> Atom {
        Atom::new(TAG, 1000, ts, vec![])
    }

    fn send(p: &mut DurationMetricProducer, matcher: usize, ts: i64) {
        let trackers = vec![];
        let states = StateManager::new();
        let matchers = vec![];
        let ctx = DispatchContext {
            wizard: ConditionWizard::new(&trackers),
            states: &states,
            matchers: &matchers,
        };
        p.on_matched_event(matcher, &atom(ts), ctx);
    }

    fn dump(p: &mut DurationMetricProducer, ts: i64) -> Vec<DimensionReport<crate::report::ValueBucket>> {
        let report = p.dump_report(ts, false, true, false);
        match report.data {
            MetricData::Duration(entries) => entries,
            other => panic!("expected duration data, got {other:?}"),
        }
    }

    #[test]
    fn test_sum_one_bucket() {
        let mut p = producer(DurationAggregation::Sum, 60);
        send(&mut p, START, 10 * SEC);
        send(&mut p, STOP, 40 * SEC);

        let entries = dump(&mut p, 120 * SEC);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].buckets.len(), 1);
        assert_eq!(entries[0].buckets[0].value, 30 * SEC);
        assert_eq!(entries[0].buckets[0].time, BucketTime::Num(0));
    }

    #[test]
    fn test_sum_straddling_rollover_splits() {
        let mut p = producer(DurationAggregation::Sum, 60);
        send(&mut p, START, 50 * SEC);
        send(&mut p, STOP, 75 * SEC);

        let entries = dump(&mut p, 120 * SEC);
        let buckets = &entries[0].buckets;
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].value, 10 * SEC);
        assert_eq!(buckets[1].value, 15 * SEC);
    }

    #[test]
    fn test_max_sparse_across_buckets() {
        let mut p = producer(DurationAggregation::MaxSparse, 60);
        send(&mut p, START, 50 * SEC);
        send(&mut p, STOP, 75 * SEC);

        let entries = dump(&mut p, 120 * SEC);
        let buckets = &entries[0].buckets;
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].value, 10 * SEC);
        assert_eq!(buckets[0].time, BucketTime::Num(0));
        assert_eq!(buckets[1].value, 15 * SEC);
        assert_eq!(buckets[1].time, BucketTime::Num(1));
    }

    #[test]
    fn test_stop_all_releases_everything() {
        let mut p = producer(DurationAggregation::Sum, 60);
        send(&mut p, START, 10 * SEC);
        send(&mut p, STOP_ALL, 30 * SEC);

        let entries = dump(&mut p, 120 * SEC);
        assert_eq!(entries[0].buckets[0].value, 20 * SEC);
    }

    #[test]
    fn test_unsliced_condition_gates_duration() {
        let mut p = producer(DurationAggregation::Sum, 60);
        p.core.condition = ConditionState::False;
        // Start arrives while the condition is false: paused.
        send(&mut p, START, 0);
        p.on_condition_changed(true, 20 * SEC);
        p.on_condition_changed(false, 30 * SEC);
        send(&mut p, STOP, 50 * SEC);

        let entries = dump(&mut p, 120 * SEC);
        assert_eq!(entries[0].buckets[0].value, 10 * SEC);
    }

    #[test]
    fn test_condition_true_ns_reported_with_condition() {
        let mut p = DurationMetricProducer::new(
            test_core(60, true),
            DurationAggregation::Sum,
            START,
            Some(STOP),
            None,
            false,
            vec![],
            vec![],
            None,
            vec![],
        );
        p.on_condition_changed(true, 10 * SEC);
        send(&mut p, START, 10 * SEC);
        send(&mut p, STOP, 40 * SEC);
        p.on_condition_changed(false, 40 * SEC);

        let entries = dump(&mut p, 120 * SEC);
        assert_eq!(entries[0].buckets[0].value, 30 * SEC);
        assert_eq!(entries[0].buckets[0].condition_true_ns, Some(30 * SEC));
    }

    #[test]
    fn test_zero_duration_no_bucket() {
        let mut p = producer(DurationAggregation::Sum, 60);
        send(&mut p, START, 10 * SEC);
        send(&mut p, STOP, 10 * SEC);
        let entries = dump(&mut p, 120 * SEC);
        assert!(entries.is_empty());
    }

    #[test]
    fn test_idle_dimension_pruned_after_flush() {
        let mut p = producer(DurationAggregation::Sum, 60);
        send(&mut p, START, 10 * SEC);
        send(&mut p, STOP, 20 * SEC);
        assert_eq!(p.live_dimension_count(), 1);
        p.flush_if_needed(70 * SEC);
        assert_eq!(p.live_dimension_count(), 0);
    }

    #[test]
    fn test_event_before_time_base_discarded() {
        let mut p = producer(DurationAggregation::Sum, 60);
        p.core.time_base_ns = 100 * SEC;
        p.core.current_bucket_start_ns = 100 * SEC;
        send(&mut p, START, 50 * SEC);
        assert_eq!(p.live_dimension_count(), 0);
    }
}
