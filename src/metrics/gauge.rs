//! Gauge metric producer.
//!
//! Captures the value of a designated atom, either push-sampled (from the
//! matched atom) or pull-sampled (fetched from an external puller at bucket
//! boundaries and on condition rising edges). Samples are deduplicated per
//! bucket by field fingerprint at flush.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::anomaly::AnomalyTracker;
use crate::condition::ConditionState;
use crate::config::GaugeSamplingType;
use crate::dimension::{filter_gauge_values, AtomKey, DimensionKey, MetricDimensionKey};
use crate::external::AtomPuller;
use crate::field::{Atom, FieldMatcher, FieldValue};
use crate::guardrail::MAX_GAUGE_ATOMS_PER_DIMENSION;
use crate::matcher::{evaluate_matcher, MatchingState};
use crate::metrics::{DispatchContext, MetricCore};
use crate::report::{
    hash_strings_in_key, AggregatedAtom, BucketTime, DimensionReport, GaugeBucketReport,
    MetricData, MetricReport,
};

struct GaugeAtomSample {
    tag: i32,
    values: Vec<FieldValue>,
    timestamp_ns: i64,
}

struct PastGaugeBucket {
    start_ns: i64,
    end_ns: i64,
    atoms: Vec<AggregatedAtom>,
}

pub struct GaugeMetricProducer {
    pub core: MetricCore,
    what_matcher_index: usize,
    trigger_matcher_index: Option<usize>,
    sampling_type: GaugeSamplingType,
    pull_tag: Option<i32>,
    puller: Option<Arc<dyn AtomPuller>>,
    max_pull_delay_ns: i64,
    dimensions_in_what: Vec<FieldMatcher>,
    gauge_fields: Vec<FieldMatcher>,
    atoms_per_dimension_limit: usize,
    /// Armed on a condition rising edge; push-sampled
    /// CONDITION_CHANGE_TO_TRUE captures exactly one sample per edge.
    capture_armed: bool,
    current: HashMap<MetricDimensionKey, Vec<GaugeAtomSample>>,
    past: HashMap<MetricDimensionKey, Vec<PastGaugeBucket>>,
    pub anomaly_trackers: Vec<AnomalyTracker>,
}

impl GaugeMetricProducer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core: MetricCore,
        what_matcher_index: usize,
        trigger_matcher_index: Option<usize>,
        sampling_type: GaugeSamplingType,
        pull_tag: Option<i32>,
        puller: Option<Arc<dyn AtomPuller>>,
        max_pull_delay_ns: i64,
        dimensions_in_what: Vec<FieldMatcher>,
        gauge_fields: Vec<FieldMatcher>,
        atoms_per_dimension_limit: Option<usize>,
        anomaly_trackers: Vec<AnomalyTracker>,
    ) -> Self {
        GaugeMetricProducer {
            core,
            what_matcher_index,
            trigger_matcher_index,
            sampling_type,
            pull_tag,
            puller,
            max_pull_delay_ns,
            dimensions_in_what,
            gauge_fields,
            atoms_per_dimension_limit: atoms_per_dimension_limit
                .unwrap_or(MAX_GAUGE_ATOMS_PER_DIMENSION),
            capture_armed: false,
            current: HashMap::new(),
            past: HashMap::new(),
            anomaly_trackers,
        }
    }

    /// Re-point indices after a config update that preserved this metric.
    pub fn rebind(
        &mut self,
        condition_index: Option<usize>,
        what_matcher_index: usize,
        trigger_matcher_index: Option<usize>,
    ) {
        self.core.condition_index = condition_index;
        self.what_matcher_index = what_matcher_index;
        self.trigger_matcher_index = trigger_matcher_index;
    }

    pub fn is_pulled(&self) -> bool {
        self.pull_tag.is_some()
    }

    pub fn pull_tag(&self) -> Option<i32> {
        self.pull_tag
    }

    /// Pulled RANDOM_ONE_SAMPLE metrics fetch their first sample at install.
    pub fn prepare_first_bucket(&mut self, timestamp_ns: i64, ctx: DispatchContext<'_>) {
        if self.is_pulled()
            && self.sampling_type == GaugeSamplingType::RandomOneSample
            && self.core.is_active
            && self.core.condition.is_true()
        {
            self.pull_now(timestamp_ns, ctx);
        }
    }

    pub fn on_matched_event(&mut self, matcher_index: usize, atom: &Atom, ctx: DispatchContext<'_>) {
        let event_ns = atom.elapsed_ns();
        if event_ns < self.core.time_base_ns || !self.core.is_active {
            return;
        }
        self.flush_if_needed(event_ns);

        if Some(matcher_index) == self.trigger_matcher_index {
            if self.core.condition.is_true() || self.core.condition_sliced {
                self.pull_now(event_ns, ctx);
            }
            return;
        }
        if self.is_pulled() {
            // The subject atom of a pulled gauge only arrives via the puller.
            return;
        }
        self.try_capture(atom, event_ns, ctx, false);
    }

    fn try_capture(
        &mut self,
        atom: &Atom,
        timestamp_ns: i64,
        ctx: DispatchContext<'_>,
        from_pull: bool,
    ) {
        if !self.core.is_active {
            return;
        }
        if self.sampling_type == GaugeSamplingType::ConditionChangeToTrue && !from_pull {
            if !self.capture_armed {
                return;
            }
        } else {
            let (condition, _) = self.core.condition_for_event(ctx.wizard, atom.values());
            if !condition {
                return;
            }
        }

        let what_key = self.core.what_key(&self.dimensions_in_what, atom.values());
        if !self.core.passes_sample_check(&what_key) {
            return;
        }
        let (state_values, _) = self.core.state_values_for_event(ctx.states, atom.values());
        let key = MetricDimensionKey::new(what_key, state_values);

        if !self.current.contains_key(&key) && self.core.hit_dimension_guardrail(self.current.len())
        {
            return;
        }
        let gauge_values = filter_gauge_values(&self.gauge_fields, atom.values());
        let samples = self.current.entry(key.clone()).or_default();
        match self.sampling_type {
            GaugeSamplingType::RandomOneSample => {
                if !samples.is_empty() {
                    return;
                }
            }
            GaugeSamplingType::FirstNSamples => {
                if samples.len() >= self.atoms_per_dimension_limit
                    || samples.iter().any(|s| s.values == gauge_values)
                {
                    return;
                }
            }
            GaugeSamplingType::ConditionChangeToTrue => {
                if samples.len() >= self.atoms_per_dimension_limit {
                    return;
                }
            }
        }

        let anomaly_value = gauge_values.first().map(|fv| fv.value.as_long()).unwrap_or(0);
        samples.push(GaugeAtomSample {
            tag: atom.tag(),
            values: gauge_values,
            timestamp_ns,
        });
        if self.sampling_type == GaugeSamplingType::ConditionChangeToTrue && !from_pull {
            self.capture_armed = false;
        }

        for tracker in &mut self.anomaly_trackers {
            tracker.detect_and_declare(
                timestamp_ns,
                self.core.current_bucket_num,
                self.core.metric_id,
                &key,
                anomaly_value,
            );
        }
    }

    pub fn on_condition_changed(
        &mut self,
        condition: bool,
        timestamp_ns: i64,
        ctx: DispatchContext<'_>,
    ) {
        self.flush_if_needed(timestamp_ns);
        let rising = condition && !self.core.condition.is_true();
        self.core.condition = ConditionState::from_bool(condition);
        self.core
            .condition_timer
            .on_condition_changed(self.core.is_active && condition, timestamp_ns);
        if !self.core.is_active || !rising {
            return;
        }
        self.capture_armed = true;
        if self.is_pulled()
            && matches!(
                self.sampling_type,
                GaugeSamplingType::RandomOneSample | GaugeSamplingType::ConditionChangeToTrue
            )
        {
            self.pull_now(timestamp_ns, ctx);
        }
    }

    pub fn on_sliced_condition_may_change(&mut self, timestamp_ns: i64, _ctx: DispatchContext<'_>) {
        self.flush_if_needed(timestamp_ns);
    }

    /// Synchronous pull; a result slower than the deadline is discarded by
    /// the puller contract.
    fn pull_now(&mut self, timestamp_ns: i64, ctx: DispatchContext<'_>) {
        let Some(tag) = self.pull_tag else {
            return;
        };
        let Some(puller) = self.puller.clone() else {
            warn!(metric = self.core.metric_id, "pulled gauge has no puller");
            return;
        };
        match puller.pull(tag, self.max_pull_delay_ns) {
            Ok(atoms) => self.capture_pulled(&atoms, timestamp_ns, ctx),
            Err(crate::external::PullError::Timeout { .. }) => {
                self.core.stats.note_pull_timeout();
            }
            Err(err) => {
                debug!(metric = self.core.metric_id, %err, "pull failed");
                self.core.stats.note_pull_failure();
            }
        }
    }

    fn capture_pulled(&mut self, atoms: &[Atom], timestamp_ns: i64, ctx: DispatchContext<'_>) {
        for atom in atoms {
            let mut cache = vec![MatchingState::NotComputed; ctx.matchers.len()];
            let mut transformed = vec![None; ctx.matchers.len()];
            evaluate_matcher(
                ctx.matchers,
                self.what_matcher_index,
                atom,
                &mut cache,
                &mut transformed,
            );
            if cache[self.what_matcher_index] != MatchingState::Matched {
                continue;
            }
            match &transformed[self.what_matcher_index] {
                Some(rewritten) => self.try_capture(&rewritten.clone(), timestamp_ns, ctx, true),
                None => self.try_capture(atom, timestamp_ns, ctx, true),
            }
        }
    }

    /// Entry point for pull results delivered by the external receiver
    /// registration. Samples older than the pull delay cap are stale.
    pub fn on_pulled_atoms(&mut self, atoms: &[Atom], timestamp_ns: i64, ctx: DispatchContext<'_>) {
        if !self.is_pulled() {
            return;
        }
        self.flush_if_needed(timestamp_ns);
        let fresh: Vec<Atom> = atoms
            .iter()
            .filter(|atom| {
                let age = timestamp_ns - atom.elapsed_ns();
                if age > self.max_pull_delay_ns {
                    self.core.stats.note_pull_timeout();
                    false
                } else {
                    true
                }
            })
            .cloned()
            .collect();
        self.capture_pulled(&fresh, timestamp_ns, ctx);
    }

    /// Force the current bucket closed; pulled RANDOM_ONE_SAMPLE metrics
    /// immediately refill the new partial bucket.
    pub fn notify_flush_boundary(&mut self, timestamp_ns: i64, ctx: DispatchContext<'_>) {
        self.flush_current_bucket(timestamp_ns, timestamp_ns);
        if self.is_pulled()
            && self.sampling_type == GaugeSamplingType::RandomOneSample
            && self.core.is_active
            && self.core.condition.is_true()
        {
            self.pull_now(timestamp_ns, ctx);
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
        let start_ns = self.core.current_bucket_start_ns;
        let drained: Vec<(MetricDimensionKey, Vec<GaugeAtomSample>)> =
            self.current.drain().collect();
        for (key, samples) in drained {
            if samples.is_empty() {
                continue;
            }
            // Deduplicate by field fingerprint, keeping every timestamp.
            let mut atoms: Vec<AggregatedAtom> = Vec::new();
            for sample in samples {
                let atom_key = AtomKey::new(sample.tag, DimensionKey::new(sample.values));
                match atoms.iter_mut().find(|a| a.atom == atom_key) {
                    Some(existing) => existing.timestamps_ns.push(sample.timestamp_ns),
                    None => atoms.push(AggregatedAtom {
                        atom: atom_key,
                        timestamps_ns: vec![sample.timestamp_ns],
                    }),
                }
            }
            self.past.entry(key).or_default().push(PastGaugeBucket {
                start_ns,
                end_ns: close_ns,
                atoms,
            });
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
                buckets: buckets
                    .iter()
                    .map(|b| GaugeBucketReport {
                        time: if self.core.is_full_bucket(b.start_ns, b.end_ns) {
                            BucketTime::Num(self.core.bucket_num_from_end_ns(b.end_ns))
                        } else {
                            BucketTime::Range {
                                start_ns: b.start_ns,
                                end_ns: b.end_ns,
                            }
                        },
                        atoms: b.atoms.clone(),
                    })
                    .collect(),
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
            data: MetricData::Gauge(entries),
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
            .flatten()
            .map(|bucket| {
                bucket
                    .atoms
                    .iter()
                    .map(|a| {
                        std::mem::size_of::<AggregatedAtom>()
                            + a.timestamps_ns.len() * std::mem::size_of::<i64>()
                    })
                    .sum::<usize>()
            })
            .sum()
    }
}
