//! Metric producers.
//!
//! Each metric in a configuration compiles into one producer holding its
//! bucket state. Producers form a tagged sum dispatched by the metrics
//! manager; the shared plumbing (bucket arithmetic, condition linkage, state
//! slicing, activations, guardrails) lives in [`MetricCore`].

pub mod count;
pub mod duration;
pub mod event;
pub mod gauge;
pub mod init;
pub mod manager;
pub mod max_tracker;
pub mod oring_tracker;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::condition::{ConditionKey, ConditionState, ConditionWizard};
use crate::dimension::sampler::DimensionSampler;
use crate::dimension::{
    dimension_for_condition, dimension_for_state, filter_values, DimensionKey,
    MetricConditionLink, MetricStateLink,
};
use crate::field::{FieldMatcher, FieldValue};
use crate::guardrail::EngineStats;
use crate::matcher::AtomMatcher;
use crate::report::MetricReport;
use crate::state::{map_state_value, StateManager};

pub use count::CountMetricProducer;
pub use duration::DurationMetricProducer;
pub use event::EventMetricProducer;
pub use gauge::GaugeMetricProducer;

/// Read-only collaborators handed to producers during dispatch.
#[derive(Clone, Copy)]
pub struct DispatchContext<'a> {
    pub wizard: ConditionWizard<'a>,
    pub states: &'a StateManager,
    pub matchers: &'a [AtomMatcher],
}

/// Accumulates how long a producer's condition has been true within the
/// current bucket, for the condition_true_ns report field.
#[derive(Debug, Clone, Copy)]
pub struct ConditionTimer {
    condition: bool,
    last_change_ns: i64,
    accumulated_ns: i64,
}

impl ConditionTimer {
    pub fn new(bucket_start_ns: i64, condition: bool) -> Self {
        ConditionTimer {
            condition,
            last_change_ns: bucket_start_ns,
            accumulated_ns: 0,
        }
    }

    pub fn on_condition_changed(&mut self, condition: bool, timestamp_ns: i64) {
        if condition == self.condition {
            return;
        }
        if self.condition {
            self.accumulated_ns += timestamp_ns - self.last_change_ns;
        }
        self.condition = condition;
        self.last_change_ns = timestamp_ns;
    }

    /// Close the current bucket at `event_ns` and rebase on
    /// `next_bucket_start_ns`. Returns the true-time within the closed
    /// bucket.
    pub fn new_bucket_start(&mut self, event_ns: i64, next_bucket_start_ns: i64) -> i64 {
        if self.condition {
            self.accumulated_ns += event_ns - self.last_change_ns;
        }
        self.last_change_ns = next_bucket_start_ns;
        std::mem::take(&mut self.accumulated_ns)
    }
}

/// One event-driven activation window of a metric.
#[derive(Debug, Clone, Copy)]
pub struct Activation {
    pub ttl_ns: i64,
    pub active_until_ns: Option<i64>,
}

/// Activation bookkeeping: a metric with activations is inactive until one
/// of its activation matchers fires, and stays active for that activation's
/// TTL unless a deactivation matcher cancels it.
#[derive(Debug, Default)]
pub struct ActivationMap {
    /// Activation matcher index → activation.
    activations: HashMap<usize, Activation>,
    /// Deactivation matcher index → activation matcher indices it cancels.
    cancellations: HashMap<usize, Vec<usize>>,
}

impl ActivationMap {
    pub fn add_activation(&mut self, matcher_index: usize, ttl_ns: i64) {
        self.activations.insert(
            matcher_index,
            Activation {
                ttl_ns,
                active_until_ns: None,
            },
        );
    }

    pub fn add_cancellation(&mut self, deactivation_index: usize, activation_index: usize) {
        self.cancellations
            .entry(deactivation_index)
            .or_default()
            .push(activation_index);
    }

    pub fn has_activations(&self) -> bool {
        !self.activations.is_empty()
    }

    pub fn activation_matcher_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.activations.keys().copied()
    }

    pub fn deactivation_matcher_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.cancellations.keys().copied()
    }

    pub fn activate(&mut self, matcher_index: usize, now_ns: i64) {
        if let Some(activation) = self.activations.get_mut(&matcher_index) {
            activation.active_until_ns = Some(now_ns + activation.ttl_ns);
        }
    }

    pub fn cancel(&mut self, deactivation_index: usize) {
        if let Some(targets) = self.cancellations.get(&deactivation_index) {
            for target in targets {
                if let Some(activation) = self.activations.get_mut(target) {
                    activation.active_until_ns = None;
                }
            }
        }
    }

    /// Expire overdue activations; returns whether the metric is active now.
    pub fn flush_if_expire(&mut self, now_ns: i64) -> bool {
        if self.activations.is_empty() {
            return true;
        }
        let mut active = false;
        for activation in self.activations.values_mut() {
            if let Some(until) = activation.active_until_ns {
                if until <= now_ns {
                    activation.active_until_ns = None;
                } else {
                    active = true;
                }
            }
        }
        active
    }

    pub fn is_active(&self) -> bool {
        self.activations.is_empty()
            || self
                .activations
                .values()
                .any(|a| a.active_until_ns.is_some())
    }

    /// Remaining TTLs for persisting, keyed by activation matcher index.
    pub fn snapshot(&self, now_ns: i64) -> Vec<(usize, i64)> {
        self.activations
            .iter()
            .filter_map(|(idx, a)| {
                a.active_until_ns
                    .filter(|until| *until > now_ns)
                    .map(|until| (*idx, until - now_ns))
            })
            .collect()
    }

    pub fn load(&mut self, entries: &[(usize, i64)], now_ns: i64) {
        for (idx, remaining) in entries {
            if let Some(activation) = self.activations.get_mut(idx) {
                activation.active_until_ns = Some(now_ns + remaining);
            }
        }
    }
}

/// State shared by all four producer kinds.
pub struct MetricCore {
    pub metric_id: i64,
    pub config_id: i64,
    pub time_base_ns: i64,
    pub bucket_size_ns: i64,
    pub current_bucket_start_ns: i64,
    pub current_bucket_num: i64,

    pub condition: ConditionState,
    pub condition_sliced: bool,
    pub condition_index: Option<usize>,
    pub links: Vec<MetricConditionLink>,
    /// True when a single link fully constrains the condition's dimensions,
    /// enabling exact sliced lookups and the changed-dimension fast path.
    pub links_all_condition_dimensions: bool,

    pub state_links: Vec<MetricStateLink>,
    pub sliced_state_atoms: Vec<i32>,
    pub state_group_maps: HashMap<i32, HashMap<i64, i64>>,

    pub sampler: Option<DimensionSampler>,
    pub dimension_soft_limit: usize,
    pub dimension_hard_limit: usize,
    pub has_hit_guardrail: bool,

    pub condition_timer: ConditionTimer,
    pub activations: ActivationMap,
    pub is_active: bool,

    pub stats: Arc<EngineStats>,
}

impl MetricCore {
    /// End of the current bucket on the regular grid.
    pub fn current_bucket_end_ns(&self) -> i64 {
        self.time_base_ns + (self.current_bucket_num + 1) * self.bucket_size_ns
    }

    /// Bucket number of a closed bucket identified by its end time.
    pub fn bucket_num_from_end_ns(&self, end_ns: i64) -> i64 {
        (end_ns - self.time_base_ns) / self.bucket_size_ns - 1
    }

    /// Whether the bucket boundary has been crossed. An event exactly on the
    /// boundary belongs to the new bucket.
    pub fn needs_flush(&self, event_ns: i64) -> bool {
        event_ns >= self.current_bucket_end_ns()
    }

    /// Reports whether the closed bucket `[start, end)` spans the full
    /// bucket size, i.e. is not partial.
    pub fn is_full_bucket(&self, start_ns: i64, end_ns: i64) -> bool {
        end_ns - start_ns == self.bucket_size_ns
    }

    /// Whether the event passes dimensional sampling for its would-be key.
    pub fn passes_sample_check(&self, what_key: &DimensionKey) -> bool {
        match &self.sampler {
            Some(sampler) => sampler.admits(what_key),
            None => true,
        }
    }

    /// Dimension-cap guardrail for a first-seen key. Soft crossings are
    /// reported; hard crossings drop the key and flag the report.
    pub fn hit_dimension_guardrail(&mut self, current_dimension_count: usize) -> bool {
        if current_dimension_count < self.dimension_soft_limit {
            return false;
        }
        let new_count = current_dimension_count + 1;
        self.stats
            .note_metric_dimension_size(self.metric_id, new_count);
        if new_count > self.dimension_hard_limit {
            if !self.has_hit_guardrail {
                warn!(
                    metric = self.metric_id,
                    "dimension hard limit reached, dropping new keys"
                );
                self.has_hit_guardrail = true;
            }
            self.stats.note_hard_dimension_limit_reached(self.metric_id);
            return true;
        }
        false
    }

    /// Build the condition key for a sliced condition from the metric links
    /// and query it. For unsliced conditions, uses the pushed-down state.
    pub fn condition_for_event(
        &self,
        wizard: ConditionWizard<'_>,
        event_values: &[FieldValue],
    ) -> (bool, ConditionKey) {
        if self.condition_sliced {
            let mut condition_key = ConditionKey::new();
            for link in &self.links {
                condition_key.insert(link.condition_id, dimension_for_condition(event_values, link));
            }
            let state = match self.condition_index {
                Some(index) => {
                    wizard.query(index, &condition_key, !self.links_all_condition_dimensions)
                }
                None => ConditionState::Unknown,
            };
            (state.is_true(), condition_key)
        } else {
            // Unknown deliberately counts as false here: before the first
            // condition evaluation nothing accumulates, matching the
            // original engine.
            (self.condition.is_true(), ConditionKey::new())
        }
    }

    /// Resolve the current slicing-state values for an event, in the
    /// declared state order, plus the per-state primary keys used.
    pub fn state_values_for_event(
        &self,
        states: &StateManager,
        event_values: &[FieldValue],
    ) -> (DimensionKey, HashMap<i32, DimensionKey>) {
        let mut primary_keys: HashMap<i32, DimensionKey> = HashMap::new();
        for link in &self.state_links {
            primary_keys.insert(link.state_atom_id, dimension_for_state(event_values, link));
        }
        let mut state_values = DimensionKey::empty();
        for atom_id in &self.sliced_state_atoms {
            let primary = primary_keys
                .get(atom_id)
                .cloned()
                .unwrap_or_else(DimensionKey::empty);
            if let Some(mut value) = states.query(*atom_id, &primary) {
                map_state_value(self.state_group_maps.get(atom_id), &mut value);
                state_values.push(value);
            }
        }
        (state_values, primary_keys)
    }

    /// The what-dimension of an event under this metric's dimension fields.
    pub fn what_key(
        &self,
        dimensions_in_what: &[FieldMatcher],
        event_values: &[FieldValue],
    ) -> DimensionKey {
        if dimensions_in_what.is_empty() {
            return DimensionKey::empty();
        }
        filter_values(dimensions_in_what, event_values).unwrap_or_else(DimensionKey::empty)
    }

    /// Whether condition_true_ns is reported: the metric has an unsliced
    /// condition and no state slicing.
    pub fn reports_condition_true_ns(&self) -> bool {
        self.condition_index.is_some() && !self.condition_sliced && self.sliced_state_atoms.is_empty()
    }
}

/// A closed numeric bucket (count or duration) awaiting report dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumericBucket {
    pub start_ns: i64,
    pub end_ns: i64,
    pub value: i64,
    pub condition_true_ns: Option<i64>,
}

impl NumericBucket {
    pub fn to_report(self, core: &MetricCore) -> crate::report::ValueBucket {
        let time = if core.is_full_bucket(self.start_ns, self.end_ns) {
            crate::report::BucketTime::Num(core.bucket_num_from_end_ns(self.end_ns))
        } else {
            crate::report::BucketTime::Range {
                start_ns: self.start_ns,
                end_ns: self.end_ns,
            }
        };
        crate::report::ValueBucket {
            time,
            value: self.value,
            condition_true_ns: self.condition_true_ns,
        }
    }
}

/// The producer family. Dispatch is by tag; producers never reference each
/// other or the manager.
pub enum MetricProducer {
    Count(CountMetricProducer),
    Duration(DurationMetricProducer),
    Event(EventMetricProducer),
    Gauge(GaugeMetricProducer),
}

impl MetricProducer {
    pub fn core(&self) -> &MetricCore {
        match self {
            MetricProducer::Count(p) => &p.core,
            MetricProducer::Duration(p) => &p.core,
            MetricProducer::Event(p) => &p.core,
            MetricProducer::Gauge(p) => &p.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut MetricCore {
        match self {
            MetricProducer::Count(p) => &mut p.core,
            MetricProducer::Duration(p) => &mut p.core,
            MetricProducer::Event(p) => &mut p.core,
            MetricProducer::Gauge(p) => &mut p.core,
        }
    }

    pub fn metric_id(&self) -> i64 {
        self.core().metric_id
    }

    pub fn is_active(&self) -> bool {
        self.core().is_active
    }

    pub fn is_condition_sliced(&self) -> bool {
        self.core().condition_sliced
    }

    /// A matched atom reached this metric through `matcher_index`.
    pub fn on_matched_event(
        &mut self,
        matcher_index: usize,
        atom: &crate::field::Atom,
        ctx: DispatchContext<'_>,
    ) {
        match self {
            MetricProducer::Count(p) => p.on_matched_event(atom, ctx),
            MetricProducer::Duration(p) => p.on_matched_event(matcher_index, atom, ctx),
            MetricProducer::Event(p) => p.on_matched_event(atom, ctx),
            MetricProducer::Gauge(p) => p.on_matched_event(matcher_index, atom, ctx),
        }
    }

    /// The metric's unsliced condition changed value.
    pub fn on_condition_changed(
        &mut self,
        condition: bool,
        timestamp_ns: i64,
        ctx: DispatchContext<'_>,
    ) {
        match self {
            MetricProducer::Count(p) => p.on_condition_changed(condition, timestamp_ns),
            MetricProducer::Duration(p) => p.on_condition_changed(condition, timestamp_ns),
            MetricProducer::Event(p) => p.on_condition_changed(condition, timestamp_ns),
            MetricProducer::Gauge(p) => p.on_condition_changed(condition, timestamp_ns, ctx),
        }
    }

    /// Called once after install; pulled gauges fetch their first sample.
    pub fn prepare_first_bucket(&mut self, timestamp_ns: i64, ctx: DispatchContext<'_>) {
        if let MetricProducer::Gauge(p) = self {
            p.prepare_first_bucket(timestamp_ns, ctx);
        }
    }

    /// The metric's sliced condition may have changed for some dimensions.
    pub fn on_sliced_condition_may_change(&mut self, timestamp_ns: i64, ctx: DispatchContext<'_>) {
        match self {
            MetricProducer::Count(_) | MetricProducer::Event(_) => {}
            MetricProducer::Duration(p) => p.on_sliced_condition_may_change(timestamp_ns, ctx),
            MetricProducer::Gauge(p) => p.on_sliced_condition_may_change(timestamp_ns, ctx),
        }
    }

    /// A slicing state this metric uses changed for `primary_key`.
    pub fn on_state_changed(
        &mut self,
        timestamp_ns: i64,
        atom_id: i32,
        primary_key: &DimensionKey,
        new_value: &FieldValue,
    ) {
        // Count, event and gauge metrics read states at event time only.
        if let MetricProducer::Duration(p) = self {
            p.on_state_changed(timestamp_ns, atom_id, primary_key, new_value);
        }
    }

    /// Pulled atoms arrived for this metric's pull tag.
    pub fn on_pulled_atoms(
        &mut self,
        atoms: &[crate::field::Atom],
        timestamp_ns: i64,
        ctx: DispatchContext<'_>,
    ) {
        if let MetricProducer::Gauge(p) = self {
            p.on_pulled_atoms(atoms, timestamp_ns, ctx);
        }
    }

    /// Force the current bucket closed at `timestamp_ns` (partial bucket),
    /// e.g. around configuration-affecting system events.
    pub fn notify_flush_boundary(&mut self, timestamp_ns: i64, ctx: DispatchContext<'_>) {
        match self {
            MetricProducer::Count(p) => p.flush_current_bucket(timestamp_ns, timestamp_ns),
            MetricProducer::Duration(p) => p.flush_current_bucket(timestamp_ns, timestamp_ns),
            MetricProducer::Event(_) => {}
            MetricProducer::Gauge(p) => p.notify_flush_boundary(timestamp_ns, ctx),
        }
    }

    pub fn flush_if_needed(&mut self, event_ns: i64) {
        match self {
            MetricProducer::Count(p) => p.flush_if_needed(event_ns),
            MetricProducer::Duration(p) => p.flush_if_needed(event_ns),
            MetricProducer::Event(_) => {}
            MetricProducer::Gauge(p) => p.flush_if_needed(event_ns),
        }
    }

    /// Expire activations; returns whether the metric is active afterwards.
    pub fn flush_if_expire(&mut self, now_ns: i64) -> bool {
        let active = self.core_mut().activations.flush_if_expire(now_ns);
        self.set_active(active, now_ns);
        active
    }

    pub fn activate(&mut self, matcher_index: usize, now_ns: i64) {
        self.core_mut().activations.activate(matcher_index, now_ns);
        let active = self.core().activations.is_active();
        self.set_active(active, now_ns);
    }

    pub fn cancel_event_activation(&mut self, deactivation_index: usize, now_ns: i64) {
        self.core_mut().activations.cancel(deactivation_index);
        let active = self.core().activations.is_active();
        self.set_active(active, now_ns);
    }

    fn set_active(&mut self, active: bool, timestamp_ns: i64) {
        let core = self.core_mut();
        if core.is_active == active {
            return;
        }
        core.is_active = active;
        if let MetricProducer::Duration(p) = self {
            p.on_active_state_changed(active, timestamp_ns);
        } else {
            let core = self.core_mut();
            let condition = core.condition.is_true();
            core.condition_timer
                .on_condition_changed(active && condition, timestamp_ns);
        }
    }

    /// Produce this metric's report section.
    pub fn dump_report(
        &mut self,
        dump_ns: i64,
        include_current_partial: bool,
        erase_data: bool,
        hash_strings: bool,
    ) -> MetricReport {
        match self {
            MetricProducer::Count(p) => {
                p.dump_report(dump_ns, include_current_partial, erase_data, hash_strings)
            }
            MetricProducer::Duration(p) => {
                p.dump_report(dump_ns, include_current_partial, erase_data, hash_strings)
            }
            MetricProducer::Event(p) => p.dump_report(dump_ns, erase_data, hash_strings),
            MetricProducer::Gauge(p) => {
                p.dump_report(dump_ns, include_current_partial, erase_data, hash_strings)
            }
        }
    }

    /// Discard past buckets without reporting them.
    pub fn clear_past_buckets(&mut self, timestamp_ns: i64) {
        match self {
            MetricProducer::Count(p) => p.clear_past_buckets(timestamp_ns),
            MetricProducer::Duration(p) => p.clear_past_buckets(timestamp_ns),
            MetricProducer::Event(p) => p.clear_past_buckets(),
            MetricProducer::Gauge(p) => p.clear_past_buckets(timestamp_ns),
        }
    }

    /// Drop all data, counting the drop.
    pub fn drop_data(&mut self, timestamp_ns: i64) {
        let metric_id = self.metric_id();
        self.core().stats.note_bucket_dropped(metric_id);
        self.clear_past_buckets(timestamp_ns);
    }

    /// Approximate in-memory size of stored report data.
    pub fn byte_size(&self) -> usize {
        match self {
            MetricProducer::Count(p) => p.byte_size(),
            MetricProducer::Duration(p) => p.byte_size(),
            MetricProducer::Event(p) => p.byte_size(),
            MetricProducer::Gauge(p) => p.byte_size(),
        }
    }

    pub fn anomaly_trackers_mut(&mut self) -> &mut [crate::anomaly::AnomalyTracker] {
        match self {
            MetricProducer::Count(p) => &mut p.anomaly_trackers,
            MetricProducer::Duration(p) => &mut p.anomaly_trackers,
            MetricProducer::Gauge(p) => &mut p.anomaly_trackers,
            MetricProducer::Event(_) => &mut [],
        }
    }

    pub fn cancel_all_alarms(&mut self) {
        for tracker in self.anomaly_trackers_mut() {
            tracker.cancel_all_alarms();
        }
    }
}
