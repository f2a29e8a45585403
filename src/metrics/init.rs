//! Configuration resolution.
//!
//! Turns a parsed [`EngineConfig`] into the runtime artifacts a metrics
//! manager drives: matchers, condition trackers, state trackers, metric
//! producers, anomaly trackers, periodic alarms, and the index maps wiring
//! them together. A malformed configuration produces a typed reason and is
//! rejected as a unit.
//!
//! On update, sections whose configuration (and transitive inputs) did not
//! change are preserved with their runtime state; everything else is
//! rebuilt.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::anomaly::alarm::PeriodicAlarmTracker;
use crate::anomaly::{AnomalySubscriberFn, AnomalyTracker};
use crate::condition::{
    CombinationConditionTracker, ConditionTracker, SimpleConditionTracker,
};
use crate::config::{
    to_matchers, DurationAggregation, EngineConfig, MatcherKind, MetricConfig, Operation,
    PredicateKind,
};
use crate::dimension::sampler::DimensionSampler;
use crate::dimension::{MetricConditionLink, MetricStateLink};
use crate::external::{AlarmScheduler, AtomPuller};
use crate::field::Value;
use crate::guardrail::{
    clamp_dimension_hard_limit, EngineStats, DIMENSION_KEY_SIZE_SOFT_LIMIT,
    MAX_ALERT_COUNT_PER_CONFIG, MAX_CONDITION_COUNT_PER_CONFIG, MAX_MATCHER_COUNT_PER_CONFIG,
    MAX_METRIC_COUNT_PER_CONFIG,
};
use crate::matcher::{
    AtomMatcher, CombinationAtomMatcher, FieldValueTest, LogicalOp, SimpleAtomMatcher,
    Transformation,
};
use crate::metrics::{
    ActivationMap, ConditionTimer, CountMetricProducer, DurationMetricProducer,
    EventMetricProducer, GaugeMetricProducer, MetricCore, MetricProducer,
};
use crate::state::{StateManager, StateTracker};

/// Why a configuration was rejected at install or update time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidConfigReason {
    #[error("duplicate matcher id {0}")]
    DuplicateMatcherId(i64),
    #[error("matcher {0} references unknown or later-declared child {1}")]
    MatcherChildNotFound(i64, i64),
    #[error("matcher {0}: field test needs exactly one value")]
    MatcherTestAmbiguous(i64),
    #[error("too many matchers")]
    TooManyMatchers,

    #[error("duplicate predicate id {0}")]
    DuplicatePredicateId(i64),
    #[error("predicate {0} references unknown matcher {1}")]
    ConditionMatcherNotFound(i64, i64),
    #[error("predicate {0} references unknown or later-declared child {1}")]
    ConditionChildNotFound(i64, i64),
    #[error("predicate {0}: NOT takes exactly one child")]
    NotOperationArity(i64),
    #[error("predicate {0}: NOT over a sliced condition is unsupported")]
    NotOnSlicedCondition(i64),
    #[error("predicate {0}: start matcher spans multiple atoms, dimensions are ambiguous")]
    ConditionDimensionsAmbiguous(i64),
    #[error("too many predicates")]
    TooManyConditions,

    #[error("duplicate metric id {0}")]
    DuplicateMetricId(i64),
    #[error("metric {0}: what {1} not found")]
    MetricWhatNotFound(i64, i64),
    #[error("metric {0}: condition {1} not found")]
    MetricConditionNotFound(i64, i64),
    #[error("metric {0}: sliced condition requires links")]
    MetricConditionLinkMissing(i64),
    #[error("metric {0}: link condition has no resolvable atom")]
    LinkConditionAmbiguous(i64),
    #[error("metric {0}: sliced state {1} not declared")]
    StateNotFound(i64, i32),
    #[error("metric {0}: what spans multiple atoms, dimensions are ambiguous")]
    MetricDimensionsAmbiguous(i64),
    #[error("duration metric {0}: what must be a simple predicate")]
    DurationWhatNotSimple(i64),
    #[error("duration metric {0}: what predicate has no start matcher")]
    DurationNoStart(i64),
    #[error("duration metric {0}: dimensions must be a subset of the predicate dimensions")]
    DurationDimensionsNotSubset(i64),
    #[error("duration metric {0}: MAX_SPARSE cannot slice by state")]
    DurationMaxSparseSlicedState(i64),
    #[error("gauge metric {0}: pulled gauge needs a simple what matcher")]
    GaugePullNotSimple(i64),
    #[error("too many metrics")]
    TooManyMetrics,

    #[error("duplicate alert id {0}")]
    DuplicateAlertId(i64),
    #[error("alert {0}: metric {1} not found")]
    AlertMetricNotFound(i64, i64),
    #[error("alert {0}: threshold exceeds what the window can accumulate")]
    AlertThresholdTooHigh(i64),
    #[error("alert {0}: event metrics cannot carry alerts")]
    AlertOnEventMetric(i64),
    #[error("too many alerts")]
    TooManyAlerts,

    #[error("activation references unknown metric {0}")]
    ActivationMetricNotFound(i64),
    #[error("activation for metric {0} references unknown matcher {1}")]
    ActivationMatcherNotFound(i64, i64),

    #[error("periodic alarms need an alarm scheduler")]
    NoAlarmScheduler,

    #[error("too many log sources")]
    TooManyLogSources,
}

/// External collaborators injected at install time.
#[derive(Clone)]
pub struct InitDeps {
    pub stats: Arc<EngineStats>,
    pub puller: Option<Arc<dyn AtomPuller>>,
    pub alarm_scheduler: Option<Arc<dyn AlarmScheduler>>,
    pub shard_offset: u32,
    pub anomaly_subscriber: Option<AnomalySubscriberFn>,
}

impl InitDeps {
    pub fn bare(stats: Arc<EngineStats>) -> Self {
        InitDeps {
            stats,
            puller: None,
            alarm_scheduler: None,
            shard_offset: 0,
            anomaly_subscriber: None,
        }
    }
}

/// Everything a metrics manager drives, fully wired.
pub struct EngineArtifacts {
    pub matchers: Vec<AtomMatcher>,
    pub matcher_map: HashMap<i64, usize>,
    pub tag_to_matchers: HashMap<i32, Vec<usize>>,

    pub conditions: Vec<ConditionTracker>,
    pub condition_map: HashMap<i64, usize>,
    pub tracker_to_condition: HashMap<usize, Vec<usize>>,

    pub producers: Vec<MetricProducer>,
    pub metric_map: HashMap<i64, usize>,
    pub tracker_to_metric: HashMap<usize, Vec<usize>>,
    pub condition_to_metric: HashMap<usize, Vec<usize>>,
    pub activation_to_metric: HashMap<usize, Vec<usize>>,
    pub deactivation_to_metric: HashMap<usize, Vec<usize>>,
    pub metrics_with_activation: Vec<usize>,

    pub states: StateManager,
    pub state_atom_to_metrics: HashMap<i32, Vec<usize>>,

    pub periodic_alarms: Vec<PeriodicAlarmTracker>,
    pub alert_map: HashMap<i64, usize>,
    pub no_report_metric_ids: HashSet<i64>,
}

impl std::fmt::Debug for EngineArtifacts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineArtifacts")
            .field("matchers_len", &self.matchers.len())
            .field("conditions_len", &self.conditions.len())
            .field("producers_len", &self.producers.len())
            .field("periodic_alarms_len", &self.periodic_alarms.len())
            .field("alert_map", &self.alert_map)
            .field("no_report_metric_ids", &self.no_report_metric_ids)
            .finish_non_exhaustive()
    }
}

/// Tags a single simple matcher watches; combinations may span several.
fn matcher_single_tag(matchers: &[AtomMatcher], index: usize) -> Option<i32> {
    let tags = matchers[index].interested_tags(matchers);
    if tags.len() == 1 {
        Some(tags[0])
    } else {
        None
    }
}

pub fn build_artifacts(
    config: &EngineConfig,
    time_base_ns: i64,
    now_ns: i64,
    deps: &InitDeps,
) -> Result<EngineArtifacts, InvalidConfigReason> {
    // --- Matchers ---
    let mut matchers: Vec<AtomMatcher> = Vec::with_capacity(config.matchers.len());
    let mut matcher_map: HashMap<i64, usize> = HashMap::new();
    for mc in &config.matchers {
        if matcher_map.contains_key(&mc.id) {
            return Err(InvalidConfigReason::DuplicateMatcherId(mc.id));
        }
        let matcher = match &mc.kind {
            MatcherKind::Simple(simple) => {
                let mut tests = Vec::with_capacity(simple.field_tests.len());
                for test in &simple.field_tests {
                    let value = match (test.eq_int, test.eq_long, &test.eq_string, test.eq_bool) {
                        (Some(v), None, None, None) => Value::Int(v),
                        (None, Some(v), None, None) => Value::Long(v),
                        (None, None, Some(v), None) => Value::Str(v.clone()),
                        (None, None, None, Some(v)) => Value::Int(i32::from(v)),
                        _ => return Err(InvalidConfigReason::MatcherTestAmbiguous(mc.id)),
                    };
                    tests.push(FieldValueTest {
                        field: test.field.to_matcher(simple.atom_id),
                        value,
                    });
                }
                AtomMatcher::Simple(SimpleAtomMatcher {
                    id: mc.id,
                    tag: simple.atom_id,
                    tests,
                    transformation: simple
                        .truncate_attribution_first
                        .map(|chain_field| Transformation::TruncateAttributionFirst { chain_field }),
                })
            }
            MatcherKind::Combination(combo) => {
                let mut children = Vec::with_capacity(combo.matcher_ids.len());
                for child_id in &combo.matcher_ids {
                    let child = matcher_map
                        .get(child_id)
                        .copied()
                        .ok_or(InvalidConfigReason::MatcherChildNotFound(mc.id, *child_id))?;
                    children.push(child);
                }
                AtomMatcher::Combination(CombinationAtomMatcher {
                    id: mc.id,
                    op: to_logical_op(combo.operation),
                    children,
                })
            }
        };
        matcher_map.insert(mc.id, matchers.len());
        matchers.push(matcher);
    }
    if matchers.len() > MAX_MATCHER_COUNT_PER_CONFIG {
        return Err(InvalidConfigReason::TooManyMatchers);
    }

    let mut tag_to_matchers: HashMap<i32, Vec<usize>> = HashMap::new();
    for (idx, matcher) in matchers.iter().enumerate() {
        for tag in matcher.interested_tags(&matchers) {
            tag_to_matchers.entry(tag).or_default().push(idx);
        }
    }

    // --- Conditions ---
    let mut conditions: Vec<ConditionTracker> = Vec::with_capacity(config.predicates.len());
    let mut condition_map: HashMap<i64, usize> = HashMap::new();
    let mut condition_matchers: Vec<Vec<usize>> = Vec::with_capacity(config.predicates.len());
    for pc in &config.predicates {
        if condition_map.contains_key(&pc.id) {
            return Err(InvalidConfigReason::DuplicatePredicateId(pc.id));
        }
        let index = conditions.len();
        match &pc.kind {
            PredicateKind::Simple(simple) => {
                let resolve = |id: Option<i64>| -> Result<Option<usize>, InvalidConfigReason> {
                    match id {
                        None => Ok(None),
                        Some(id) => matcher_map
                            .get(&id)
                            .copied()
                            .map(Some)
                            .ok_or(InvalidConfigReason::ConditionMatcherNotFound(pc.id, id)),
                    }
                };
                let start = resolve(simple.start)?;
                let stop = resolve(simple.stop)?;
                let stop_all = resolve(simple.stop_all)?;

                let dimension_matchers = if simple.dimensions.is_empty() {
                    Vec::new()
                } else {
                    let anchor = start
                        .or(stop)
                        .ok_or(InvalidConfigReason::ConditionDimensionsAmbiguous(pc.id))?;
                    let tag = matcher_single_tag(&matchers, anchor)
                        .ok_or(InvalidConfigReason::ConditionDimensionsAmbiguous(pc.id))?;
                    to_matchers(&simple.dimensions, tag)
                };

                let mut interested: Vec<usize> =
                    [start, stop, stop_all].into_iter().flatten().collect();
                interested.sort_unstable();
                interested.dedup();
                condition_matchers.push(interested);

                conditions.push(ConditionTracker::Simple(SimpleConditionTracker::new(
                    pc.id,
                    index,
                    start,
                    stop,
                    stop_all,
                    simple.count_nesting,
                    dimension_matchers,
                    simple.initial_unknown,
                )));
            }
            PredicateKind::Combination(combo) => {
                let mut children = Vec::with_capacity(combo.predicate_ids.len());
                for child_id in &combo.predicate_ids {
                    let child = condition_map
                        .get(child_id)
                        .copied()
                        .ok_or(InvalidConfigReason::ConditionChildNotFound(pc.id, *child_id))?;
                    children.push(child);
                }
                let sliced_children: Vec<usize> = children
                    .iter()
                    .copied()
                    .filter(|&c| conditions[c].is_sliced())
                    .collect();
                if combo.operation == Operation::Not {
                    if children.len() != 1 {
                        return Err(InvalidConfigReason::NotOperationArity(pc.id));
                    }
                    if !sliced_children.is_empty() {
                        return Err(InvalidConfigReason::NotOnSlicedCondition(pc.id));
                    }
                }
                let mut interested: Vec<usize> = children
                    .iter()
                    .flat_map(|&c| condition_matchers[c].iter().copied())
                    .collect();
                interested.sort_unstable();
                interested.dedup();
                condition_matchers.push(interested);

                conditions.push(ConditionTracker::Combination(
                    CombinationConditionTracker::new(
                        pc.id,
                        index,
                        to_logical_op(combo.operation),
                        children,
                        sliced_children,
                    ),
                ));
            }
        }
        condition_map.insert(pc.id, index);
    }
    if conditions.len() > MAX_CONDITION_COUNT_PER_CONFIG {
        return Err(InvalidConfigReason::TooManyConditions);
    }

    let mut tracker_to_condition: HashMap<usize, Vec<usize>> = HashMap::new();
    for (cond_idx, matcher_indices) in condition_matchers.iter().enumerate() {
        for &m in matcher_indices {
            tracker_to_condition.entry(m).or_default().push(cond_idx);
        }
    }

    // --- States ---
    let mut states = StateManager::new();
    let mut state_configs: HashMap<i32, &crate::config::StateConfig> = HashMap::new();
    for sc in &config.states {
        state_configs.insert(sc.atom_id, sc);
        states.register(StateTracker::new(
            sc.atom_id,
            to_matchers(&sc.primary_fields, sc.atom_id),
            sc.value_field.to_matcher(sc.atom_id),
        ));
    }

    // --- Metrics ---
    if config.metrics.len() > MAX_METRIC_COUNT_PER_CONFIG {
        return Err(InvalidConfigReason::TooManyMetrics);
    }
    let mut producers: Vec<MetricProducer> = Vec::with_capacity(config.metrics.len());
    let mut metric_map: HashMap<i64, usize> = HashMap::new();
    let mut tracker_to_metric: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut condition_to_metric: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut state_atom_to_metrics: HashMap<i32, Vec<usize>> = HashMap::new();

    let builder = CoreBuilder {
        config,
        deps,
        matchers: &matchers,
        conditions: &conditions,
        condition_map: &condition_map,
        state_configs: &state_configs,
        time_base_ns,
    };

    for metric in &config.metrics {
        if metric_map.contains_key(&metric.id()) {
            return Err(InvalidConfigReason::DuplicateMetricId(metric.id()));
        }
        let metric_idx = producers.len();

        let producer = match metric {
            MetricConfig::Count(cfg) => {
                let what_idx = matcher_map
                    .get(&cfg.what)
                    .copied()
                    .ok_or(InvalidConfigReason::MetricWhatNotFound(cfg.id, cfg.what))?;
                let what_tag = match matcher_single_tag(&matchers, what_idx) {
                    Some(tag) => tag,
                    None if cfg.dimensions_in_what.is_empty() => 0,
                    None => {
                        return Err(InvalidConfigReason::MetricDimensionsAmbiguous(cfg.id));
                    }
                };
                let core = builder.build_core(
                    cfg.id,
                    what_tag,
                    cfg.condition,
                    &cfg.links,
                    &cfg.state_links,
                    &cfg.sliced_states,
                    cfg.sampling.map(|s| s.shard_count),
                    cfg.max_dimensions_per_bucket,
                    cfg.bucket.as_nanos() as i64,
                )?;
                tracker_to_metric.entry(what_idx).or_default().push(metric_idx);
                MetricProducer::Count(CountMetricProducer::new(
                    core,
                    to_matchers(&cfg.dimensions_in_what, what_tag),
                    Vec::new(),
                ))
            }
            MetricConfig::Duration(cfg) => {
                let what_cond_idx = condition_map
                    .get(&cfg.what)
                    .copied()
                    .ok_or(InvalidConfigReason::MetricWhatNotFound(cfg.id, cfg.what))?;
                let ConditionTracker::Simple(what_predicate) = &conditions[what_cond_idx] else {
                    return Err(InvalidConfigReason::DurationWhatNotSimple(cfg.id));
                };
                let start_idx = what_predicate
                    .start_index
                    .ok_or(InvalidConfigReason::DurationNoStart(cfg.id))?;
                let stop_idx = what_predicate.stop_index;
                let stop_all_idx = what_predicate.stop_all_index;
                let nested = what_predicate.count_nesting;
                let internal_dimensions = what_predicate.dimension_matchers.clone();

                let what_tag = matcher_single_tag(&matchers, start_idx)
                    .ok_or(InvalidConfigReason::MetricDimensionsAmbiguous(cfg.id))?;
                let dimensions_in_what = to_matchers(&cfg.dimensions_in_what, what_tag);
                if !dimensions_in_what
                    .iter()
                    .all(|d| internal_dimensions.contains(d))
                {
                    return Err(InvalidConfigReason::DurationDimensionsNotSubset(cfg.id));
                }
                if cfg.aggregation == DurationAggregation::MaxSparse
                    && !cfg.sliced_states.is_empty()
                {
                    return Err(InvalidConfigReason::DurationMaxSparseSlicedState(cfg.id));
                }

                let core = builder.build_core(
                    cfg.id,
                    what_tag,
                    cfg.condition,
                    &cfg.links,
                    &cfg.state_links,
                    &cfg.sliced_states,
                    cfg.sampling.map(|s| s.shard_count),
                    cfg.max_dimensions_per_bucket,
                    cfg.bucket.as_nanos() as i64,
                )?;

                for idx in [Some(start_idx), stop_idx, stop_all_idx].into_iter().flatten() {
                    tracker_to_metric.entry(idx).or_default().push(metric_idx);
                }
                MetricProducer::Duration(DurationMetricProducer::new(
                    core,
                    cfg.aggregation,
                    start_idx,
                    stop_idx,
                    stop_all_idx,
                    nested,
                    dimensions_in_what,
                    internal_dimensions,
                    cfg.threshold,
                    Vec::new(),
                ))
            }
            MetricConfig::Event(cfg) => {
                let what_idx = matcher_map
                    .get(&cfg.what)
                    .copied()
                    .ok_or(InvalidConfigReason::MetricWhatNotFound(cfg.id, cfg.what))?;
                let core = builder.build_core(
                    cfg.id,
                    matcher_single_tag(&matchers, what_idx).unwrap_or(0),
                    cfg.condition,
                    &cfg.links,
                    &[],
                    &[],
                    None,
                    0,
                    i64::MAX,
                )?;
                tracker_to_metric.entry(what_idx).or_default().push(metric_idx);
                MetricProducer::Event(EventMetricProducer::new(core, cfg.sampling_percentage))
            }
            MetricConfig::Gauge(cfg) => {
                let what_idx = matcher_map
                    .get(&cfg.what)
                    .copied()
                    .ok_or(InvalidConfigReason::MetricWhatNotFound(cfg.id, cfg.what))?;
                let what_tag = match &matchers[what_idx] {
                    AtomMatcher::Simple(simple) => simple.tag,
                    AtomMatcher::Combination(_) if cfg.pulled => {
                        return Err(InvalidConfigReason::GaugePullNotSimple(cfg.id));
                    }
                    m => matcher_single_tag(&matchers, what_idx).unwrap_or_else(|| {
                        warn!(metric = cfg.id, matcher = m.id(), "ambiguous gauge atom tag");
                        0
                    }),
                };
                let trigger_idx = match cfg.trigger_event {
                    None => None,
                    Some(id) => Some(
                        matcher_map
                            .get(&id)
                            .copied()
                            .ok_or(InvalidConfigReason::MetricWhatNotFound(cfg.id, id))?,
                    ),
                };
                let core = builder.build_core(
                    cfg.id,
                    what_tag,
                    cfg.condition,
                    &cfg.links,
                    &[],
                    &[],
                    cfg.sampling.map(|s| s.shard_count),
                    cfg.max_dimensions_per_bucket,
                    cfg.bucket.as_nanos() as i64,
                )?;
                tracker_to_metric.entry(what_idx).or_default().push(metric_idx);
                if let Some(idx) = trigger_idx {
                    tracker_to_metric.entry(idx).or_default().push(metric_idx);
                }
                MetricProducer::Gauge(GaugeMetricProducer::new(
                    core,
                    what_idx,
                    trigger_idx,
                    cfg.sampling_type,
                    cfg.pulled.then_some(what_tag),
                    deps.puller.clone(),
                    cfg.max_pull_delay.as_nanos() as i64,
                    to_matchers(&cfg.dimensions_in_what, what_tag),
                    to_matchers(&cfg.gauge_fields, what_tag),
                    cfg.max_gauge_atoms_per_bucket,
                    Vec::new(),
                ))
            }
        };

        if let Some(cond_id) = metric_condition_id(metric) {
            let cond_idx = condition_map
                .get(&cond_id)
                .copied()
                .ok_or(InvalidConfigReason::MetricConditionNotFound(metric.id(), cond_id))?;
            condition_to_metric.entry(cond_idx).or_default().push(metric_idx);
        }
        for state_atom in metric_sliced_states(metric) {
            state_atom_to_metrics.entry(state_atom).or_default().push(metric_idx);
        }

        metric_map.insert(metric.id(), metric_idx);
        producers.push(producer);
    }

    // --- Alerts ---
    if config.alerts.len() > MAX_ALERT_COUNT_PER_CONFIG {
        return Err(InvalidConfigReason::TooManyAlerts);
    }
    let mut alert_map: HashMap<i64, usize> = HashMap::new();
    for alert in &config.alerts {
        if alert_map.contains_key(&alert.id) {
            return Err(InvalidConfigReason::DuplicateAlertId(alert.id));
        }
        let metric_idx = metric_map
            .get(&alert.metric_id)
            .copied()
            .ok_or(InvalidConfigReason::AlertMetricNotFound(alert.id, alert.metric_id))?;
        let subscriptions = config
            .subscriptions
            .iter()
            .filter(|s| s.rule_id == alert.id)
            .cloned()
            .collect();
        let mut tracker = AnomalyTracker::new(
            alert.clone(),
            subscriptions,
            deps.anomaly_subscriber.clone(),
            Arc::clone(&deps.stats),
        );
        match &mut producers[metric_idx] {
            MetricProducer::Count(p) => p.anomaly_trackers.push(tracker),
            MetricProducer::Gauge(p) => p.anomaly_trackers.push(tracker),
            MetricProducer::Duration(p) => {
                let is_sum = matches!(
                    &config.metrics[metric_idx],
                    MetricConfig::Duration(d) if d.aggregation == DurationAggregation::Sum
                );
                if is_sum {
                    let capacity = alert.num_buckets as i64 * p.core.bucket_size_ns;
                    if alert.trigger_if_sum_gt > capacity {
                        return Err(InvalidConfigReason::AlertThresholdTooHigh(alert.id));
                    }
                }
                if let Some(scheduler) = &deps.alarm_scheduler {
                    tracker = tracker.with_alarms(Arc::clone(scheduler));
                }
                p.anomaly_trackers.push(tracker);
            }
            MetricProducer::Event(_) => {
                return Err(InvalidConfigReason::AlertOnEventMetric(alert.id));
            }
        }
        alert_map.insert(alert.id, metric_idx);
    }

    // --- Activations ---
    let mut activation_to_metric: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut deactivation_to_metric: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut metrics_with_activation: Vec<usize> = Vec::new();
    for activation in &config.activations {
        let metric_idx = metric_map
            .get(&activation.metric_id)
            .copied()
            .ok_or(InvalidConfigReason::ActivationMetricNotFound(activation.metric_id))?;
        let mut map = ActivationMap::default();
        for event in &activation.events {
            let act_idx = matcher_map.get(&event.atom_matcher_id).copied().ok_or(
                InvalidConfigReason::ActivationMatcherNotFound(
                    activation.metric_id,
                    event.atom_matcher_id,
                ),
            )?;
            map.add_activation(act_idx, event.ttl.as_nanos() as i64);
            activation_to_metric.entry(act_idx).or_default().push(metric_idx);
            if let Some(deact_id) = event.deactivation_atom_matcher_id {
                let deact_idx = matcher_map.get(&deact_id).copied().ok_or(
                    InvalidConfigReason::ActivationMatcherNotFound(activation.metric_id, deact_id),
                )?;
                map.add_cancellation(deact_idx, act_idx);
                deactivation_to_metric.entry(deact_idx).or_default().push(metric_idx);
            }
        }
        let core = producers[metric_idx].core_mut();
        core.is_active = map.is_active();
        core.activations = map;
        metrics_with_activation.push(metric_idx);
    }

    // --- Periodic alarms ---
    let mut periodic_alarms = Vec::with_capacity(config.periodic_alarms.len());
    if !config.periodic_alarms.is_empty() {
        let scheduler = deps
            .alarm_scheduler
            .as_ref()
            .ok_or(InvalidConfigReason::NoAlarmScheduler)?;
        for alarm in &config.periodic_alarms {
            let subscriptions = config
                .subscriptions
                .iter()
                .filter(|s| s.rule_id == alarm.id)
                .cloned()
                .collect();
            periodic_alarms.push(PeriodicAlarmTracker::new(
                alarm.clone(),
                subscriptions,
                now_ns,
                Arc::clone(scheduler),
            ));
        }
    }

    Ok(EngineArtifacts {
        matchers,
        matcher_map,
        tag_to_matchers,
        conditions,
        condition_map,
        tracker_to_condition,
        producers,
        metric_map,
        tracker_to_metric,
        condition_to_metric,
        activation_to_metric,
        deactivation_to_metric,
        metrics_with_activation,
        states,
        state_atom_to_metrics,
        periodic_alarms,
        alert_map,
        no_report_metric_ids: config.no_report_metrics.iter().copied().collect(),
    })
}

struct CoreBuilder<'a> {
    config: &'a EngineConfig,
    deps: &'a InitDeps,
    matchers: &'a [AtomMatcher],
    conditions: &'a [ConditionTracker],
    condition_map: &'a HashMap<i64, usize>,
    state_configs: &'a HashMap<i32, &'a crate::config::StateConfig>,
    time_base_ns: i64,
}

impl CoreBuilder<'_> {
    /// Atom tag a condition's dimension keys are expressed in.
    fn condition_atom_tag(&self, condition_index: usize) -> Option<i32> {
        match &self.conditions[condition_index] {
            ConditionTracker::Simple(t) => {
                let anchor = t.start_index.or(t.stop_index)?;
                matcher_single_tag(self.matchers, anchor)
            }
            ConditionTracker::Combination(t) => {
                let child = t.single_sliced_child().or_else(|| t.children.first().copied())?;
                self.condition_atom_tag(child)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_core(
        &self,
        metric_id: i64,
        what_tag: i32,
        condition: Option<i64>,
        links_cfg: &[crate::config::LinkConfig],
        state_links_cfg: &[crate::config::StateLinkConfig],
        sliced_states: &[i32],
        shard_count: Option<u32>,
        max_dimensions: usize,
        bucket_size_ns: i64,
    ) -> Result<MetricCore, InvalidConfigReason> {
        let condition_index = match condition {
            None => None,
            Some(id) => Some(
                self.condition_map
                    .get(&id)
                    .copied()
                    .ok_or(InvalidConfigReason::MetricConditionNotFound(metric_id, id))?,
            ),
        };

        let mut links = Vec::with_capacity(links_cfg.len());
        for link in links_cfg {
            let link_cond_idx = self
                .condition_map
                .get(&link.condition)
                .copied()
                .ok_or(InvalidConfigReason::MetricConditionNotFound(metric_id, link.condition))?;
            let condition_tag = self
                .condition_atom_tag(link_cond_idx)
                .ok_or(InvalidConfigReason::LinkConditionAmbiguous(metric_id))?;
            links.push(MetricConditionLink {
                condition_id: link.condition,
                metric_fields: to_matchers(&link.fields_in_what, what_tag),
                condition_fields: to_matchers(&link.fields_in_condition, condition_tag),
            });
        }
        let condition_sliced = !links.is_empty();
        if let Some(idx) = condition_index {
            if self.conditions[idx].is_sliced() && links.is_empty() {
                return Err(InvalidConfigReason::MetricConditionLinkMissing(metric_id));
            }
        }

        let links_all_condition_dimensions = match (condition_index, links.first()) {
            (Some(idx), Some(link)) if links.len() == 1 => {
                let wizard = crate::condition::ConditionWizard::new(self.conditions);
                wizard.equal_output_dimensions(idx, &link.condition_fields)
            }
            _ => false,
        };

        let mut state_links = Vec::with_capacity(state_links_cfg.len());
        for link in state_links_cfg {
            state_links.push(MetricStateLink {
                state_atom_id: link.state_atom_id,
                metric_fields: to_matchers(&link.fields_in_what, what_tag),
                state_fields: to_matchers(&link.fields_in_state, link.state_atom_id),
            });
        }
        let mut state_group_maps = HashMap::new();
        for atom_id in sliced_states {
            let state_cfg = self
                .state_configs
                .get(atom_id)
                .ok_or(InvalidConfigReason::StateNotFound(metric_id, *atom_id))?;
            if let Some(map) = state_cfg.group_map() {
                state_group_maps.insert(*atom_id, map);
            }
        }

        let condition_state = match condition_index {
            None => crate::condition::ConditionState::True,
            Some(idx) => self.conditions[idx].current_unsliced(self.conditions),
        };

        Ok(MetricCore {
            metric_id,
            config_id: self.config.id,
            time_base_ns: self.time_base_ns,
            bucket_size_ns,
            current_bucket_start_ns: self.time_base_ns,
            current_bucket_num: 0,
            condition: condition_state,
            condition_sliced,
            condition_index,
            links,
            links_all_condition_dimensions,
            state_links,
            sliced_state_atoms: sliced_states.to_vec(),
            state_group_maps,
            sampler: shard_count
                .filter(|c| *c > 1)
                .map(|c| DimensionSampler::new(c, self.deps.shard_offset)),
            dimension_soft_limit: DIMENSION_KEY_SIZE_SOFT_LIMIT,
            dimension_hard_limit: clamp_dimension_hard_limit(max_dimensions),
            has_hit_guardrail: false,
            condition_timer: ConditionTimer::new(
                self.time_base_ns,
                condition_state.is_true() && !condition_sliced,
            ),
            activations: ActivationMap::default(),
            is_active: true,
            stats: Arc::clone(&self.deps.stats),
        })
    }
}

fn to_logical_op(op: Operation) -> LogicalOp {
    match op {
        Operation::And => LogicalOp::And,
        Operation::Or => LogicalOp::Or,
        Operation::Not => LogicalOp::Not,
    }
}

fn metric_condition_id(metric: &MetricConfig) -> Option<i64> {
    match metric {
        MetricConfig::Count(m) => m.condition,
        MetricConfig::Duration(m) => m.condition,
        MetricConfig::Event(m) => m.condition,
        MetricConfig::Gauge(m) => m.condition,
    }
}

fn metric_sliced_states(metric: &MetricConfig) -> Vec<i32> {
    match metric {
        MetricConfig::Count(m) => m.sliced_states.clone(),
        MetricConfig::Duration(m) => m.sliced_states.clone(),
        MetricConfig::Event(_) | MetricConfig::Gauge(_) => Vec::new(),
    }
}

// --- Config update ---

/// Rebuild artifacts for a new configuration, carrying runtime state for
/// every section whose definition and transitive inputs are unchanged.
pub fn update_artifacts(
    old_config: &EngineConfig,
    mut old: EngineArtifacts,
    new_config: &EngineConfig,
    time_base_ns: i64,
    now_ns: i64,
    deps: &InitDeps,
) -> Result<EngineArtifacts, InvalidConfigReason> {
    let mut new = build_artifacts(new_config, time_base_ns, now_ns, deps)?;

    // Replacement sets. Matchers are stateless, so only their identity
    // matters to downstream sections.
    let old_matchers: HashMap<i64, &crate::config::MatcherConfig> =
        old_config.matchers.iter().map(|m| (m.id, m)).collect();
    let replaced_matchers: HashSet<i64> = new_config
        .matchers
        .iter()
        .filter(|m| old_matchers.get(&m.id).map(|old_m| *old_m != *m).unwrap_or(true))
        .map(|m| m.id)
        .collect();

    let old_predicates: HashMap<i64, &crate::config::PredicateConfig> =
        old_config.predicates.iter().map(|p| (p.id, p)).collect();
    let mut replaced_conditions: HashSet<i64> = HashSet::new();
    for pc in &new_config.predicates {
        let changed = old_predicates.get(&pc.id).map(|old_p| **old_p != *pc).unwrap_or(true);
        let inputs_replaced = match &pc.kind {
            PredicateKind::Simple(s) => [s.start, s.stop, s.stop_all]
                .into_iter()
                .flatten()
                .any(|m| replaced_matchers.contains(&m)),
            PredicateKind::Combination(c) => c
                .predicate_ids
                .iter()
                .any(|id| replaced_conditions.contains(id)),
        };
        if changed || inputs_replaced {
            replaced_conditions.insert(pc.id);
        }
    }

    let old_states: HashMap<i32, &crate::config::StateConfig> =
        old_config.states.iter().map(|s| (s.atom_id, s)).collect();
    let replaced_states: HashSet<i32> = new_config
        .states
        .iter()
        .filter(|s| old_states.get(&s.atom_id).map(|old_s| *old_s != *s).unwrap_or(true))
        .map(|s| s.atom_id)
        .collect();

    let old_metrics: HashMap<i64, &MetricConfig> =
        old_config.metrics.iter().map(|m| (m.id(), m)).collect();
    let old_activations: HashMap<i64, &crate::config::ActivationConfig> =
        old_config.activations.iter().map(|a| (a.metric_id, a)).collect();
    let new_activations: HashMap<i64, &crate::config::ActivationConfig> =
        new_config.activations.iter().map(|a| (a.metric_id, a)).collect();
    let mut replaced_metrics: HashSet<i64> = HashSet::new();
    for metric in &new_config.metrics {
        let id = metric.id();
        let changed = old_metrics.get(&id).map(|old_m| **old_m != *metric).unwrap_or(true);
        let what_replaced = match metric {
            MetricConfig::Duration(m) => replaced_conditions.contains(&m.what),
            MetricConfig::Count(m) => replaced_matchers.contains(&m.what),
            MetricConfig::Event(m) => replaced_matchers.contains(&m.what),
            MetricConfig::Gauge(m) => {
                replaced_matchers.contains(&m.what)
                    || m.trigger_event.is_some_and(|t| replaced_matchers.contains(&t))
            }
        };
        let condition_replaced = metric_condition_id(metric)
            .is_some_and(|c| replaced_conditions.contains(&c));
        let states_replaced = metric_sliced_states(metric)
            .iter()
            .any(|s| replaced_states.contains(s));
        let activation_changed = old_activations.get(&id) != new_activations.get(&id);
        if changed || what_replaced || condition_replaced || states_replaced || activation_changed
        {
            replaced_metrics.insert(id);
        }
    }

    let old_alerts: HashMap<i64, &crate::config::AlertConfig> =
        old_config.alerts.iter().map(|a| (a.id, a)).collect();
    let replaced_alerts: HashSet<i64> = new_config
        .alerts
        .iter()
        .filter(|a| {
            old_alerts.get(&a.id).map(|old_a| *old_a != *a).unwrap_or(true)
                || replaced_metrics.contains(&a.metric_id)
        })
        .map(|a| a.id)
        .collect();

    // Carry condition state.
    for pc in &new_config.predicates {
        if replaced_conditions.contains(&pc.id) {
            continue;
        }
        let (Some(&new_idx), Some(&old_idx)) =
            (new.condition_map.get(&pc.id), old.condition_map.get(&pc.id))
        else {
            continue;
        };
        let placeholder = ConditionTracker::Simple(SimpleConditionTracker::new(
            0, 0, None, None, None, false, vec![], false,
        ));
        let mut carried = std::mem::replace(&mut old.conditions[old_idx], placeholder);
        match (&mut carried, &new.conditions[new_idx]) {
            (ConditionTracker::Simple(old_t), ConditionTracker::Simple(new_t)) => {
                old_t.rebind(
                    new_idx,
                    new_t.start_index,
                    new_t.stop_index,
                    new_t.stop_all_index,
                );
            }
            (ConditionTracker::Combination(old_t), ConditionTracker::Combination(new_t)) => {
                old_t.rebind(new_idx, new_t.children.clone(), new_t.sliced_children.clone());
            }
            _ => continue,
        }
        new.conditions[new_idx] = carried;
    }

    // Carry state-tracker values.
    for sc in &new_config.states {
        if replaced_states.contains(&sc.atom_id) {
            continue;
        }
        if let Some(old_tracker) = old.states.take_tracker(sc.atom_id) {
            new.states.register(old_tracker);
        }
    }

    // Carry metric producers.
    for metric in &new_config.metrics {
        let id = metric.id();
        if replaced_metrics.contains(&id) {
            continue;
        }
        let (Some(&new_idx), Some(&old_idx)) = (new.metric_map.get(&id), old.metric_map.get(&id))
        else {
            continue;
        };
        // Take the freshly built producer out to harvest its wiring, then
        // put the carried one in its place.
        let fresh = std::mem::replace(
            &mut new.producers[new_idx],
            MetricProducer::Event(EventMetricProducer::new(
                placeholder_core(&deps.stats),
                None,
            )),
        );
        let placeholder = MetricProducer::Event(EventMetricProducer::new(
            placeholder_core(&deps.stats),
            None,
        ));
        let mut carried = std::mem::replace(&mut old.producers[old_idx], placeholder);
        let mut kind_mismatch = false;
        match (&mut carried, &fresh) {
            (MetricProducer::Count(old_p), MetricProducer::Count(new_p)) => {
                old_p.core.condition_index = new_p.core.condition_index;
            }
            (MetricProducer::Event(old_p), MetricProducer::Event(new_p)) => {
                old_p.core.condition_index = new_p.core.condition_index;
            }
            (MetricProducer::Duration(old_p), MetricProducer::Duration(_)) => {
                if let MetricConfig::Duration(cfg) = metric {
                    let what_idx = new.condition_map[&cfg.what];
                    if let ConditionTracker::Simple(pred) = &new.conditions[what_idx] {
                        if let Some(start) = pred.start_index {
                            old_p.rebind(
                                cfg.condition.and_then(|c| new.condition_map.get(&c).copied()),
                                start,
                                pred.stop_index,
                                pred.stop_all_index,
                            );
                        }
                    }
                }
            }
            (MetricProducer::Gauge(old_p), MetricProducer::Gauge(_)) => {
                if let MetricConfig::Gauge(cfg) = metric {
                    let what_idx = new.matcher_map[&cfg.what];
                    let trigger = cfg
                        .trigger_event
                        .and_then(|t| new.matcher_map.get(&t).copied());
                    old_p.rebind(
                        cfg.condition.and_then(|c| new.condition_map.get(&c).copied()),
                        what_idx,
                        trigger,
                    );
                }
            }
            _ => kind_mismatch = true,
        }
        if kind_mismatch {
            // A kind change always comes with a config diff, so this is
            // unreachable in practice; keep the fresh producer regardless.
            new.producers[new_idx] = fresh;
            continue;
        }
        // Preserved alerts keep their trackers (they moved with the
        // producer); replaced alerts get the freshly built ones.
        carry_anomaly_trackers(&mut carried, fresh, &replaced_alerts);
        new.producers[new_idx] = carried;
    }

    // Whatever remains in the old producer list is dropped; cancel its
    // outstanding alarms.
    for producer in &mut old.producers {
        producer.cancel_all_alarms();
    }
    for alarm in &mut old.periodic_alarms {
        alarm.cancel();
    }

    // Freshly built duration metrics attached to a preserved predicate
    // replay its live dimensions as start events.
    for metric in &new_config.metrics {
        let MetricConfig::Duration(cfg) = metric else {
            continue;
        };
        if !replaced_metrics.contains(&cfg.id) || replaced_conditions.contains(&cfg.what) {
            continue;
        }
        let (Some(&metric_idx), Some(&what_idx)) =
            (new.metric_map.get(&cfg.id), new.condition_map.get(&cfg.what))
        else {
            continue;
        };
        let sliced_map = match &new.conditions[what_idx] {
            ConditionTracker::Simple(t) if !t.sliced_state().is_empty() => {
                t.sliced_state().clone()
            }
            _ => continue,
        };
        let EngineArtifacts {
            producers,
            conditions,
            states,
            matchers,
            ..
        } = &mut new;
        let ctx = crate::metrics::DispatchContext {
            wizard: crate::condition::ConditionWizard::new(conditions),
            states,
            matchers,
        };
        if let MetricProducer::Duration(producer) = &mut producers[metric_idx] {
            producer.seed_live_starts(&sliced_map, now_ns, ctx);
        }
    }

    Ok(new)
}

fn placeholder_core(stats: &Arc<EngineStats>) -> MetricCore {
    MetricCore {
        metric_id: 0,
        config_id: 0,
        time_base_ns: 0,
        bucket_size_ns: i64::MAX,
        current_bucket_start_ns: 0,
        current_bucket_num: 0,
        condition: crate::condition::ConditionState::True,
        condition_sliced: false,
        condition_index: None,
        links: vec![],
        links_all_condition_dimensions: false,
        state_links: vec![],
        sliced_state_atoms: vec![],
        state_group_maps: HashMap::new(),
        sampler: None,
        dimension_soft_limit: DIMENSION_KEY_SIZE_SOFT_LIMIT,
        dimension_hard_limit: clamp_dimension_hard_limit(0),
        has_hit_guardrail: false,
        condition_timer: ConditionTimer::new(0, false),
        activations: ActivationMap::default(),
        is_active: false,
        stats: Arc::clone(stats),
    }
}

/// Merge anomaly trackers for a preserved metric: keep the carried tracker
/// for preserved alerts, adopt the fresh tracker for replaced ones.
fn carry_anomaly_trackers(
    carried: &mut MetricProducer,
    fresh: MetricProducer,
    replaced_alerts: &HashSet<i64>,
) {
    let fresh_trackers = match fresh {
        MetricProducer::Count(p) => p.anomaly_trackers,
        MetricProducer::Duration(p) => p.anomaly_trackers,
        MetricProducer::Gauge(p) => p.anomaly_trackers,
        MetricProducer::Event(_) => return,
    };
    let carried_trackers: &mut Vec<AnomalyTracker> = match carried {
        MetricProducer::Count(p) => &mut p.anomaly_trackers,
        MetricProducer::Duration(p) => &mut p.anomaly_trackers,
        MetricProducer::Gauge(p) => &mut p.anomaly_trackers,
        MetricProducer::Event(_) => return,
    };

    let mut old_by_id: HashMap<i64, AnomalyTracker> = std::mem::take(carried_trackers)
        .into_iter()
        .map(|t| (t.alert_id(), t))
        .collect();
    for fresh_tracker in fresh_trackers {
        let id = fresh_tracker.alert_id();
        match old_by_id.remove(&id) {
            Some(old_tracker) if !replaced_alerts.contains(&id) => {
                carried_trackers.push(old_tracker)
            }
            _ => carried_trackers.push(fresh_tracker),
        }
    }
    // Alerts removed from the config: cancel whatever they had armed.
    for (_, mut dropped) in old_by_id {
        dropped.cancel_all_alarms();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn deps() -> InitDeps {
        InitDeps::bare(Arc::new(EngineStats::new()))
    }

    fn parse(yaml: &str) -> EngineConfig {
        serde_yaml::from_str(yaml).expect("config parses")
    }

    const BASE: &str = r#"
id: 1
matchers:
  - id: 1
    simple:
      atom_id: 10
      field_tests:
        - field: 2
          eq_int: 1
  - id: 2
    simple:
      atom_id: 10
      field_tests:
        - field: 2
          eq_int: 0
  - id: 3
    combination:
      operation: or
      matcher_ids: [1, 2]
predicates:
  - id: 50
    simple:
      start: 1
      stop: 2
metrics:
  - kind: count
    id: 100
    what: 3
    condition: 50
    bucket: 60s
"#;

    #[test]
    fn test_build_wires_maps() {
        let cfg = parse(BASE);
        let artifacts = build_artifacts(&cfg, 0, 0, &deps()).expect("valid");

        assert_eq!(artifacts.matchers.len(), 3);
        assert_eq!(artifacts.conditions.len(), 1);
        assert_eq!(artifacts.producers.len(), 1);
        assert_eq!(artifacts.tag_to_matchers.get(&10).map(Vec::len), Some(3));
        // Start and stop matchers both feed condition 0.
        assert_eq!(artifacts.tracker_to_condition.get(&0), Some(&vec![0]));
        assert_eq!(artifacts.tracker_to_condition.get(&1), Some(&vec![0]));
        // The combination matcher feeds the metric.
        assert_eq!(artifacts.tracker_to_metric.get(&2), Some(&vec![0]));
        assert_eq!(artifacts.condition_to_metric.get(&0), Some(&vec![0]));
    }

    #[test]
    fn test_unknown_matcher_child_rejected() {
        let cfg = parse(
            r#"
id: 1
matchers:
  - id: 1
    combination:
      operation: and
      matcher_ids: [99]
"#,
        );
        let err = build_artifacts(&cfg, 0, 0, &deps()).unwrap_err();
        assert_eq!(err, InvalidConfigReason::MatcherChildNotFound(1, 99));
    }

    #[test]
    fn test_forward_reference_rejected() {
        // Children must be declared before the combination that uses them.
        let cfg = parse(
            r#"
id: 1
matchers:
  - id: 1
    combination:
      operation: and
      matcher_ids: [2]
  - id: 2
    simple:
      atom_id: 10
"#,
        );
        let err = build_artifacts(&cfg, 0, 0, &deps()).unwrap_err();
        assert_eq!(err, InvalidConfigReason::MatcherChildNotFound(1, 2));
    }

    #[test]
    fn test_metric_with_unknown_what_rejected() {
        let cfg = parse(
            r#"
id: 1
metrics:
  - kind: count
    id: 100
    what: 42
"#,
        );
        let err = build_artifacts(&cfg, 0, 0, &deps()).unwrap_err();
        assert_eq!(err, InvalidConfigReason::MetricWhatNotFound(100, 42));
    }

    #[test]
    fn test_duration_what_must_be_simple() {
        let cfg = parse(
            r#"
id: 1
matchers:
  - id: 1
    simple:
      atom_id: 10
predicates:
  - id: 50
    simple:
      start: 1
  - id: 51
    combination:
      operation: and
      predicate_ids: [50]
metrics:
  - kind: duration
    id: 100
    what: 51
"#,
        );
        let err = build_artifacts(&cfg, 0, 0, &deps()).unwrap_err();
        assert_eq!(err, InvalidConfigReason::DurationWhatNotSimple(100));
    }

    #[test]
    fn test_sliced_condition_without_links_rejected() {
        let cfg = parse(
            r#"
id: 1
matchers:
  - id: 1
    simple:
      atom_id: 10
  - id: 2
    simple:
      atom_id: 10
  - id: 5
    simple:
      atom_id: 11
predicates:
  - id: 50
    simple:
      start: 1
      stop: 2
      dimensions:
        - field: 1
metrics:
  - kind: count
    id: 100
    what: 5
    condition: 50
"#,
        );
        let err = build_artifacts(&cfg, 0, 0, &deps()).unwrap_err();
        assert_eq!(err, InvalidConfigReason::MetricConditionLinkMissing(100));
    }

    #[test]
    fn test_alert_on_event_metric_rejected() {
        let cfg = parse(
            r#"
id: 1
matchers:
  - id: 1
    simple:
      atom_id: 10
metrics:
  - kind: event
    id: 100
    what: 1
alerts:
  - id: 7
    metric_id: 100
    trigger_if_sum_gt: 1
    num_buckets: 1
"#,
        );
        let err = build_artifacts(&cfg, 0, 0, &deps()).unwrap_err();
        assert_eq!(err, InvalidConfigReason::AlertOnEventMetric(7));
    }

    #[test]
    fn test_periodic_alarm_without_scheduler_rejected() {
        let cfg = parse(
            r#"
id: 1
periodic_alarms:
  - id: 4
    offset: 10s
    period: 60s
"#,
        );
        let err = build_artifacts(&cfg, 0, 0, &deps()).unwrap_err();
        assert_eq!(err, InvalidConfigReason::NoAlarmScheduler);
    }

    #[test]
    fn test_update_preserves_unchanged_condition_state() {
        use crate::field::Atom;
        use crate::matcher::MatchingState;

        let cfg = parse(BASE);
        let mut artifacts = build_artifacts(&cfg, 0, 0, &deps()).expect("valid");

        // Drive the condition to true.
        let atom = Atom::new(
            10,
            1000,
            1,
            vec![crate::field::FieldValue::new(
                crate::field::Field::new(10, crate::field::FieldPath::leaf(2)),
                Value::Int(1),
            )],
        );
        let mut matcher_cache = vec![MatchingState::NotComputed; artifacts.matchers.len()];
        let mut transformed = vec![None; artifacts.matchers.len()];
        crate::matcher::evaluate_matcher(
            &artifacts.matchers,
            0,
            &atom,
            &mut matcher_cache,
            &mut transformed,
        );
        let mut cond_cache =
            vec![crate::condition::ConditionState::NotEvaluated; artifacts.conditions.len()];
        let mut changed = vec![false; artifacts.conditions.len()];
        crate::condition::evaluate_condition(
            &mut artifacts.conditions,
            0,
            &atom,
            &matcher_cache,
            &mut cond_cache,
            &mut changed,
        );
        assert_eq!(cond_cache[0], crate::condition::ConditionState::True);

        // Update with an extra metric; the predicate is untouched.
        let mut updated = String::from(BASE);
        updated.push_str(
            r#"  - kind: event
    id: 101
    what: 1
"#,
        );
        let new_cfg = parse(&updated);
        let new_artifacts =
            update_artifacts(&cfg, artifacts, &new_cfg, 0, 0, &deps()).expect("valid update");

        assert_eq!(new_artifacts.producers.len(), 2);
        // Carried condition still reports true.
        assert_eq!(
            new_artifacts.conditions[0].current_unsliced(&new_artifacts.conditions),
            crate::condition::ConditionState::True
        );
    }

    #[test]
    fn test_update_replaces_changed_predicate() {
        let cfg = parse(BASE);
        let artifacts = build_artifacts(&cfg, 0, 0, &deps()).expect("valid");

        // Change the predicate's stop matcher: condition must be rebuilt.
        let new_cfg = parse(&BASE.replace("      stop: 2", "      stop: 3"));
        let new_artifacts =
            update_artifacts(&cfg, artifacts, &new_cfg, 0, 0, &deps()).expect("valid update");
        assert_eq!(
            new_artifacts.conditions[0].current_unsliced(&new_artifacts.conditions),
            crate::condition::ConditionState::False
        );
    }
}
