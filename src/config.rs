//! Declarative engine configuration.
//!
//! A configuration names the atoms to watch (matchers), the predicates over
//! them (conditions), the aggregations to compute (metrics), the alerts to
//! raise, and the operational knobs. This module is the already-parsed value
//! tree; semantic resolution into trackers and producers happens in
//! `metrics::init`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::field::{Field, FieldMatcher, FieldPath, Position};

/// Identifies one installed configuration: the owner uid plus its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub struct ConfigKey {
    pub uid: i32,
    pub id: i64,
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.uid, self.id)
    }
}

/// Top-level configuration for one metrics manager.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct EngineConfig {
    /// Configuration id; combined with the installing uid into a ConfigKey.
    pub id: i64,

    #[serde(default)]
    pub matchers: Vec<MatcherConfig>,

    #[serde(default)]
    pub predicates: Vec<PredicateConfig>,

    #[serde(default)]
    pub states: Vec<StateConfig>,

    #[serde(default)]
    pub metrics: Vec<MetricConfig>,

    #[serde(default)]
    pub alerts: Vec<AlertConfig>,

    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,

    #[serde(default)]
    pub periodic_alarms: Vec<PeriodicAlarmConfig>,

    #[serde(default)]
    pub activations: Vec<ActivationConfig>,

    /// Metric ids evaluated but excluded from reports.
    #[serde(default)]
    pub no_report_metrics: Vec<i64>,

    /// Uids allowed to log to this config.
    #[serde(default)]
    pub allowed_log_uids: Vec<i32>,

    /// Packages allowed to log; resolved through the uid resolver.
    #[serde(default)]
    pub allowed_log_packages: Vec<String>,

    /// Atom ids exempt from the log-source check.
    #[serde(default)]
    pub whitelisted_atom_ids: Vec<i32>,

    /// Packages pullable for any atom.
    #[serde(default)]
    pub default_pull_packages: Vec<String>,

    /// Per-atom pull packages.
    #[serde(default)]
    pub pull_atom_packages: Vec<PullAtomPackagesConfig>,

    /// Drop all state after this long without a refresh. Absent = no TTL.
    #[serde(default, with = "humantime_serde::option")]
    pub ttl: Option<Duration>,

    /// Memory cap for stored metrics, in KiB. Absent = default (2 MiB).
    #[serde(default)]
    pub max_metrics_memory_kb: Option<u32>,

    /// Soft memory threshold that flags a report request, in KiB.
    #[serde(default)]
    pub soft_metrics_memory_kb: Option<u32>,

    #[serde(default)]
    pub persist_locally: bool,

    #[serde(default)]
    pub hash_strings_in_metric_report: bool,

    #[serde(default)]
    pub package_certificate_hash_size_bytes: u8,
}

/// Per-atom pull package list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PullAtomPackagesConfig {
    pub atom_id: i32,
    #[serde(default)]
    pub packages: Vec<String>,
}

// --- Field addressing ---

/// Addresses a field of the subject atom. Flat fields set only `field`;
/// attribution-chain members add `child` and either an explicit `index` or a
/// positional selector.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FieldSpec {
    pub field: u8,

    #[serde(default)]
    pub child: Option<u8>,

    /// Explicit element index for exact addressing of repeated fields.
    #[serde(default)]
    pub index: Option<u8>,

    /// Positional selector; implies `child` addressing.
    #[serde(default)]
    pub position: Option<Position>,
}

impl FieldSpec {
    /// Compile into a matcher over atoms with the given tag.
    pub fn to_matcher(&self, tag: i32) -> FieldMatcher {
        match self.child {
            None => FieldMatcher::exact(Field::new(tag, FieldPath::leaf(self.field))),
            Some(child) => {
                let index = self.index.unwrap_or(1);
                let path = FieldPath::nested(self.field, index, child);
                FieldMatcher::new(
                    Field::new(tag, path),
                    self.position.unwrap_or(Position::Exact),
                )
            }
        }
    }
}

/// Compile a spec list against one atom tag.
pub fn to_matchers(specs: &[FieldSpec], tag: i32) -> Vec<FieldMatcher> {
    specs.iter().map(|s| s.to_matcher(tag)).collect()
}

// --- Matchers ---

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MatcherConfig {
    pub id: i64,
    #[serde(flatten)]
    pub kind: MatcherKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    Simple(SimpleMatcherConfig),
    Combination(MatcherCombinationConfig),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimpleMatcherConfig {
    pub atom_id: i32,

    #[serde(default)]
    pub field_tests: Vec<FieldTestConfig>,

    /// Keep only the first attribution-chain element of this field.
    #[serde(default)]
    pub truncate_attribution_first: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldTestConfig {
    #[serde(flatten)]
    pub field: FieldSpec,

    #[serde(default)]
    pub eq_int: Option<i32>,
    #[serde(default)]
    pub eq_long: Option<i64>,
    #[serde(default)]
    pub eq_string: Option<String>,
    #[serde(default)]
    pub eq_bool: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MatcherCombinationConfig {
    pub operation: Operation,
    pub matcher_ids: Vec<i64>,
}

// --- Predicates ---

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PredicateConfig {
    pub id: i64,
    #[serde(flatten)]
    pub kind: PredicateKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateKind {
    Simple(SimplePredicateConfig),
    Combination(PredicateCombinationConfig),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimplePredicateConfig {
    pub start: Option<i64>,
    #[serde(default)]
    pub stop: Option<i64>,
    #[serde(default)]
    pub stop_all: Option<i64>,

    #[serde(default)]
    pub count_nesting: bool,

    /// Start in the unknown state instead of false.
    #[serde(default)]
    pub initial_unknown: bool,

    /// Output dimensions; present = the condition is sliced.
    #[serde(default)]
    pub dimensions: Vec<FieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PredicateCombinationConfig {
    pub operation: Operation,
    pub predicate_ids: Vec<i64>,
}

// --- States ---

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StateConfig {
    pub atom_id: i32,

    #[serde(default)]
    pub primary_fields: Vec<FieldSpec>,

    pub value_field: FieldSpec,

    /// Optional value→group collapsing.
    #[serde(default)]
    pub groups: Vec<StateGroupConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StateGroupConfig {
    pub group_id: i64,
    pub values: Vec<i64>,
}

impl StateConfig {
    pub fn group_map(&self) -> Option<HashMap<i64, i64>> {
        if self.groups.is_empty() {
            return None;
        }
        let mut map = HashMap::new();
        for group in &self.groups {
            for value in &group.values {
                map.insert(*value, group.group_id);
            }
        }
        Some(map)
    }
}

// --- Metric common pieces ---

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinkConfig {
    pub condition: i64,
    pub fields_in_what: Vec<FieldSpec>,
    pub fields_in_condition: Vec<FieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StateLinkConfig {
    pub state_atom_id: i32,
    pub fields_in_what: Vec<FieldSpec>,
    pub fields_in_state: Vec<FieldSpec>,
}

/// Deterministic dimension sampling knob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct DimensionalSamplingConfig {
    pub shard_count: u32,
}

/// Per-bucket value bound applied at flush.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadThreshold {
    Gt(i64),
    Gte(i64),
    Lt(i64),
    Lte(i64),
}

impl UploadThreshold {
    pub fn passes(&self, value: i64) -> bool {
        match self {
            UploadThreshold::Gt(t) => value > *t,
            UploadThreshold::Gte(t) => value >= *t,
            UploadThreshold::Lt(t) => value < *t,
            UploadThreshold::Lte(t) => value <= *t,
        }
    }
}

fn default_bucket() -> Duration {
    Duration::from_secs(60 * 60)
}

// --- Metrics ---

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricConfig {
    Count(CountMetricConfig),
    Duration(DurationMetricConfig),
    Event(EventMetricConfig),
    Gauge(GaugeMetricConfig),
}

impl MetricConfig {
    pub fn id(&self) -> i64 {
        match self {
            MetricConfig::Count(m) => m.id,
            MetricConfig::Duration(m) => m.id,
            MetricConfig::Event(m) => m.id,
            MetricConfig::Gauge(m) => m.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CountMetricConfig {
    pub id: i64,
    /// Matcher id of the counted events.
    pub what: i64,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default = "default_bucket", with = "humantime_serde")]
    pub bucket: Duration,
    #[serde(default)]
    pub dimensions_in_what: Vec<FieldSpec>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub state_links: Vec<StateLinkConfig>,
    /// State atom ids to slice by.
    #[serde(default)]
    pub sliced_states: Vec<i32>,
    #[serde(default)]
    pub sampling: Option<DimensionalSamplingConfig>,
    #[serde(default)]
    pub max_dimensions_per_bucket: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationAggregation {
    #[default]
    Sum,
    MaxSparse,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DurationMetricConfig {
    pub id: i64,
    /// Predicate id whose true-time is measured; must be simple.
    pub what: i64,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub aggregation: DurationAggregation,
    #[serde(default = "default_bucket", with = "humantime_serde")]
    pub bucket: Duration,
    #[serde(default)]
    pub dimensions_in_what: Vec<FieldSpec>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub state_links: Vec<StateLinkConfig>,
    #[serde(default)]
    pub sliced_states: Vec<i32>,
    #[serde(default)]
    pub threshold: Option<UploadThreshold>,
    #[serde(default)]
    pub sampling: Option<DimensionalSamplingConfig>,
    #[serde(default)]
    pub max_dimensions_per_bucket: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventMetricConfig {
    pub id: i64,
    pub what: i64,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    /// Bernoulli keep-probability in percent, 1-100. Absent = keep all.
    #[serde(default)]
    pub sampling_percentage: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaugeSamplingType {
    #[default]
    RandomOneSample,
    FirstNSamples,
    ConditionChangeToTrue,
}

fn default_max_pull_delay() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GaugeMetricConfig {
    pub id: i64,
    pub what: i64,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default = "default_bucket", with = "humantime_serde")]
    pub bucket: Duration,
    #[serde(default)]
    pub sampling_type: GaugeSamplingType,
    /// The value comes from an external puller instead of the matched atom.
    #[serde(default)]
    pub pulled: bool,
    /// Matcher id that triggers a pull under FIRST_N_SAMPLES.
    #[serde(default)]
    pub trigger_event: Option<i64>,
    #[serde(default)]
    pub dimensions_in_what: Vec<FieldSpec>,
    /// Allowlist of fields to capture; empty captures all.
    #[serde(default)]
    pub gauge_fields: Vec<FieldSpec>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default = "default_max_pull_delay", with = "humantime_serde")]
    pub max_pull_delay: Duration,
    #[serde(default)]
    pub max_gauge_atoms_per_bucket: Option<usize>,
    #[serde(default)]
    pub sampling: Option<DimensionalSamplingConfig>,
    #[serde(default)]
    pub max_dimensions_per_bucket: usize,
}

// --- Alerts, subscriptions, alarms, activations ---

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AlertConfig {
    pub id: i64,
    pub metric_id: i64,
    /// Anomaly threshold on the sliding sum.
    pub trigger_if_sum_gt: i64,
    /// Number of past buckets in the sliding window.
    pub num_buckets: usize,
    #[serde(default, with = "humantime_serde")]
    pub refractory_period: Duration,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionConfig {
    pub id: i64,
    /// Alert or periodic-alarm id this subscription listens to.
    pub rule_id: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PeriodicAlarmConfig {
    pub id: i64,
    #[serde(with = "humantime_serde")]
    pub offset: Duration,
    #[serde(with = "humantime_serde")]
    pub period: Duration,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActivationConfig {
    pub metric_id: i64,
    pub events: Vec<EventActivationConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventActivationConfig {
    pub atom_matcher_id: i64,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(default)]
    pub deactivation_atom_matcher_id: Option<i64>,
}

// --- Validation and loading ---

impl EngineConfig {
    /// Load a configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cfg: EngineConfig =
            serde_yaml::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural sanity checks. Semantic resolution (ids, orderings,
    /// slicing rules) happens at install time with typed reasons.
    pub fn validate(&self) -> Result<()> {
        for matcher in &self.matchers {
            if let MatcherKind::Simple(simple) = &matcher.kind {
                for test in &simple.field_tests {
                    let set = [
                        test.eq_int.is_some(),
                        test.eq_long.is_some(),
                        test.eq_string.is_some(),
                        test.eq_bool.is_some(),
                    ]
                    .iter()
                    .filter(|b| **b)
                    .count();
                    if set != 1 {
                        bail!(
                            "matcher {}: each field test needs exactly one eq_* value",
                            matcher.id
                        );
                    }
                }
            }
        }

        for metric in &self.metrics {
            if let MetricConfig::Event(event) = metric {
                if let Some(pct) = event.sampling_percentage {
                    if pct == 0 || pct > 100 {
                        bail!("metric {}: sampling_percentage must be 1-100", event.id);
                    }
                }
            }
            if let MetricConfig::Gauge(gauge) = metric {
                if gauge.pulled && gauge.max_pull_delay.is_zero() {
                    bail!("metric {}: pulled gauge needs a max_pull_delay", gauge.id);
                }
            }
        }

        for alert in &self.alerts {
            if alert.num_buckets == 0 {
                bail!("alert {}: num_buckets must be > 0", alert.id);
            }
        }

        for alarm in &self.periodic_alarms {
            if alarm.period.is_zero() {
                bail!("periodic alarm {}: period must be > 0", alarm.id);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
id: 12345
allowed_log_uids: [1000, 10001]
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
      count_nesting: true
      dimensions:
        - field: 1
          child: 1
          position: last
metrics:
  - kind: count
    id: 100
    what: 3
    condition: 50
    bucket: 60s
    dimensions_in_what:
      - field: 1
        child: 1
        position: last
  - kind: gauge
    id: 101
    what: 1
    pulled: true
    sampling_type: random_one_sample
    bucket: 5m
alerts:
  - id: 200
    metric_id: 100
    trigger_if_sum_gt: 5
    num_buckets: 1
    refractory_period: 30s
"#;

    #[test]
    fn test_parse_sample_config() {
        let cfg: EngineConfig = serde_yaml::from_str(SAMPLE).expect("parses");
        cfg.validate().expect("valid");

        assert_eq!(cfg.id, 12345);
        assert_eq!(cfg.matchers.len(), 3);
        assert_eq!(cfg.predicates.len(), 1);
        assert_eq!(cfg.metrics.len(), 2);
        assert_eq!(cfg.alerts.len(), 1);

        match &cfg.metrics[0] {
            MetricConfig::Count(count) => {
                assert_eq!(count.bucket, Duration::from_secs(60));
                assert_eq!(count.dimensions_in_what.len(), 1);
            }
            other => panic!("expected count metric, got {other:?}"),
        }

        match &cfg.metrics[1] {
            MetricConfig::Gauge(gauge) => {
                assert!(gauge.pulled);
                assert_eq!(gauge.sampling_type, GaugeSamplingType::RandomOneSample);
                assert_eq!(gauge.max_pull_delay, Duration::from_secs(30));
            }
            other => panic!("expected gauge metric, got {other:?}"),
        }
    }

    #[test]
    fn test_field_spec_to_matcher() {
        let flat = FieldSpec {
            field: 2,
            ..Default::default()
        };
        let m = flat.to_matcher(10);
        assert_eq!(m.position, Position::Exact);
        assert_eq!(m.field.path, FieldPath::leaf(2));

        let chain = FieldSpec {
            field: 1,
            child: Some(1),
            position: Some(Position::Last),
            ..Default::default()
        };
        let m = chain.to_matcher(10);
        assert_eq!(m.position, Position::Last);
        assert_eq!(m.field.path.depth(), 2);
    }

    #[test]
    fn test_validate_rejects_ambiguous_field_test() {
        let yaml = r#"
id: 1
matchers:
  - id: 1
    simple:
      atom_id: 10
      field_tests:
        - field: 2
          eq_int: 1
          eq_string: "x"
"#;
        let cfg: EngineConfig = serde_yaml::from_str(yaml).expect("parses");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_sampling_percentage() {
        let yaml = r#"
id: 1
metrics:
  - kind: event
    id: 5
    what: 1
    sampling_percentage: 101
"#;
        let cfg: EngineConfig = serde_yaml::from_str(yaml).expect("parses");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_bucket_alert() {
        let yaml = r#"
id: 1
alerts:
  - id: 3
    metric_id: 9
    trigger_if_sum_gt: 1
    num_buckets: 0
"#;
        let cfg: EngineConfig = serde_yaml::from_str(yaml).expect("parses");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_state_group_map() {
        let state = StateConfig {
            atom_id: 29,
            primary_fields: vec![],
            value_field: FieldSpec {
                field: 1,
                ..Default::default()
            },
            groups: vec![
                StateGroupConfig {
                    group_id: 100,
                    values: vec![1, 2],
                },
                StateGroupConfig {
                    group_id: 200,
                    values: vec![3],
                },
            ],
        };
        let map = state.group_map().expect("has groups");
        assert_eq!(map.get(&1), Some(&100));
        assert_eq!(map.get(&2), Some(&100));
        assert_eq!(map.get(&3), Some(&200));
    }
}
