//! Per-configuration metric driver.
//!
//! One manager owns everything derived from a single configuration and fans
//! each atom through matcher filtering, condition evaluation, and metric
//! notification. Managers are independent failure domains; nothing here
//! reaches across configurations.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::condition::{evaluate_condition, ConditionState, ConditionWizard};
use crate::config::{ConfigKey, EngineConfig};
use crate::external::{AlarmHandle, UidResolver};
use crate::field::Atom;
use crate::guardrail::{
    DEFAULT_MAX_METRICS_BYTES, DEFAULT_SOFT_METRICS_BYTES, HARD_MAX_METRICS_BYTES,
    HARD_SOFT_METRICS_BYTES, MAX_LOG_SOURCE_COUNT,
};
use crate::matcher::{evaluate_matcher, MatchingState};
use crate::metrics::init::{
    build_artifacts, update_artifacts, EngineArtifacts, InitDeps, InvalidConfigReason,
};
use crate::metrics::DispatchContext;
use crate::report::ConfigReport;
use crate::snapshot::{ActiveMetricSnapshot, AlertSnapshot, ConfigSnapshot};

/// Uid of the root user; always allowed to log.
const ROOT_UID: i32 = 0;
/// Pre-installed system services log from this uid range.
const SYSTEM_UID_START: i32 = 1000;
const SYSTEM_UID_END: i32 = 2000;

pub struct MetricsManager {
    config_key: ConfigKey,
    config: EngineConfig,
    artifacts: EngineArtifacts,
    deps: InitDeps,
    uid_resolver: Option<Arc<dyn UidResolver>>,
    invalid_reason: Option<InvalidConfigReason>,

    /// Resolved uids allowed to log; guarded separately because uid-map
    /// snapshots rebuild it independently of ingestion.
    allowed_log_sources: Mutex<HashSet<i32>>,
    whitelisted_atoms: HashSet<i32>,

    time_base_ns: i64,
    ttl_ns: Option<i64>,
    ttl_end_ns: i64,
    last_report_time_ns: i64,
    last_report_wall_ns: i64,

    max_metrics_bytes: usize,
    soft_metrics_bytes: usize,
    soft_limit_flagged: bool,

    is_active: bool,
    is_always_active: bool,
}

impl MetricsManager {
    pub fn new(
        config_key: ConfigKey,
        config: EngineConfig,
        time_base_ns: i64,
        now_ns: i64,
        deps: InitDeps,
        uid_resolver: Option<Arc<dyn UidResolver>>,
    ) -> Self {
        let (artifacts, invalid_reason) = match build_artifacts(&config, time_base_ns, now_ns, &deps)
        {
            Ok(artifacts) => (artifacts, None),
            Err(reason) => {
                warn!(config = %config_key, %reason, "invalid configuration");
                (empty_artifacts(), Some(reason))
            }
        };
        deps.stats.note_config_received(invalid_reason.is_none());

        let mut manager = MetricsManager {
            config_key,
            whitelisted_atoms: config.whitelisted_atom_ids.iter().copied().collect(),
            ttl_ns: config.ttl.map(|d| d.as_nanos() as i64),
            max_metrics_bytes: clamp_memory(
                config.max_metrics_memory_kb,
                DEFAULT_MAX_METRICS_BYTES,
                HARD_MAX_METRICS_BYTES,
            ),
            soft_metrics_bytes: clamp_memory(
                config.soft_metrics_memory_kb,
                DEFAULT_SOFT_METRICS_BYTES,
                HARD_SOFT_METRICS_BYTES,
            ),
            config,
            artifacts,
            deps,
            uid_resolver,
            invalid_reason,
            allowed_log_sources: Mutex::new(HashSet::new()),
            time_base_ns,
            ttl_end_ns: -1,
            last_report_time_ns: now_ns,
            last_report_wall_ns: 0,
            soft_limit_flagged: false,
            is_active: false,
            is_always_active: false,
        };
        manager.refresh_ttl(time_base_ns);
        manager.init_allowed_log_sources();
        manager.initialize_active_status();
        manager
    }

    /// Register pulled tags with the puller and fetch first samples.
    pub fn init(&mut self, now_ns: i64) {
        if let Some(puller) = &self.deps.puller {
            for producer in &self.artifacts.producers {
                if let crate::metrics::MetricProducer::Gauge(gauge) = producer {
                    if let Some(tag) = gauge.pull_tag() {
                        puller.register_receiver(tag, gauge.core.bucket_size_ns);
                    }
                }
            }
        }
        let EngineArtifacts {
            producers,
            conditions,
            states,
            matchers,
            ..
        } = &mut self.artifacts;
        let ctx = DispatchContext {
            wizard: ConditionWizard::new(conditions),
            states,
            matchers,
        };
        for producer in producers.iter_mut() {
            producer.prepare_first_bucket(now_ns, ctx);
        }
    }

    pub fn config_key(&self) -> ConfigKey {
        self.config_key
    }

    pub fn is_config_valid(&self) -> bool {
        self.invalid_reason.is_none()
    }

    pub fn invalid_reason(&self) -> Option<&InvalidConfigReason> {
        self.invalid_reason.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn num_metrics(&self) -> usize {
        self.artifacts.producers.len()
    }

    pub fn should_persist_history(&self) -> bool {
        self.config.persist_locally
    }

    pub fn is_in_ttl(&self, timestamp_ns: i64) -> bool {
        self.ttl_ns.is_none() || timestamp_ns < self.ttl_end_ns
    }

    /// Elapsed time of the last report dump, or of installation when no
    /// report has been dumped yet.
    pub fn last_report_time_ns(&self) -> i64 {
        self.last_report_time_ns
    }

    pub fn last_report_wall_clock_ns(&self) -> i64 {
        self.last_report_wall_ns
    }

    pub fn refresh_ttl(&mut self, now_ns: i64) {
        if let Some(ttl) = self.ttl_ns {
            self.ttl_end_ns = now_ns + ttl;
        }
    }

    /// Tag ids this configuration is interested in, for upstream filtering.
    pub fn interested_tags(&self) -> Vec<i32> {
        let mut tags: Vec<i32> = self.artifacts.tag_to_matchers.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    fn initialize_active_status(&mut self) {
        self.is_always_active = self.artifacts.metrics_with_activation.len()
            != self.artifacts.producers.len()
            || self.artifacts.producers.is_empty();
        self.is_active = self.is_always_active
            || self
                .artifacts
                .metrics_with_activation
                .iter()
                .any(|&idx| self.artifacts.producers[idx].is_active());
    }

    fn init_allowed_log_sources(&mut self) {
        if self.config.allowed_log_uids.len() + self.config.allowed_log_packages.len()
            > MAX_LOG_SOURCE_COUNT
        {
            warn!(config = %self.config_key, "too many log sources");
            self.invalid_reason
                .get_or_insert(InvalidConfigReason::TooManyLogSources);
            return;
        }
        let mut sources: HashSet<i32> = self.config.allowed_log_uids.iter().copied().collect();
        if let Some(resolver) = &self.uid_resolver {
            for package in &self.config.allowed_log_packages {
                sources.extend(resolver.uids_for_package(package));
            }
        }
        *self.allowed_log_sources.lock() = sources;
    }

    /// Rebuild uid-derived tables after a uid-map snapshot. Producers are
    /// deliberately not notified; no partial buckets are cut.
    pub fn on_uid_map_received(&mut self) {
        if self.config.allowed_log_packages.is_empty() {
            return;
        }
        self.init_allowed_log_sources();
    }

    fn check_log_credentials(&self, atom: &Atom) -> bool {
        if self.whitelisted_atoms.contains(&atom.tag()) {
            return true;
        }
        let uid = atom.source_uid();
        if uid == ROOT_UID || (SYSTEM_UID_START..SYSTEM_UID_END).contains(&uid) {
            return true;
        }
        let allowed = self.allowed_log_sources.lock();
        if allowed.is_empty() {
            // No allow-list configured: accept everything.
            return true;
        }
        allowed.contains(&uid)
    }

    /// The ingestion entry point: fan one atom through the pipeline.
    pub fn on_atom(&mut self, atom: &Atom) {
        if !self.is_config_valid() {
            return;
        }
        if !self.check_log_credentials(atom) {
            debug!(uid = atom.source_uid(), "log source not allowed");
            self.deps.stats.note_log_source_dropped();
            return;
        }

        let tag = atom.tag();
        let event_ns = atom.elapsed_ns();

        // Slicing states update before anything that might read them.
        if self.artifacts.states.is_state_atom(tag) {
            if let Some(change) = self.artifacts.states.on_atom(atom) {
                if let Some(interested) = self.artifacts.state_atom_to_metrics.get(&tag) {
                    for &metric_idx in interested {
                        self.artifacts.producers[metric_idx].on_state_changed(
                            event_ns,
                            tag,
                            &change.primary_key,
                            &change.new_value,
                        );
                    }
                }
            }
        }

        // Refresh activation windows as of this event.
        let mut active_metrics: HashSet<usize> = HashSet::new();
        for &metric_idx in &self.artifacts.metrics_with_activation {
            if self.artifacts.producers[metric_idx].flush_if_expire(event_ns) {
                active_metrics.insert(metric_idx);
            }
        }
        self.is_active = self.is_always_active || !active_metrics.is_empty();

        let Some(matcher_indices) = self.artifacts.tag_to_matchers.get(&tag) else {
            return;
        };

        let matcher_count = self.artifacts.matchers.len();
        let mut matcher_cache = vec![MatchingState::NotComputed; matcher_count];
        let mut transformed = vec![None; matcher_count];
        for &matcher_idx in matcher_indices {
            evaluate_matcher(
                &self.artifacts.matchers,
                matcher_idx,
                atom,
                &mut matcher_cache,
                &mut transformed,
            );
        }

        // Activation cancellations, then activations.
        let mut cancelled: HashSet<usize> = HashSet::new();
        for (&matcher_idx, metric_list) in &self.artifacts.deactivation_to_metric {
            if matcher_cache[matcher_idx] == MatchingState::Matched {
                for &metric_idx in metric_list {
                    self.artifacts.producers[metric_idx]
                        .cancel_event_activation(matcher_idx, event_ns);
                    cancelled.insert(metric_idx);
                }
            }
        }
        for metric_idx in cancelled {
            if !self.artifacts.producers[metric_idx].flush_if_expire(event_ns) {
                active_metrics.remove(&metric_idx);
            }
        }
        for (&matcher_idx, metric_list) in &self.artifacts.activation_to_metric {
            if matcher_cache[matcher_idx] == MatchingState::Matched {
                for &metric_idx in metric_list {
                    self.artifacts.producers[metric_idx].activate(matcher_idx, event_ns);
                    if self.artifacts.producers[metric_idx].is_active() {
                        active_metrics.insert(metric_idx);
                    }
                }
            }
        }
        self.is_active = self.is_always_active || !active_metrics.is_empty();

        // Conditions whose inputs matched are re-evaluated.
        let condition_count = self.artifacts.conditions.len();
        let mut to_evaluate = vec![false; condition_count];
        let mut condition_events: Vec<Option<Arc<Atom>>> = vec![None; condition_count];
        for (&matcher_idx, condition_list) in &self.artifacts.tracker_to_condition {
            if matcher_cache[matcher_idx] == MatchingState::Matched {
                for &condition_idx in condition_list {
                    to_evaluate[condition_idx] = true;
                    if condition_events[condition_idx].is_none() {
                        condition_events[condition_idx] = transformed[matcher_idx].clone();
                    }
                }
            }
        }

        let mut condition_cache = vec![ConditionState::NotEvaluated; condition_count];
        let mut changed = vec![false; condition_count];
        for condition_idx in 0..condition_count {
            if !to_evaluate[condition_idx] {
                continue;
            }
            let event = condition_events[condition_idx]
                .as_deref()
                .unwrap_or(atom);
            evaluate_condition(
                &mut self.artifacts.conditions,
                condition_idx,
                event,
                &matcher_cache,
                &mut condition_cache,
                &mut changed,
            );
        }

        // Push condition changes to the metrics that use them.
        {
            let EngineArtifacts {
                producers,
                conditions,
                states,
                matchers,
                condition_to_metric,
                tracker_to_metric,
                ..
            } = &mut self.artifacts;
            let ctx = DispatchContext {
                wizard: ConditionWizard::new(conditions),
                states,
                matchers,
            };
            for (condition_idx, condition_changed) in changed.iter().enumerate() {
                if !*condition_changed {
                    continue;
                }
                let Some(metric_list) = condition_to_metric.get(&condition_idx) else {
                    continue;
                };
                for &metric_idx in metric_list {
                    if producers[metric_idx].is_condition_sliced() {
                        producers[metric_idx].on_sliced_condition_may_change(event_ns, ctx);
                    } else {
                        producers[metric_idx].on_condition_changed(
                            condition_cache[condition_idx].is_true(),
                            event_ns,
                            ctx,
                        );
                    }
                }
            }

            // Deliver matched events to their metrics.
            for matcher_idx in 0..matcher_count {
                if matcher_cache[matcher_idx] != MatchingState::Matched {
                    continue;
                }
                self.deps
                    .stats
                    .note_matcher_matched(matchers[matcher_idx].id());
                let Some(metric_list) = tracker_to_metric.get(&matcher_idx) else {
                    continue;
                };
                let event = transformed[matcher_idx].as_deref().unwrap_or(atom);
                for &metric_idx in metric_list {
                    producers[metric_idx].on_matched_event(matcher_idx, event, ctx);
                }
            }
        }

        self.enforce_memory_limits(event_ns);
    }

    /// Route pulled atoms to the gauge metrics registered for this tag.
    pub fn on_pull_completed(&mut self, tag: i32, atoms: &[Atom], timestamp_ns: i64) {
        if !self.is_config_valid() {
            return;
        }
        let EngineArtifacts {
            producers,
            conditions,
            states,
            matchers,
            ..
        } = &mut self.artifacts;
        let ctx = DispatchContext {
            wizard: ConditionWizard::new(conditions),
            states,
            matchers,
        };
        for producer in producers.iter_mut() {
            if let crate::metrics::MetricProducer::Gauge(gauge) = producer {
                if gauge.pull_tag() == Some(tag) {
                    gauge.on_pulled_atoms(atoms, timestamp_ns, ctx);
                }
            }
        }
    }

    /// Anomaly-alarm fan-out; matched handles are consumed from `fired`.
    pub fn on_anomaly_alarms_fired(&mut self, timestamp_ns: i64, fired: &mut Vec<AlarmHandle>) {
        for producer in &mut self.artifacts.producers {
            let metric_id = producer.metric_id();
            for tracker in producer.anomaly_trackers_mut() {
                tracker.inform_alarms_fired(timestamp_ns, metric_id, fired);
            }
        }
    }

    /// Periodic-alarm fan-out; returns fired subscription ids.
    pub fn on_periodic_alarms_fired(
        &mut self,
        timestamp_ns: i64,
        fired: &mut Vec<AlarmHandle>,
    ) -> Vec<i64> {
        let mut subscriptions = Vec::new();
        for alarm in &mut self.artifacts.periodic_alarms {
            subscriptions.extend(alarm.inform_alarms_fired(timestamp_ns, fired));
        }
        subscriptions
    }

    /// Force partial buckets closed, e.g. around system reconfiguration.
    pub fn notify_flush_boundary(&mut self, timestamp_ns: i64) {
        let EngineArtifacts {
            producers,
            conditions,
            states,
            matchers,
            ..
        } = &mut self.artifacts;
        let ctx = DispatchContext {
            wizard: ConditionWizard::new(conditions),
            states,
            matchers,
        };
        for producer in producers.iter_mut() {
            producer.notify_flush_boundary(timestamp_ns, ctx);
        }
    }

    /// Produce the configuration's report.
    pub fn dump_report(
        &mut self,
        dump_ns: i64,
        wall_clock_ns: i64,
        include_current_partial: bool,
        erase_data: bool,
    ) -> ConfigReport {
        let hash_strings = self.config.hash_strings_in_metric_report;
        let mut reports = Vec::with_capacity(self.artifacts.producers.len());
        for producer in &mut self.artifacts.producers {
            if self
                .artifacts
                .no_report_metric_ids
                .contains(&producer.metric_id())
            {
                producer.clear_past_buckets(dump_ns);
                continue;
            }
            reports.push(producer.dump_report(
                dump_ns,
                include_current_partial,
                erase_data,
                hash_strings,
            ));
        }
        let report = ConfigReport {
            config_id: self.config.id,
            last_report_elapsed_ns: self.last_report_time_ns,
            current_report_elapsed_ns: dump_ns,
            reports,
        };
        if erase_data {
            self.last_report_time_ns = dump_ns;
            self.last_report_wall_ns = wall_clock_ns;
        }
        self.refresh_ttl(dump_ns);
        report
    }

    /// Discard all report data without dumping.
    pub fn drop_data(&mut self, timestamp_ns: i64) {
        for producer in &mut self.artifacts.producers {
            producer.drop_data(timestamp_ns);
        }
    }

    pub fn byte_size(&self) -> usize {
        self.artifacts.producers.iter().map(|p| p.byte_size()).sum()
    }

    fn enforce_memory_limits(&mut self, timestamp_ns: i64) {
        let size = self.byte_size();
        if size > self.max_metrics_bytes {
            warn!(
                config = %self.config_key,
                size,
                "memory cap exceeded, dropping stored metrics"
            );
            self.drop_data(timestamp_ns);
            self.soft_limit_flagged = false;
        } else if size > self.soft_metrics_bytes && !self.soft_limit_flagged {
            info!(config = %self.config_key, size, "soft memory threshold crossed");
            self.soft_limit_flagged = true;
        }
    }

    /// Swap in a new configuration, preserving unchanged sections.
    pub fn update_config(&mut self, config: EngineConfig, now_ns: i64) -> bool {
        let old_artifacts = std::mem::replace(&mut self.artifacts, empty_artifacts());
        match update_artifacts(
            &self.config,
            old_artifacts,
            &config,
            self.time_base_ns,
            now_ns,
            &self.deps,
        ) {
            Ok(artifacts) => {
                self.artifacts = artifacts;
                self.invalid_reason = None;
            }
            Err(reason) => {
                warn!(config = %self.config_key, %reason, "invalid configuration update");
                self.invalid_reason = Some(reason);
            }
        }
        self.deps
            .stats
            .note_config_received(self.invalid_reason.is_none());

        self.whitelisted_atoms = config.whitelisted_atom_ids.iter().copied().collect();
        self.ttl_ns = config.ttl.map(|d| d.as_nanos() as i64);
        self.max_metrics_bytes = clamp_memory(
            config.max_metrics_memory_kb,
            DEFAULT_MAX_METRICS_BYTES,
            HARD_MAX_METRICS_BYTES,
        );
        self.soft_metrics_bytes = clamp_memory(
            config.soft_metrics_memory_kb,
            DEFAULT_SOFT_METRICS_BYTES,
            HARD_SOFT_METRICS_BYTES,
        );
        self.config = config;
        self.refresh_ttl(now_ns);
        self.init_allowed_log_sources();
        self.initialize_active_status();
        self.is_config_valid()
    }

    /// Cancel everything owned by this configuration before removal.
    pub fn tear_down(&mut self) {
        if let Some(puller) = &self.deps.puller {
            for producer in &self.artifacts.producers {
                if let crate::metrics::MetricProducer::Gauge(gauge) = producer {
                    if let Some(tag) = gauge.pull_tag() {
                        puller.unregister_receiver(tag);
                    }
                }
            }
        }
        for producer in &mut self.artifacts.producers {
            producer.cancel_all_alarms();
        }
        for alarm in &mut self.artifacts.periodic_alarms {
            alarm.cancel();
        }
    }

    // --- Persisted state ---

    /// Snapshot activation TTLs and alert refractory periods.
    pub fn write_snapshot(&self, now_ns: i64, now_wall_sec: u32) -> ConfigSnapshot {
        let mut active_metrics = Vec::new();
        for &metric_idx in &self.artifacts.metrics_with_activation {
            let producer = &self.artifacts.producers[metric_idx];
            let entries = producer.core().activations.snapshot(now_ns);
            if !entries.is_empty() {
                active_metrics.push(ActiveMetricSnapshot {
                    metric_id: producer.metric_id(),
                    activations: entries,
                });
            }
        }

        let mut alerts = Vec::new();
        for producer in &self.artifacts.producers {
            let trackers = match producer {
                crate::metrics::MetricProducer::Count(p) => &p.anomaly_trackers,
                crate::metrics::MetricProducer::Duration(p) => &p.anomaly_trackers,
                crate::metrics::MetricProducer::Gauge(p) => &p.anomaly_trackers,
                crate::metrics::MetricProducer::Event(_) => continue,
            };
            for tracker in trackers {
                let refractory = tracker.snapshot_refractory(now_wall_sec);
                if !refractory.is_empty() {
                    alerts.push(AlertSnapshot {
                        alert_id: tracker.alert_id(),
                        refractory_ends_sec: refractory,
                    });
                }
            }
        }

        ConfigSnapshot {
            config_id: self.config.id,
            active_metrics,
            alerts,
        }
    }

    /// Restore a snapshot written by [`write_snapshot`].
    pub fn load_snapshot(&mut self, snapshot: &ConfigSnapshot, now_ns: i64) {
        for active in &snapshot.active_metrics {
            if let Some(&metric_idx) = self.artifacts.metric_map.get(&active.metric_id) {
                self.artifacts.producers[metric_idx]
                    .core_mut()
                    .activations
                    .load(&active.activations, now_ns);
            }
        }
        for alert in &snapshot.alerts {
            if let Some(&metric_idx) = self.artifacts.alert_map.get(&alert.alert_id) {
                for tracker in self.artifacts.producers[metric_idx].anomaly_trackers_mut() {
                    if tracker.alert_id() == alert.alert_id {
                        tracker.load_refractory(alert.refractory_ends_sec.clone());
                    }
                }
            }
        }
        self.initialize_active_status();
    }
}

fn clamp_memory(configured_kb: Option<u32>, default_bytes: usize, hard_bytes: usize) -> usize {
    match configured_kb {
        None => default_bytes,
        Some(kb) => {
            let bytes = kb as usize * 1024;
            if bytes == 0 || bytes > hard_bytes {
                warn!("memory limit out of range, using default");
                default_bytes
            } else {
                bytes
            }
        }
    }
}

fn empty_artifacts() -> EngineArtifacts {
    EngineArtifacts {
        matchers: Vec::new(),
        matcher_map: Default::default(),
        tag_to_matchers: Default::default(),
        conditions: Vec::new(),
        condition_map: Default::default(),
        tracker_to_condition: Default::default(),
        producers: Vec::new(),
        metric_map: Default::default(),
        tracker_to_metric: Default::default(),
        condition_to_metric: Default::default(),
        activation_to_metric: Default::default(),
        deactivation_to_metric: Default::default(),
        metrics_with_activation: Vec::new(),
        states: crate::state::StateManager::new(),
        state_atom_to_metrics: Default::default(),
        periodic_alarms: Vec::new(),
        alert_map: Default::default(),
        no_report_metric_ids: Default::default(),
    }
}
