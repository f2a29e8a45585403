//! Anomaly detection over past buckets.
//!
//! Each alert keeps a ring of the last N completed bucket values per
//! dimension plus an incrementally maintained per-dimension sum. An anomaly
//! fires when the sum over the window plus the current partial bucket
//! crosses the threshold, outside the dimension's refractory period.
//! Negative bucket values are not supported.

pub mod alarm;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{AlertConfig, SubscriptionConfig};
use crate::dimension::MetricDimensionKey;
use crate::external::{AlarmHandle, AlarmScheduler};
use crate::guardrail::EngineStats;

const NS_PER_SEC: i64 = 1_000_000_000;

/// A declared anomaly, handed to subscribers.
#[derive(Debug, Clone)]
pub struct AnomalySignal {
    pub alert_id: i64,
    pub metric_id: i64,
    pub subscription_ids: Vec<i64>,
    pub dimension: MetricDimensionKey,
    pub metric_value: i64,
    pub timestamp_ns: i64,
}

/// Subscriber callback fired on every declaration.
pub type AnomalySubscriberFn = Arc<dyn Fn(&AnomalySignal) + Send + Sync>;

type DimToValMap = HashMap<MetricDimensionKey, i64>;

/// Sliding-window threshold detector for one alert.
pub struct AnomalyTracker {
    alert: AlertConfig,
    subscriptions: Vec<SubscriptionConfig>,
    subscriber: Option<AnomalySubscriberFn>,
    stats: Arc<EngineStats>,

    /// Number of fully closed buckets in the window; the current partial
    /// bucket is supplied at detection time.
    num_past_buckets: usize,
    /// Ring indexed by bucket number modulo `num_past_buckets`. A `None`
    /// slot holds no data.
    past_buckets: Vec<Option<DimToValMap>>,
    /// Cached sums over `past_buckets`; never holds zero entries.
    sum_over_past: DimToValMap,
    /// Never decreases during the lifetime of a configuration.
    most_recent_bucket_num: i64,

    /// Wall-clock second each dimension's refractory period ends.
    refractory_ends_sec: HashMap<MetricDimensionKey, u32>,

    /// Projected-breach alarms, used by duration metrics only.
    scheduler: Option<Arc<dyn AlarmScheduler>>,
    alarms: HashMap<MetricDimensionKey, (AlarmHandle, i64)>,
}

impl AnomalyTracker {
    pub fn new(
        alert: AlertConfig,
        subscriptions: Vec<SubscriptionConfig>,
        subscriber: Option<AnomalySubscriberFn>,
        stats: Arc<EngineStats>,
    ) -> Self {
        let num_past_buckets = alert.num_buckets.saturating_sub(1);
        AnomalyTracker {
            alert,
            subscriptions,
            subscriber,
            stats,
            num_past_buckets,
            past_buckets: (0..num_past_buckets).map(|_| None).collect(),
            sum_over_past: HashMap::new(),
            most_recent_bucket_num: -1,
            refractory_ends_sec: HashMap::new(),
            scheduler: None,
            alarms: HashMap::new(),
        }
    }

    /// Enable projected-breach alarms; used by duration metrics.
    pub fn with_alarms(mut self, scheduler: Arc<dyn AlarmScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn alert_id(&self) -> i64 {
        self.alert.id
    }

    pub fn threshold(&self) -> i64 {
        self.alert.trigger_if_sum_gt
    }

    pub fn num_past_buckets(&self) -> usize {
        self.num_past_buckets
    }

    fn index(&self, bucket_num: i64) -> usize {
        debug_assert!(bucket_num >= 0);
        (bucket_num as usize) % self.num_past_buckets.max(1)
    }

    /// Record a closed bucket value for one dimension. Advances the window;
    /// intervening buckets are treated as zero.
    pub fn add_past_bucket(&mut self, key: &MetricDimensionKey, value: i64, bucket_num: i64) {
        if self.num_past_buckets == 0 {
            self.advance_most_recent_bucket_to(bucket_num);
            return;
        }
        if bucket_num <= self.most_recent_bucket_num - self.num_past_buckets as i64 {
            debug!(alert = self.alert.id, bucket_num, "bucket too old, ignored");
            return;
        }
        self.advance_most_recent_bucket_to(bucket_num);

        let slot = self.index(bucket_num);
        let bucket = self.past_buckets[slot].get_or_insert_with(HashMap::new);
        if let Some(old) = bucket.insert(key.clone(), value) {
            Self::subtract_value(&mut self.sum_over_past, key, old);
        }
        if value != 0 {
            *self.sum_over_past.entry(key.clone()).or_insert(0) += value;
        }
    }

    /// Advance the window, dropping data that falls out of it.
    fn advance_most_recent_bucket_to(&mut self, bucket_num: i64) {
        if bucket_num <= self.most_recent_bucket_num {
            return;
        }
        if self.num_past_buckets > 0 {
            let start = (self.most_recent_bucket_num + 1)
                .max(bucket_num - self.num_past_buckets as i64 + 1);
            for b in start..=bucket_num {
                let slot = self.index(b);
                if let Some(stale) = self.past_buckets[slot].take() {
                    for (key, value) in stale {
                        Self::subtract_value(&mut self.sum_over_past, &key, value);
                    }
                }
            }
        }
        self.most_recent_bucket_num = bucket_num;
    }

    fn subtract_value(sums: &mut DimToValMap, key: &MetricDimensionKey, value: i64) {
        let Some(entry) = sums.get_mut(key) else {
            panic!("anomaly sum missing entry being subtracted");
        };
        *entry -= value;
        // A negative remainder means the cache and the ring disagree; that
        // is silent corruption, so die instead.
        assert!(*entry >= 0, "anomaly sum underflow");
        if *entry == 0 {
            sums.remove(key);
        }
    }

    /// Sum of the past window for one dimension.
    pub fn sum_over_past_buckets(&self, key: &MetricDimensionKey) -> i64 {
        self.sum_over_past.get(key).copied().unwrap_or(0)
    }

    /// The stored value of one past bucket, zero when absent.
    pub fn past_bucket_value(&self, key: &MetricDimensionKey, bucket_num: i64) -> i64 {
        if self.num_past_buckets == 0
            || bucket_num < 0
            || bucket_num <= self.most_recent_bucket_num - self.num_past_buckets as i64
            || bucket_num > self.most_recent_bucket_num
        {
            return 0;
        }
        self.past_buckets[self.index(bucket_num)]
            .as_ref()
            .and_then(|b| b.get(key))
            .copied()
            .unwrap_or(0)
    }

    /// True when past window + the current partial value crosses the
    /// threshold. Also advances the window to `curr_bucket_num - 1`.
    pub fn detect_anomaly(
        &mut self,
        curr_bucket_num: i64,
        key: &MetricDimensionKey,
        current_bucket_value: i64,
    ) -> bool {
        if curr_bucket_num > self.most_recent_bucket_num + 1 {
            self.advance_most_recent_bucket_to(curr_bucket_num - 1);
        }
        self.sum_over_past_buckets(key) + current_bucket_value > self.alert.trigger_if_sum_gt
    }

    fn refractory_end_sec(&self, key: &MetricDimensionKey) -> u32 {
        self.refractory_ends_sec.get(key).copied().unwrap_or(0)
    }

    fn is_in_refractory(&self, timestamp_ns: i64, key: &MetricDimensionKey) -> bool {
        timestamp_ns < i64::from(self.refractory_end_sec(key)) * NS_PER_SEC
    }

    /// Declare an anomaly for a dimension: start its refractory period and
    /// fire subscriptions. Declarations inside the refractory window are
    /// dropped.
    pub fn declare_anomaly(
        &mut self,
        timestamp_ns: i64,
        metric_id: i64,
        key: &MetricDimensionKey,
        metric_value: i64,
    ) {
        if self.is_in_refractory(timestamp_ns, key) {
            debug!(alert = self.alert.id, "anomaly suppressed by refractory period");
            return;
        }
        let ends_sec = (timestamp_ns + NS_PER_SEC - 1) / NS_PER_SEC
            + self.alert.refractory_period.as_secs() as i64;
        self.refractory_ends_sec.insert(key.clone(), ends_sec as u32);
        self.stats.note_anomaly_declared(self.alert.id);
        info!(
            alert = self.alert.id,
            metric = metric_id,
            value = metric_value,
            "anomaly declared"
        );
        if let Some(subscriber) = &self.subscriber {
            let signal = AnomalySignal {
                alert_id: self.alert.id,
                metric_id,
                subscription_ids: self.subscriptions.iter().map(|s| s.id).collect(),
                dimension: key.clone(),
                metric_value,
                timestamp_ns,
            };
            subscriber(&signal);
        }
    }

    /// Detection plus declaration in one step, the per-event entry point.
    pub fn detect_and_declare(
        &mut self,
        timestamp_ns: i64,
        curr_bucket_num: i64,
        metric_id: i64,
        key: &MetricDimensionKey,
        current_bucket_value: i64,
    ) {
        if self.detect_anomaly(curr_bucket_num, key, current_bucket_value) {
            self.declare_anomaly(timestamp_ns, metric_id, key, current_bucket_value);
        }
    }

    // --- Alarm support (duration metrics) ---

    /// Schedule (or replace) the projected-breach alarm for a dimension.
    pub fn start_alarm(&mut self, key: &MetricDimensionKey, deadline_ns: i64) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        if let Some((handle, _)) = self.alarms.remove(key) {
            scheduler.cancel_alarm(handle);
        }
        let handle = scheduler.set_alarm(deadline_ns);
        self.alarms.insert(key.clone(), (handle, deadline_ns));
    }

    /// Cancel a dimension's alarm. If it should already have fired, declare
    /// now instead of dropping the detection.
    pub fn stop_alarm(&mut self, metric_id: i64, key: &MetricDimensionKey, timestamp_ns: i64) {
        let Some((handle, deadline_ns)) = self.alarms.remove(key) else {
            return;
        };
        if let Some(scheduler) = &self.scheduler {
            scheduler.cancel_alarm(handle);
        }
        if deadline_ns <= timestamp_ns {
            self.declare_anomaly(timestamp_ns, metric_id, key, self.alert.trigger_if_sum_gt + 1);
        }
    }

    /// Drop all alarms without declaring anything.
    pub fn cancel_all_alarms(&mut self) {
        if let Some(scheduler) = &self.scheduler {
            for (_, (handle, _)) in self.alarms.drain() {
                scheduler.cancel_alarm(handle);
            }
        } else {
            self.alarms.clear();
        }
    }

    /// Declare an anomaly for every owned alarm present in `fired`, removing
    /// the matched handles from the set.
    pub fn inform_alarms_fired(
        &mut self,
        timestamp_ns: i64,
        metric_id: i64,
        fired: &mut Vec<AlarmHandle>,
    ) {
        let mine: Vec<MetricDimensionKey> = self
            .alarms
            .iter()
            .filter(|(_, (handle, _))| fired.contains(handle))
            .map(|(key, _)| key.clone())
            .collect();
        for key in mine {
            if let Some((handle, _)) = self.alarms.remove(&key) {
                fired.retain(|h| *h != handle);
                self.declare_anomaly(
                    timestamp_ns,
                    metric_id,
                    &key,
                    self.alert.trigger_if_sum_gt + 1,
                );
            }
        }
    }

    pub fn has_alarms(&self) -> bool {
        !self.alarms.is_empty()
    }

    // --- Persisted metadata ---

    /// Refractory ends still in the future, as (dimension, wall-clock end).
    pub fn snapshot_refractory(
        &self,
        now_wall_sec: u32,
    ) -> Vec<(MetricDimensionKey, u32)> {
        self.refractory_ends_sec
            .iter()
            .filter(|(_, end)| **end > now_wall_sec)
            .map(|(k, end)| (k.clone(), *end))
            .collect()
    }

    pub fn load_refractory(&mut self, entries: Vec<(MetricDimensionKey, u32)>) {
        for (key, end) in entries {
            self.refractory_ends_sec.insert(key, end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn alert(threshold: i64, num_buckets: usize, refractory_sec: u64) -> AlertConfig {
        AlertConfig {
            id: 7,
            metric_id: 100,
            trigger_if_sum_gt: threshold,
            num_buckets,
            refractory_period: Duration::from_secs(refractory_sec),
        }
    }

    fn tracker(threshold: i64, num_buckets: usize, refractory_sec: u64) -> AnomalyTracker {
        AnomalyTracker::new(
            alert(threshold, num_buckets, refractory_sec),
            vec![],
            None,
            Arc::new(EngineStats::new()),
        )
    }

    fn key(uid: i32) -> MetricDimensionKey {
        use crate::dimension::DimensionKey;
        use crate::field::{Field, FieldPath, FieldValue, Value};
        MetricDimensionKey::new(
            DimensionKey::new(vec![FieldValue::new(
                Field::new(10, FieldPath::leaf(1)),
                Value::Int(uid),
            )]),
            DimensionKey::empty(),
        )
    }

    #[test]
    fn test_sum_tracks_ring_contents() {
        let mut t = tracker(100, 4, 0);
        let k = key(1);
        t.add_past_bucket(&k, 5, 0);
        t.add_past_bucket(&k, 7, 1);
        t.add_past_bucket(&k, 2, 2);
        assert_eq!(t.sum_over_past_buckets(&k), 14);

        // Sum invariant: cache equals a scan of the stored buckets.
        let scanned: i64 = (0..=2).map(|b| t.past_bucket_value(&k, b)).sum();
        assert_eq!(scanned, t.sum_over_past_buckets(&k));
    }

    #[test]
    fn test_window_slides_and_drops_old_buckets() {
        let mut t = tracker(100, 3, 0); // window of 2 past buckets
        let k = key(1);
        t.add_past_bucket(&k, 5, 0);
        t.add_past_bucket(&k, 7, 1);
        assert_eq!(t.sum_over_past_buckets(&k), 12);

        // Bucket 2 evicts bucket 0.
        t.add_past_bucket(&k, 1, 2);
        assert_eq!(t.sum_over_past_buckets(&k), 8);
        assert_eq!(t.past_bucket_value(&k, 0), 0);
        assert_eq!(t.past_bucket_value(&k, 1), 7);
        assert_eq!(t.past_bucket_value(&k, 2), 1);
    }

    #[test]
    fn test_sparse_buckets_zero_fill() {
        let mut t = tracker(100, 4, 0);
        let k = key(1);
        t.add_past_bucket(&k, 5, 0);
        // Jump several buckets forward; intervening slots read as zero.
        t.add_past_bucket(&k, 3, 5);
        assert_eq!(t.sum_over_past_buckets(&k), 3);
        assert_eq!(t.past_bucket_value(&k, 4), 0);
    }

    #[test]
    fn test_most_recent_bucket_never_decreases() {
        let mut t = tracker(100, 3, 0);
        let k = key(1);
        t.add_past_bucket(&k, 5, 4);
        assert_eq!(t.most_recent_bucket_num, 4);
        // Late out-of-window data is ignored.
        t.add_past_bucket(&k, 9, 1);
        assert_eq!(t.most_recent_bucket_num, 4);
        assert_eq!(t.sum_over_past_buckets(&k), 5);
    }

    #[test]
    fn test_detection_includes_current_partial() {
        let mut t = tracker(10, 2, 0);
        let k = key(1);
        t.add_past_bucket(&k, 6, 0);
        assert!(!t.detect_anomaly(1, &k, 4)); // 6 + 4 == threshold, not over
        assert!(t.detect_anomaly(1, &k, 5)); // 6 + 5 > 10
    }

    #[test]
    fn test_single_bucket_window() {
        let mut t = tracker(5, 1, 0);
        let k = key(1);
        assert!(!t.detect_anomaly(0, &k, 5));
        assert!(t.detect_anomaly(0, &k, 6));
    }

    #[test]
    fn test_refractory_suppression_and_expiry() {
        let fired: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let fired_clone = Arc::clone(&fired);
        let subscriber: AnomalySubscriberFn = Arc::new(move |signal: &AnomalySignal| {
            fired_clone.lock().push(signal.timestamp_ns);
        });
        let mut t = AnomalyTracker::new(
            alert(5, 1, 30),
            vec![],
            Some(subscriber),
            Arc::new(EngineStats::new()),
        );
        let k = key(1);

        // t=10s: value 6 > 5, declared; refractory ends at 40s.
        t.detect_and_declare(10 * NS_PER_SEC, 0, 100, &k, 6);
        // t=70s: refractory elapsed, declared again.
        t.detect_and_declare(70 * NS_PER_SEC, 1, 100, &k, 7);
        // t=80s: inside the new refractory window (until 100s), suppressed.
        t.detect_and_declare(80 * NS_PER_SEC, 1, 100, &k, 6);

        assert_eq!(*fired.lock(), vec![10 * NS_PER_SEC, 70 * NS_PER_SEC]);
    }

    #[test]
    fn test_alarms_fire_and_declare() {
        use crate::external::FakeAlarmScheduler;
        let scheduler = FakeAlarmScheduler::new();
        let stats = Arc::new(EngineStats::new());
        let mut t = AnomalyTracker::new(alert(5, 1, 0), vec![], None, Arc::clone(&stats))
            .with_alarms(scheduler.clone());
        let k = key(1);

        t.start_alarm(&k, 50 * NS_PER_SEC);
        assert!(t.has_alarms());

        let mut fired = scheduler.fire_due(60 * NS_PER_SEC);
        assert_eq!(fired.len(), 1);
        t.inform_alarms_fired(60 * NS_PER_SEC, 100, &mut fired);
        assert!(fired.is_empty());
        assert!(!t.has_alarms());
        assert_eq!(stats.anomalies_declared_count(7), 1);
    }

    #[test]
    fn test_stop_alarm_declares_when_overdue() {
        use crate::external::FakeAlarmScheduler;
        let scheduler = FakeAlarmScheduler::new();
        let stats = Arc::new(EngineStats::new());
        let mut t = AnomalyTracker::new(alert(5, 1, 0), vec![], None, Arc::clone(&stats))
            .with_alarms(scheduler.clone());
        let k = key(1);

        t.start_alarm(&k, 50 * NS_PER_SEC);
        // The alarm service is late; the stop at t=55 must still declare.
        t.stop_alarm(100, &k, 55 * NS_PER_SEC);
        assert_eq!(stats.anomalies_declared_count(7), 1);

        t.start_alarm(&k, 200 * NS_PER_SEC);
        t.stop_alarm(100, &k, 100 * NS_PER_SEC);
        assert_eq!(stats.anomalies_declared_count(7), 1);
        assert!(scheduler.outstanding().is_empty());
    }

    #[test]
    fn test_refractory_snapshot_roundtrip() {
        let mut t = tracker(5, 1, 30);
        let k = key(1);
        t.declare_anomaly(10 * NS_PER_SEC, 100, &k, 6);

        let snapshot = t.snapshot_refractory(20);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].1, 40);

        // Expired entries are not persisted.
        assert!(t.snapshot_refractory(50).is_empty());

        let mut fresh = tracker(5, 1, 30);
        fresh.load_refractory(snapshot);
        assert!(fresh.is_in_refractory(35 * NS_PER_SEC, &k));
        assert!(!fresh.is_in_refractory(45 * NS_PER_SEC, &k));
    }
}
