//! Periodic wall-clock alarms.

use std::sync::Arc;

use tracing::debug;

use crate::config::{PeriodicAlarmConfig, SubscriptionConfig};
use crate::external::{AlarmHandle, AlarmScheduler};

/// Fires its subscriptions at `time_base + offset + k * period`. The alarm
/// service owns the clock; this tracker only keeps the schedule and the
/// outstanding handle.
pub struct PeriodicAlarmTracker {
    config: PeriodicAlarmConfig,
    subscriptions: Vec<SubscriptionConfig>,
    scheduler: Arc<dyn AlarmScheduler>,
    next_deadline_ns: i64,
    handle: Option<AlarmHandle>,
}

impl PeriodicAlarmTracker {
    pub fn new(
        config: PeriodicAlarmConfig,
        subscriptions: Vec<SubscriptionConfig>,
        time_base_ns: i64,
        scheduler: Arc<dyn AlarmScheduler>,
    ) -> Self {
        let next_deadline_ns = time_base_ns + config.offset.as_nanos() as i64;
        let handle = Some(scheduler.set_alarm(next_deadline_ns));
        PeriodicAlarmTracker {
            config,
            subscriptions,
            scheduler,
            next_deadline_ns,
            handle,
        }
    }

    pub fn id(&self) -> i64 {
        self.config.id
    }

    pub fn next_deadline_ns(&self) -> i64 {
        self.next_deadline_ns
    }

    /// Consume fired handles. Returns the subscription ids to notify when
    /// our alarm was among them, rescheduling the next period.
    pub fn inform_alarms_fired(
        &mut self,
        timestamp_ns: i64,
        fired: &mut Vec<AlarmHandle>,
    ) -> Vec<i64> {
        let Some(handle) = self.handle else {
            return Vec::new();
        };
        if !fired.contains(&handle) {
            return Vec::new();
        }
        fired.retain(|h| *h != handle);

        // Skip any periods missed while the service was delayed.
        let period_ns = self.config.period.as_nanos() as i64;
        while self.next_deadline_ns <= timestamp_ns {
            self.next_deadline_ns += period_ns;
        }
        self.handle = Some(self.scheduler.set_alarm(self.next_deadline_ns));
        debug!(
            alarm = self.config.id,
            next = self.next_deadline_ns,
            "periodic alarm fired, rescheduled"
        );

        self.subscriptions.iter().map(|s| s.id).collect()
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.scheduler.cancel_alarm(handle);
        }
    }
}

impl Drop for PeriodicAlarmTracker {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::FakeAlarmScheduler;
    use std::time::Duration;

    const NS_PER_SEC: i64 = 1_000_000_000;

    fn config(offset_sec: u64, period_sec: u64) -> PeriodicAlarmConfig {
        PeriodicAlarmConfig {
            id: 11,
            offset: Duration::from_secs(offset_sec),
            period: Duration::from_secs(period_sec),
        }
    }

    fn subscription(id: i64) -> SubscriptionConfig {
        SubscriptionConfig { id, rule_id: 11 }
    }

    #[test]
    fn test_initial_schedule_at_offset() {
        let scheduler = FakeAlarmScheduler::new();
        let tracker =
            PeriodicAlarmTracker::new(config(10, 60), vec![], 0, scheduler.clone());
        assert_eq!(tracker.next_deadline_ns(), 10 * NS_PER_SEC);
        assert_eq!(scheduler.outstanding().len(), 1);
    }

    #[test]
    fn test_fire_reschedules_next_period() {
        let scheduler = FakeAlarmScheduler::new();
        let mut tracker = PeriodicAlarmTracker::new(
            config(10, 60),
            vec![subscription(5)],
            0,
            scheduler.clone(),
        );

        let mut fired = scheduler.fire_due(10 * NS_PER_SEC);
        let subs = tracker.inform_alarms_fired(10 * NS_PER_SEC, &mut fired);
        assert_eq!(subs, vec![5]);
        assert!(fired.is_empty());
        assert_eq!(tracker.next_deadline_ns(), 70 * NS_PER_SEC);
    }

    #[test]
    fn test_late_fire_skips_missed_periods() {
        let scheduler = FakeAlarmScheduler::new();
        let mut tracker =
            PeriodicAlarmTracker::new(config(10, 60), vec![], 0, scheduler.clone());

        // The service wakes up 3 periods late.
        let mut fired = scheduler.fire_due(200 * NS_PER_SEC);
        tracker.inform_alarms_fired(200 * NS_PER_SEC, &mut fired);
        assert_eq!(tracker.next_deadline_ns(), 250 * NS_PER_SEC);
    }

    #[test]
    fn test_foreign_handles_are_untouched() {
        let scheduler = FakeAlarmScheduler::new();
        let mut tracker =
            PeriodicAlarmTracker::new(config(10, 60), vec![subscription(5)], 0, scheduler.clone());

        let mut fired = vec![9999];
        let subs = tracker.inform_alarms_fired(10 * NS_PER_SEC, &mut fired);
        assert!(subs.is_empty());
        assert_eq!(fired, vec![9999]);
    }

    #[test]
    fn test_cancel_clears_outstanding() {
        let scheduler = FakeAlarmScheduler::new();
        let mut tracker = PeriodicAlarmTracker::new(config(10, 60), vec![], 0, scheduler.clone());
        tracker.cancel();
        assert!(scheduler.outstanding().is_empty());
    }
}
