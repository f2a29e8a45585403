//! Contracts for the engine's external collaborators.
//!
//! The OS-facing pieces (pullers, the alarm service, the uid map) stay
//! outside the engine; these traits pin down exactly what the engine needs
//! from them. The fakes live here too so unit and end-to-end tests share
//! them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::field::Atom;

/// Pull request failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PullError {
    #[error("pull for tag {tag} timed out")]
    Timeout { tag: i32 },

    #[error("no puller registered for tag {tag}")]
    NoPuller { tag: i32 },
}

/// Synchronous atom puller. A result returned after `deadline_ns` is
/// discarded by the caller.
pub trait AtomPuller: Send + Sync {
    fn pull(&self, tag: i32, deadline_ns: i64) -> Result<Vec<Atom>, PullError>;

    /// Ask the puller to deliver `tag` at every bucket boundary. Results
    /// arrive through the engine's pull-completion entry point.
    fn register_receiver(&self, tag: i32, bucket_size_ns: i64) {
        let _ = (tag, bucket_size_ns);
    }

    fn unregister_receiver(&self, tag: i32) {
        let _ = tag;
    }
}

/// Stable handle for a scheduled alarm.
pub type AlarmHandle = u64;

/// Wall-clock alarm service. Handles are stable for the lifetime of a
/// configuration.
pub trait AlarmScheduler: Send + Sync {
    fn set_alarm(&self, deadline_ns: i64) -> AlarmHandle;
    fn cancel_alarm(&self, handle: AlarmHandle);
}

/// Resolves package names to uids, for allow-lists and pull routing.
pub trait UidResolver: Send + Sync {
    fn uids_for_package(&self, package: &str) -> Vec<i32>;
}

/// In-memory puller fake: canned atoms per tag, with an optional artificial
/// latency to exercise the stale-pull path.
#[derive(Default)]
pub struct FakePuller {
    responses: Mutex<HashMap<i32, Vec<Atom>>>,
    latency_ns: Mutex<i64>,
    pulls: Mutex<Vec<i32>>,
    receivers: Mutex<HashMap<i32, i64>>,
}

impl FakePuller {
    pub fn new() -> Arc<Self> {
        Arc::new(FakePuller::default())
    }

    pub fn set_response(&self, tag: i32, atoms: Vec<Atom>) {
        self.responses.lock().insert(tag, atoms);
    }

    pub fn set_latency_ns(&self, latency_ns: i64) {
        *self.latency_ns.lock() = latency_ns;
    }

    /// Tags pulled so far, in order.
    pub fn pull_log(&self) -> Vec<i32> {
        self.pulls.lock().clone()
    }

    /// Registered receiver tags and their bucket sizes.
    pub fn registered(&self) -> HashMap<i32, i64> {
        self.receivers.lock().clone()
    }
}

impl AtomPuller for FakePuller {
    fn pull(&self, tag: i32, deadline_ns: i64) -> Result<Vec<Atom>, PullError> {
        self.pulls.lock().push(tag);
        if *self.latency_ns.lock() > deadline_ns {
            return Err(PullError::Timeout { tag });
        }
        self.responses
            .lock()
            .get(&tag)
            .cloned()
            .ok_or(PullError::NoPuller { tag })
    }

    fn register_receiver(&self, tag: i32, bucket_size_ns: i64) {
        self.receivers.lock().insert(tag, bucket_size_ns);
    }

    fn unregister_receiver(&self, tag: i32) {
        self.receivers.lock().remove(&tag);
    }
}

/// Alarm fake: records scheduled deadlines, hands out sequential handles.
#[derive(Default)]
pub struct FakeAlarmScheduler {
    next_handle: Mutex<AlarmHandle>,
    alarms: Mutex<HashMap<AlarmHandle, i64>>,
}

impl FakeAlarmScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeAlarmScheduler::default())
    }

    /// Outstanding (handle, deadline) pairs, sorted by deadline.
    pub fn outstanding(&self) -> Vec<(AlarmHandle, i64)> {
        let mut alarms: Vec<_> = self.alarms.lock().iter().map(|(h, d)| (*h, *d)).collect();
        alarms.sort_by_key(|(_, d)| *d);
        alarms
    }

    /// Handles whose deadline is at or before `now_ns`; removes them, as a
    /// real alarm service would after firing.
    pub fn fire_due(&self, now_ns: i64) -> Vec<AlarmHandle> {
        let mut alarms = self.alarms.lock();
        let due: Vec<AlarmHandle> = alarms
            .iter()
            .filter(|(_, d)| **d <= now_ns)
            .map(|(h, _)| *h)
            .collect();
        for h in &due {
            alarms.remove(h);
        }
        due
    }
}

impl AlarmScheduler for FakeAlarmScheduler {
    fn set_alarm(&self, deadline_ns: i64) -> AlarmHandle {
        let mut next = self.next_handle.lock();
        *next += 1;
        let handle = *next;
        self.alarms.lock().insert(handle, deadline_ns);
        handle
    }

    fn cancel_alarm(&self, handle: AlarmHandle) {
        self.alarms.lock().remove(&handle);
    }
}

/// Static package→uid table.
#[derive(Default)]
pub struct FakeUidResolver {
    table: HashMap<String, Vec<i32>>,
}

impl FakeUidResolver {
    pub fn new() -> Self {
        FakeUidResolver::default()
    }

    pub fn with_package(mut self, package: &str, uids: Vec<i32>) -> Self {
        self.table.insert(package.to_owned(), uids);
        self
    }
}

impl UidResolver for FakeUidResolver {
    fn uids_for_package(&self, package: &str) -> Vec<i32> {
        self.table.get(package).cloned().unwrap_or_default()
    }
}
