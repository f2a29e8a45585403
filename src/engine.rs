//! Multi-configuration front door.
//!
//! Holds one [`MetricsManager`] per installed configuration, each behind its
//! own mutex. Ingestion, configuration mutation, report dumps, and external
//! callbacks all serialize against the owning manager's lock; managers never
//! block each other.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::{ConfigKey, EngineConfig};
use crate::external::{AlarmHandle, UidResolver};
use crate::field::Atom;
use crate::metrics::init::InitDeps;
use crate::metrics::manager::MetricsManager;
use crate::report::ConfigReport;
use crate::snapshot::EngineSnapshot;

pub struct Engine {
    managers: Mutex<BTreeMap<ConfigKey, Arc<Mutex<MetricsManager>>>>,
    deps: InitDeps,
    uid_resolver: Option<Arc<dyn UidResolver>>,
    time_base_ns: i64,
}

impl Engine {
    pub fn new(
        time_base_ns: i64,
        deps: InitDeps,
        uid_resolver: Option<Arc<dyn UidResolver>>,
    ) -> Self {
        Engine {
            managers: Mutex::new(BTreeMap::new()),
            deps,
            uid_resolver,
            time_base_ns,
        }
    }

    fn snapshot_managers(&self) -> Vec<Arc<Mutex<MetricsManager>>> {
        self.managers.lock().values().cloned().collect()
    }

    fn manager(&self, key: ConfigKey) -> Option<Arc<Mutex<MetricsManager>>> {
        self.managers.lock().get(&key).cloned()
    }

    /// Install a configuration, or update it in place when the key already
    /// exists. Returns whether the configuration was accepted.
    pub fn install_config(&self, key: ConfigKey, config: EngineConfig, now_ns: i64) -> bool {
        if let Some(existing) = self.manager(key) {
            let mut manager = existing.lock();
            let valid = manager.update_config(config, now_ns);
            info!(config = %key, valid, "configuration updated");
            return valid;
        }
        let mut manager = MetricsManager::new(
            key,
            config,
            self.time_base_ns,
            now_ns,
            self.deps.clone(),
            self.uid_resolver.clone(),
        );
        manager.init(now_ns);
        let valid = manager.is_config_valid();
        info!(config = %key, valid, "configuration installed");
        self.managers
            .lock()
            .insert(key, Arc::new(Mutex::new(manager)));
        valid
    }

    /// Remove a configuration, cancelling its alarms and dropping its state.
    pub fn remove_config(&self, key: ConfigKey) {
        let removed = self.managers.lock().remove(&key);
        match removed {
            Some(manager) => {
                manager.lock().tear_down();
                info!(config = %key, "configuration removed");
            }
            None => warn!(config = %key, "remove for unknown configuration"),
        }
    }

    pub fn installed_configs(&self) -> Vec<ConfigKey> {
        self.managers.lock().keys().copied().collect()
    }

    /// Feed one atom to every installed configuration, in key order.
    pub fn on_atom(&self, atom: &Atom) {
        for manager in self.snapshot_managers() {
            manager.lock().on_atom(atom);
        }
    }

    /// Pull completion callback; pending results for removed configurations
    /// fall out naturally because dispatch is keyed.
    pub fn on_pull_completed(&self, key: ConfigKey, tag: i32, atoms: &[Atom], timestamp_ns: i64) {
        if let Some(manager) = self.manager(key) {
            manager.lock().on_pull_completed(tag, atoms, timestamp_ns);
        }
    }

    /// Alarm-service callback with the fired handles. Every manager gets a
    /// chance to consume handles it owns; the rest are returned.
    pub fn on_alarms_fired(&self, timestamp_ns: i64, mut fired: Vec<AlarmHandle>) -> Vec<i64> {
        let mut fired_subscriptions = Vec::new();
        for manager in self.snapshot_managers() {
            let mut manager = manager.lock();
            manager.on_anomaly_alarms_fired(timestamp_ns, &mut fired);
            fired_subscriptions
                .extend(manager.on_periodic_alarms_fired(timestamp_ns, &mut fired));
            if fired.is_empty() {
                break;
            }
        }
        fired_subscriptions
    }

    /// Uid-map snapshot callback.
    pub fn on_uid_map_received(&self) {
        for manager in self.snapshot_managers() {
            manager.lock().on_uid_map_received();
        }
    }

    /// Force partial buckets closed across all configurations.
    pub fn notify_flush_boundary(&self, timestamp_ns: i64) {
        for manager in self.snapshot_managers() {
            manager.lock().notify_flush_boundary(timestamp_ns);
        }
    }

    pub fn dump_report(
        &self,
        key: ConfigKey,
        dump_ns: i64,
        wall_clock_ns: i64,
        include_current_partial: bool,
        erase_data: bool,
    ) -> Option<ConfigReport> {
        let manager = self.manager(key)?;
        let mut manager = manager.lock();
        Some(manager.dump_report(dump_ns, wall_clock_ns, include_current_partial, erase_data))
    }

    pub fn write_snapshot(&self, now_ns: i64, now_wall_sec: u32) -> EngineSnapshot {
        let mut configs = Vec::new();
        for manager in self.snapshot_managers() {
            let snapshot = manager.lock().write_snapshot(now_ns, now_wall_sec);
            if !snapshot.is_empty() {
                configs.push(snapshot);
            }
        }
        EngineSnapshot { configs }
    }

    pub fn load_snapshot(&self, snapshot: &EngineSnapshot, now_ns: i64) {
        for config_snapshot in &snapshot.configs {
            for manager in self.snapshot_managers() {
                let mut manager = manager.lock();
                if manager.config_key().id == config_snapshot.config_id {
                    manager.load_snapshot(config_snapshot, now_ns);
                }
            }
        }
    }
}
