//! Persisted engine state.
//!
//! Two things survive a restart: remaining activation TTLs of metrics with
//! activations, and the refractory-period ends of declared anomalies. Both
//! are wall-clock-independent by construction (TTLs are stored as remaining
//! durations, refractory ends as wall-clock seconds).

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dimension::MetricDimensionKey;

/// Remaining activation TTLs for one metric, keyed by activation matcher
/// index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveMetricSnapshot {
    pub metric_id: i64,
    pub activations: Vec<(usize, i64)>,
}

/// Refractory-period ends for one alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSnapshot {
    pub alert_id: i64,
    pub refractory_ends_sec: Vec<(MetricDimensionKey, u32)>,
}

/// Snapshot of one configuration's persistable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub config_id: i64,
    pub active_metrics: Vec<ActiveMetricSnapshot>,
    pub alerts: Vec<AlertSnapshot>,
}

impl ConfigSnapshot {
    pub fn is_empty(&self) -> bool {
        self.active_metrics.is_empty() && self.alerts.is_empty()
    }
}

/// Snapshot across all installed configurations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub configs: Vec<ConfigSnapshot>,
}

impl EngineSnapshot {
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec(self).context("serializing snapshot")?;
        std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }
}
