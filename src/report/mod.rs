//! Outbound report envelope.
//!
//! One report per configuration, one entry per metric, one sub-entry per
//! dimension with its past buckets. Serialization goes through serde to
//! JSON; struct field order is fixed, so serialize → parse → serialize is
//! byte-identical.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dimension::{AtomKey, DimensionKey};
use crate::field::Value;

/// When a bucket spans exactly the configured size it is identified by its
/// number relative to the time base; partial buckets carry explicit bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketTime {
    Num(i64),
    Range { start_ns: i64, end_ns: i64 },
}

/// A closed bucket holding a single numeric value (count or duration).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueBucket {
    pub time: BucketTime,
    pub value: i64,
    /// Time the metric's condition held within the bucket; only present for
    /// metrics with an unsliced condition and no state slicing.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub condition_true_ns: Option<i64>,
}

/// A deduplicated captured atom with every timestamp it occurred at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedAtom {
    pub atom: AtomKey,
    pub timestamps_ns: Vec<i64>,
}

/// A closed gauge bucket: deduplicated sampled atoms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GaugeBucketReport {
    pub time: BucketTime,
    pub atoms: Vec<AggregatedAtom>,
}

/// Per-dimension data of one metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionReport<B> {
    pub dimension_key: DimensionKey,
    pub state_values: DimensionKey,
    pub buckets: Vec<B>,
}

/// The payload variants, mirroring the four producer kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricData {
    Count(Vec<DimensionReport<ValueBucket>>),
    Duration(Vec<DimensionReport<ValueBucket>>),
    Event(Vec<AggregatedAtom>),
    Gauge(Vec<DimensionReport<GaugeBucketReport>>),
}

/// Report envelope for one metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricReport {
    pub metric_id: i64,
    pub is_active: bool,
    pub dimension_guardrail_hit: bool,
    pub time_base_ns: i64,
    pub bucket_size_ns: i64,
    /// Raw packed paths of the dimension fields, emitted once instead of per
    /// entry when the nested dimension layout is disabled.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dimension_path_in_what: Option<Vec<u32>>,
    pub data: MetricData,
}

/// Full report for one configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigReport {
    pub config_id: i64,
    pub last_report_elapsed_ns: i64,
    pub current_report_elapsed_ns: i64,
    pub reports: Vec<MetricReport>,
}

impl ConfigReport {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("report serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// 64-bit stable digest of a string, used when the configuration asks for
/// hashed strings in reports.
pub fn hash_string(s: &str) -> i64 {
    let digest = Sha256::digest(s.as_bytes());
    i64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

/// Replace every string value in a dimension key with its stable hash.
pub fn hash_strings_in_key(key: &DimensionKey) -> DimensionKey {
    let values = key
        .values()
        .iter()
        .map(|fv| {
            let mut fv = fv.clone();
            if let Value::Str(s) = &fv.value {
                fv.value = Value::Long(hash_string(s));
            }
            fv
        })
        .collect();
    DimensionKey::new(values)
}
