//! Deterministic dimension sampling.
//!
//! Shard-based cardinality reduction: a dimension key is admitted iff the
//! stable hash of its values, offset by a per-host shard offset, lands on
//! residue zero modulo the configured shard count. The hash is stable across
//! reboots, so a given dimension is either always sampled or never.

use crate::dimension::DimensionKey;

/// Source of the per-host shard offset. Injected so tests can pin it.
pub trait ShardOffsetProvider: Send + Sync {
    fn shard_offset(&self) -> u32;
}

/// Fixed offset, the default in production (derived once at process start)
/// and the norm in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedShardOffset(pub u32);

impl ShardOffsetProvider for FixedShardOffset {
    fn shard_offset(&self) -> u32 {
        self.0
    }
}

/// Per-metric sampling decision. `shard_count` of 0 or 1 admits everything.
#[derive(Debug, Clone, Copy)]
pub struct DimensionSampler {
    shard_count: u32,
    shard_offset: u32,
}

impl DimensionSampler {
    pub fn new(shard_count: u32, shard_offset: u32) -> Self {
        DimensionSampler {
            shard_count,
            shard_offset,
        }
    }

    /// Whether the given would-be dimension key is admitted. Applied before
    /// the hard dimension guardrail.
    pub fn admits(&self, key: &DimensionKey) -> bool {
        if self.shard_count <= 1 {
            return true;
        }
        let shard = (key.stable_hash().wrapping_add(self.shard_offset)) % self.shard_count;
        shard == 0
    }
}
