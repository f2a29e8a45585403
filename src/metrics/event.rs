//! Event metric producer.
//!
//! Captures matching atoms verbatim, deduplicated by their field-value
//! fingerprint; each unique atom keeps the list of timestamps it occurred
//! at. An optional sampling percentage applies a Bernoulli filter before
//! deduplication.

use std::collections::HashMap;

use rand::Rng;

use crate::condition::ConditionState;
use crate::dimension::{AtomKey, DimensionKey};
use crate::field::Atom;
use crate::metrics::{DispatchContext, MetricCore};
use crate::report::{AggregatedAtom, MetricData, MetricReport};

pub struct EventMetricProducer {
    pub core: MetricCore,
    sampling_percentage: Option<u8>,
    aggregated: HashMap<AtomKey, Vec<i64>>,
    total_size: usize,
}

impl EventMetricProducer {
    pub fn new(core: MetricCore, sampling_percentage: Option<u8>) -> Self {
        EventMetricProducer {
            core,
            sampling_percentage,
            aggregated: HashMap::new(),
            total_size: 0,
        }
    }

    pub fn on_matched_event(&mut self, atom: &Atom, ctx: DispatchContext<'_>) {
        let event_ns = atom.elapsed_ns();
        if event_ns < self.core.time_base_ns || !self.core.is_active {
            return;
        }
        if let Some(pct) = self.sampling_percentage {
            if pct < 100 && rand::thread_rng().gen_range(1..=100u8) > pct {
                self.core.stats.note_event_sampled_out();
                return;
            }
        }
        let (condition, _) = self.core.condition_for_event(ctx.wizard, atom.values());
        if !condition {
            return;
        }

        let key = AtomKey::new(atom.tag(), DimensionKey::new(atom.values().to_vec()));
        let timestamps = self.aggregated.entry(key).or_default();
        timestamps.push(event_ns);
        self.total_size += std::mem::size_of::<i64>();
    }

    pub fn on_condition_changed(&mut self, condition: bool, timestamp_ns: i64) {
        self.core.condition = ConditionState::from_bool(condition);
        self.core
            .condition_timer
            .on_condition_changed(self.core.is_active && condition, timestamp_ns);
    }

    pub fn dump_report(
        &mut self,
        _dump_ns: i64,
        erase_data: bool,
        _hash_strings: bool,
    ) -> MetricReport {
        let entries = self
            .aggregated
            .iter()
            .map(|(atom, timestamps)| AggregatedAtom {
                atom: atom.clone(),
                timestamps_ns: timestamps.clone(),
            })
            .collect();

        let report = MetricReport {
            metric_id: self.core.metric_id,
            is_active: self.core.is_active,
            dimension_guardrail_hit: false,
            time_base_ns: self.core.time_base_ns,
            bucket_size_ns: self.core.bucket_size_ns,
            dimension_path_in_what: None,
            data: MetricData::Event(entries),
        };
        if erase_data {
            self.clear_past_buckets();
        }
        report
    }

    pub fn clear_past_buckets(&mut self) {
        self.aggregated.clear();
        self.total_size = 0;
    }

    pub fn byte_size(&self) -> usize {
        self.total_size
            + self
                .aggregated
                .keys()
                .map(|_| std::mem::size_of::<AtomKey>())
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionWizard;
    use crate::field::{Field, FieldPath, FieldValue, Value};
    use crate::guardrail::EngineStats;
    use crate::metrics::{ActivationMap, ConditionTimer};
    use crate::state::StateManager;
    use std::sync::Arc;

    const SEC: i64 = 1_000_000_000;
    const TAG: i32 = 33;

    fn test_core() -> MetricCore {
        MetricCore {
            metric_id: 300,
            config_id: 1,
            time_base_ns: 0,
            bucket_size_ns: i64::MAX,
            current_bucket_start_ns: 0,
            current_bucket_num: 0,
            condition: ConditionState::True,
            condition_sliced: false,
            condition_index: None,
            links: vec![],
            links_all_condition_dimensions: false,
            state_links: vec![],
            sliced_state_atoms: vec![],
            state_group_maps: Default::default(),
            sampler: None,
            dimension_soft_limit: 500,
            dimension_hard_limit: 800,
            has_hit_guardrail: false,
            condition_timer: ConditionTimer::new(0, true),
            activations: ActivationMap::default(),
            is_active: true,
            stats: Arc::new(EngineStats::new()),
        }
    }

    fn atom(state: i32, ts: i64) -> Atom {
        Atom::new(
            TAG,
            1000,
            ts,
            vec![FieldValue::new(
                Field::new(TAG, FieldPath::leaf(1)),
                Value::Int(state),
            )],
        )
    }

    fn send(p: &mut EventMetricProducer, a: &Atom) {
        let trackers = vec![];
        let states = StateManager::new();
        let matchers = vec![];
        let ctx = DispatchContext {
            wizard: ConditionWizard::new(&trackers),
            states: &states,
            matchers: &matchers,
        };
        p.on_matched_event(a, ctx);
    }

    #[test]
    fn test_identical_atoms_deduplicate() {
        let mut p = EventMetricProducer::new(test_core(), None);
        send(&mut p, &atom(1, SEC));
        send(&mut p, &atom(1, 2 * SEC));
        send(&mut p, &atom(2, 3 * SEC));

        let report = p.dump_report(10 * SEC, true, false);
        let MetricData::Event(entries) = report.data else {
            panic!("expected event data");
        };
        assert_eq!(entries.len(), 2);
        let mut lens: Vec<usize> = entries.iter().map(|e| e.timestamps_ns.len()).collect();
        lens.sort_unstable();
        assert_eq!(lens, vec![1, 2]);
    }

    #[test]
    fn test_erase_clears_aggregation() {
        let mut p = EventMetricProducer::new(test_core(), None);
        send(&mut p, &atom(1, SEC));
        let _ = p.dump_report(10 * SEC, true, false);

        let report = p.dump_report(20 * SEC, true, false);
        let MetricData::Event(entries) = report.data else {
            panic!("expected event data");
        };
        assert!(entries.is_empty());
    }

    #[test]
    fn test_condition_false_drops_event() {
        let mut core = test_core();
        core.condition = ConditionState::False;
        let mut p = EventMetricProducer::new(core, None);
        send(&mut p, &atom(1, SEC));
        assert_eq!(p.aggregated.len(), 0);
    }

    #[test]
    fn test_full_sampling_keeps_everything() {
        let mut p = EventMetricProducer::new(test_core(), Some(100));
        for i in 0..50 {
            send(&mut p, &atom(i, i64::from(i) * SEC));
        }
        let total: usize = p.aggregated.values().map(Vec::len).sum();
        assert_eq!(total, 50);
    }

    #[test]
    fn test_byte_size_grows_with_captures() {
        let mut p = EventMetricProducer::new(test_core(), None);
        let before = p.byte_size();
        send(&mut p, &atom(1, SEC));
        assert!(p.byte_size() > before);
    }
}
