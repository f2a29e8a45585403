//! Start/stop predicate tracking.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::condition::{ConditionKey, ConditionState};
use crate::dimension::{filter_values, DimensionKey};
use crate::field::{Atom, FieldMatcher};
use crate::matcher::MatchingState;

/// Tracks a boolean (per dimension, when sliced) driven by a start matcher,
/// a stop matcher, and optionally a stop-all matcher.
///
/// With `count_nesting`, overlapping starts stack and each needs a matching
/// stop; without, a single stop releases the dimension regardless of how
/// many starts were seen.
#[derive(Debug)]
pub struct SimpleConditionTracker {
    pub id: i64,
    /// Position of this tracker in the manager's condition list.
    pub index: usize,
    pub start_index: Option<usize>,
    pub stop_index: Option<usize>,
    pub stop_all_index: Option<usize>,
    pub count_nesting: bool,
    /// Output dimensions; empty means the condition is unsliced.
    pub dimension_matchers: Vec<FieldMatcher>,
    initial_value: ConditionState,

    /// Per-dimension live start counts. Entries never hold zero.
    sliced_state: HashMap<DimensionKey, u32>,
    /// Whether any start/stop has ever applied; distinguishes Unknown from
    /// False for conditions that begin unknown.
    ever_evaluated: bool,
    changed_to_true: HashSet<DimensionKey>,
    changed_to_false: HashSet<DimensionKey>,
}

impl SimpleConditionTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: i64,
        index: usize,
        start_index: Option<usize>,
        stop_index: Option<usize>,
        stop_all_index: Option<usize>,
        count_nesting: bool,
        dimension_matchers: Vec<FieldMatcher>,
        initial_unknown: bool,
    ) -> Self {
        SimpleConditionTracker {
            id,
            index,
            start_index,
            stop_index,
            stop_all_index,
            count_nesting,
            dimension_matchers,
            initial_value: if initial_unknown {
                ConditionState::Unknown
            } else {
                ConditionState::False
            },
            sliced_state: HashMap::new(),
            ever_evaluated: false,
            changed_to_true: HashSet::new(),
            changed_to_false: HashSet::new(),
        }
    }

    /// Re-point indices after a config update that preserved this tracker.
    pub fn rebind(
        &mut self,
        index: usize,
        start_index: Option<usize>,
        stop_index: Option<usize>,
        stop_all_index: Option<usize>,
    ) {
        self.index = index;
        self.start_index = start_index;
        self.stop_index = stop_index;
        self.stop_all_index = stop_all_index;
    }

    pub fn is_sliced(&self) -> bool {
        !self.dimension_matchers.is_empty()
    }

    pub fn sliced_state(&self) -> &HashMap<DimensionKey, u32> {
        &self.sliced_state
    }

    pub fn changed_to_true(&self) -> &HashSet<DimensionKey> {
        &self.changed_to_true
    }

    pub fn changed_to_false(&self) -> &HashSet<DimensionKey> {
        &self.changed_to_false
    }

    /// The unsliced view: true iff any dimension is live.
    pub fn current_unsliced(&self) -> ConditionState {
        if !self.sliced_state.is_empty() {
            ConditionState::True
        } else if self.ever_evaluated {
            ConditionState::False
        } else {
            self.initial_value
        }
    }

    /// Apply one atom's matcher results, recording the new value and whether
    /// anything changed into the caller's caches at this tracker's index.
    pub fn evaluate(
        &mut self,
        atom: &Atom,
        matcher_cache: &[MatchingState],
        cond_cache: &mut [ConditionState],
        changed: &mut [bool],
    ) {
        self.changed_to_true.clear();
        self.changed_to_false.clear();

        let matched = |idx: Option<usize>| {
            idx.is_some_and(|i| matcher_cache.get(i) == Some(&MatchingState::Matched))
        };

        let mut any_change = false;

        if matched(self.stop_all_index) {
            // Stop-all drops every dimension at once.
            for (key, _) in self.sliced_state.drain() {
                self.changed_to_false.insert(key);
                any_change = true;
            }
            self.ever_evaluated = true;
        } else if matched(self.start_index) || matched(self.stop_index) {
            let key = if self.is_sliced() {
                match filter_values(&self.dimension_matchers, atom.values()) {
                    Some(key) => key,
                    None => {
                        debug!(
                            condition = self.id,
                            "condition atom missing output dimensions"
                        );
                        cond_cache[self.index] = self.current_unsliced();
                        changed[self.index] = false;
                        return;
                    }
                }
            } else {
                DimensionKey::empty()
            };

            self.ever_evaluated = true;
            if matched(self.start_index) {
                let count = self.sliced_state.entry(key.clone()).or_insert(0);
                if self.count_nesting {
                    *count += 1;
                } else {
                    *count = 1;
                }
                if *count == 1 {
                    self.changed_to_true.insert(key);
                    any_change = true;
                }
            } else {
                match self.sliced_state.get_mut(&key) {
                    Some(count) => {
                        if self.count_nesting {
                            *count = count.saturating_sub(1);
                        } else {
                            *count = 0;
                        }
                        if *count == 0 {
                            self.sliced_state.remove(&key);
                            self.changed_to_false.insert(key);
                            any_change = true;
                        }
                    }
                    None => {
                        debug!(condition = self.id, "stop without matching start");
                    }
                }
            }
        }

        cond_cache[self.index] = self.current_unsliced();
        changed[self.index] = any_change;
    }

    /// Query the condition under per-link keys. With `partial_links`, the
    /// key may constrain only part of the output dimensions and any live
    /// dimension containing it answers true.
    pub fn query(&self, condition_key: &ConditionKey, partial_links: bool) -> ConditionState {
        if !self.is_sliced() {
            return self.current_unsliced();
        }
        let Some(key) = condition_key.get(&self.id) else {
            return ConditionState::Unknown;
        };
        let live = if partial_links {
            self.sliced_state.keys().any(|dim| dim.contains(key))
        } else {
            self.sliced_state.contains_key(key)
        };
        if live {
            ConditionState::True
        } else if self.ever_evaluated {
            ConditionState::False
        } else {
            self.initial_value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{Field, FieldPath, FieldValue, Value};

    const START: usize = 0;
    const STOP: usize = 1;
    const STOP_ALL: usize = 2;

    fn tracker(nesting: bool, sliced: bool) -> SimpleConditionTracker {
        let dims = if sliced {
            vec![FieldMatcher::exact(Field::new(20, FieldPath::leaf(1)))]
        } else {
            vec![]
        };
        SimpleConditionTracker::new(
            77,
            0,
            Some(START),
            Some(STOP),
            Some(STOP_ALL),
            nesting,
            dims,
            false,
        )
    }

    fn uid_atom(uid: i32) -> Atom {
        Atom::new(
            20,
            1000,
            1,
            vec![FieldValue::new(
                Field::new(20, FieldPath::leaf(1)),
                Value::Int(uid),
            )],
        )
    }

    fn apply(t: &mut SimpleConditionTracker, atom: &Atom, which: usize) -> (ConditionState, bool) {
        let mut cache = [MatchingState::NotMatched; 3];
        cache[which] = MatchingState::Matched;
        let mut cond = [ConditionState::NotEvaluated];
        let mut changed = [false];
        t.evaluate(atom, &cache, &mut cond, &mut changed);
        (cond[0], changed[0])
    }

    #[test]
    fn test_unsliced_start_stop() {
        let mut t = tracker(false, false);
        let atom = uid_atom(1);

        let (state, changed) = apply(&mut t, &atom, START);
        assert_eq!(state, ConditionState::True);
        assert!(changed);

        // Second start without nesting is a no-op.
        let (state, changed) = apply(&mut t, &atom, START);
        assert_eq!(state, ConditionState::True);
        assert!(!changed);

        let (state, changed) = apply(&mut t, &atom, STOP);
        assert_eq!(state, ConditionState::False);
        assert!(changed);
    }

    #[test]
    fn test_nested_starts_need_matching_stops() {
        let mut t = tracker(true, false);
        let atom = uid_atom(1);

        apply(&mut t, &atom, START);
        apply(&mut t, &atom, START);

        let (state, changed) = apply(&mut t, &atom, STOP);
        assert_eq!(state, ConditionState::True);
        assert!(!changed);

        let (state, changed) = apply(&mut t, &atom, STOP);
        assert_eq!(state, ConditionState::False);
        assert!(changed);
    }

    #[test]
    fn test_sliced_per_dimension_booleans() {
        let mut t = tracker(false, true);

        apply(&mut t, &uid_atom(1), START);
        apply(&mut t, &uid_atom(2), START);
        assert_eq!(t.sliced_state().len(), 2);

        let (state, _) = apply(&mut t, &uid_atom(1), STOP);
        // Dimension 2 is still live, so the unsliced view stays true.
        assert_eq!(state, ConditionState::True);
        assert_eq!(t.sliced_state().len(), 1);
        assert!(t.changed_to_false().len() == 1);
    }

    #[test]
    fn test_stop_all_clears_everything() {
        let mut t = tracker(true, true);
        apply(&mut t, &uid_atom(1), START);
        apply(&mut t, &uid_atom(1), START);
        apply(&mut t, &uid_atom(2), START);

        let (state, changed) = apply(&mut t, &uid_atom(99), STOP_ALL);
        assert_eq!(state, ConditionState::False);
        assert!(changed);
        assert!(t.sliced_state().is_empty());
        assert_eq!(t.changed_to_false().len(), 2);
    }

    #[test]
    fn test_stop_without_start_is_ignored() {
        let mut t = tracker(false, true);
        let (state, changed) = apply(&mut t, &uid_atom(1), STOP);
        assert_eq!(state, ConditionState::False);
        assert!(!changed);
    }

    #[test]
    fn test_query_sliced_exact_and_partial() {
        let mut t = tracker(false, true);
        apply(&mut t, &uid_atom(1), START);

        let mut key = ConditionKey::new();
        key.insert(
            77,
            DimensionKey::new(vec![FieldValue::new(
                Field::new(20, FieldPath::leaf(1)),
                Value::Int(1),
            )]),
        );
        assert_eq!(t.query(&key, false), ConditionState::True);
        assert_eq!(t.query(&key, true), ConditionState::True);

        let mut miss = ConditionKey::new();
        miss.insert(
            77,
            DimensionKey::new(vec![FieldValue::new(
                Field::new(20, FieldPath::leaf(1)),
                Value::Int(9),
            )]),
        );
        assert_eq!(t.query(&miss, false), ConditionState::False);
    }

    #[test]
    fn test_query_unknown_before_first_event() {
        let t = SimpleConditionTracker::new(5, 0, Some(START), Some(STOP), None, false, vec![], true);
        assert_eq!(t.current_unsliced(), ConditionState::Unknown);
    }
}
