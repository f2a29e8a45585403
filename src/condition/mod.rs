//! Condition trackers.
//!
//! A condition is a boolean state derived from matcher activity, optionally
//! sliced so that one boolean is held per dimension. Simple trackers are
//! driven by start/stop/stop-all matchers; combination trackers apply a
//! logical operation over child conditions. Children always precede their
//! parent in the tracker list, so evaluation runs in index order without
//! back-references.

pub mod combination;
pub mod simple;

use std::collections::{HashMap, HashSet};

use crate::dimension::DimensionKey;
use crate::field::Atom;
use crate::matcher::MatchingState;

pub use combination::CombinationConditionTracker;
pub use simple::SimpleConditionTracker;

/// The value of a condition at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionState {
    /// Not yet computed for the current atom.
    NotEvaluated,
    /// No information; the initial value of conditions that start unknown.
    Unknown,
    False,
    True,
}

impl ConditionState {
    pub fn is_true(self) -> bool {
        self == ConditionState::True
    }

    pub fn from_bool(b: bool) -> Self {
        if b {
            ConditionState::True
        } else {
            ConditionState::False
        }
    }
}

/// Per-link dimension keys used to query sliced conditions, keyed by
/// condition id.
pub type ConditionKey = HashMap<i64, DimensionKey>;

/// The condition family.
#[derive(Debug)]
pub enum ConditionTracker {
    Simple(SimpleConditionTracker),
    Combination(CombinationConditionTracker),
}

impl ConditionTracker {
    pub fn id(&self) -> i64 {
        match self {
            ConditionTracker::Simple(t) => t.id,
            ConditionTracker::Combination(t) => t.id,
        }
    }

    /// Whether this condition holds one boolean per dimension.
    pub fn is_sliced(&self) -> bool {
        match self {
            ConditionTracker::Simple(t) => t.is_sliced(),
            ConditionTracker::Combination(t) => !t.sliced_children.is_empty(),
        }
    }

    /// The unsliced view of the condition's current value.
    pub fn current_unsliced(&self, all: &[ConditionTracker]) -> ConditionState {
        match self {
            ConditionTracker::Simple(t) => t.current_unsliced(),
            ConditionTracker::Combination(t) => t.current_from_children(all),
        }
    }
}

/// Evaluate condition `index` for `atom`. Children are evaluated first;
/// results and change bits land in `cond_cache` / `changed`. Both caches are
/// sized to the tracker list and start at `NotEvaluated` / `false`.
pub fn evaluate_condition(
    trackers: &mut [ConditionTracker],
    index: usize,
    atom: &Atom,
    matcher_cache: &[MatchingState],
    cond_cache: &mut [ConditionState],
    changed: &mut [bool],
) {
    if cond_cache[index] != ConditionState::NotEvaluated {
        return;
    }
    let (head, tail) = trackers.split_at_mut(index);
    match &mut tail[0] {
        ConditionTracker::Simple(t) => t.evaluate(atom, matcher_cache, cond_cache, changed),
        ConditionTracker::Combination(t) => {
            let children = t.children.clone();
            for child in children {
                evaluate_condition(head, child, atom, matcher_cache, cond_cache, changed);
            }
            t.evaluate_with_children(cond_cache, changed);
        }
    }
}

/// Read-only view over the condition trackers, handed to metric producers
/// during dispatch.
#[derive(Clone, Copy)]
pub struct ConditionWizard<'a> {
    trackers: &'a [ConditionTracker],
}

impl<'a> ConditionWizard<'a> {
    pub fn new(trackers: &'a [ConditionTracker]) -> Self {
        ConditionWizard { trackers }
    }

    /// Query the condition at `index` under the given per-link keys.
    /// `partial_links` means the keys may constrain only a subset of the
    /// condition's dimensions, requiring containment scans.
    pub fn query(
        &self,
        index: usize,
        condition_key: &ConditionKey,
        partial_links: bool,
    ) -> ConditionState {
        match &self.trackers[index] {
            ConditionTracker::Simple(t) => t.query(condition_key, partial_links),
            ConditionTracker::Combination(t) => {
                let mut states = t
                    .children
                    .iter()
                    .map(|&c| self.query(c, condition_key, partial_links));
                combination::combine_states(t.op, &mut states)
            }
        }
    }

    pub fn is_simple(&self, index: usize) -> bool {
        matches!(self.trackers[index], ConditionTracker::Simple(_))
    }

    /// Dimensions of the single sliced child that flipped to true in the
    /// last evaluation, when trackable.
    pub fn changed_to_true_dimensions(&self, index: usize) -> Option<&HashSet<DimensionKey>> {
        match &self.trackers[index] {
            ConditionTracker::Simple(t) => Some(t.changed_to_true()),
            ConditionTracker::Combination(t) => {
                let child = t.single_sliced_child()?;
                self.changed_to_true_dimensions(child)
            }
        }
    }

    pub fn changed_to_false_dimensions(&self, index: usize) -> Option<&HashSet<DimensionKey>> {
        match &self.trackers[index] {
            ConditionTracker::Simple(t) => Some(t.changed_to_false()),
            ConditionTracker::Combination(t) => {
                let child = t.single_sliced_child()?;
                self.changed_to_false_dimensions(child)
            }
        }
    }

    /// Current per-dimension start counts of the sliced condition, when the
    /// condition is simple or funnels through a single sliced child.
    pub fn sliced_dimension_map(&self, index: usize) -> Option<&HashMap<DimensionKey, u32>> {
        match &self.trackers[index] {
            ConditionTracker::Simple(t) => Some(t.sliced_state()),
            ConditionTracker::Combination(t) => {
                let child = t.single_sliced_child()?;
                self.sliced_dimension_map(child)
            }
        }
    }

    /// The current value of the unsliced portion of a combination condition.
    pub fn unsliced_part_state(&self, index: usize) -> ConditionState {
        match &self.trackers[index] {
            ConditionTracker::Simple(t) => t.current_unsliced(),
            ConditionTracker::Combination(t) => t.unsliced_part_state,
        }
    }

    /// Whether per-dimension change sets are available for this condition:
    /// it is simple, or an AND combination with exactly one sliced child.
    pub fn is_changed_dimension_trackable(&self, index: usize) -> bool {
        match &self.trackers[index] {
            ConditionTracker::Simple(_) => true,
            ConditionTracker::Combination(t) => t.single_sliced_child().is_some(),
        }
    }

    /// True if `fields` exactly matches the output dimensions of the sliced
    /// condition feeding `index`.
    pub fn equal_output_dimensions(
        &self,
        index: usize,
        fields: &[crate::field::FieldMatcher],
    ) -> bool {
        match &self.trackers[index] {
            ConditionTracker::Simple(t) => t.dimension_matchers == fields,
            ConditionTracker::Combination(t) => match t.single_sliced_child() {
                Some(child) => self.equal_output_dimensions(child, fields),
                None => false,
            },
        }
    }
}
