//! Logical combination of child conditions.

use crate::condition::{ConditionState, ConditionTracker};
use crate::matcher::LogicalOp;

/// Combines child conditions, referenced by index into the tracker list.
/// Children always precede the parent. A combination may reference sliced
/// children; the per-dimension fast path is only exposed when exactly one
/// child is sliced and the operation is AND.
#[derive(Debug)]
pub struct CombinationConditionTracker {
    pub id: i64,
    /// Position of this tracker in the manager's condition list.
    pub index: usize,
    pub op: LogicalOp,
    pub children: Vec<usize>,
    /// Children known to be sliced at configuration time.
    pub sliced_children: Vec<usize>,
    /// Current value of the expression restricted to unsliced children.
    pub unsliced_part_state: ConditionState,
}

impl CombinationConditionTracker {
    pub fn new(
        id: i64,
        index: usize,
        op: LogicalOp,
        children: Vec<usize>,
        sliced_children: Vec<usize>,
    ) -> Self {
        CombinationConditionTracker {
            id,
            index,
            op,
            children,
            sliced_children,
            unsliced_part_state: ConditionState::Unknown,
        }
    }

    /// Re-point indices after a config update that preserved this tracker.
    pub fn rebind(&mut self, index: usize, children: Vec<usize>, sliced_children: Vec<usize>) {
        self.index = index;
        self.children = children;
        self.sliced_children = sliced_children;
    }

    /// The single sliced child this combination funnels through, when the
    /// per-dimension change sets can be used directly (AND with exactly one
    /// sliced child).
    pub fn single_sliced_child(&self) -> Option<usize> {
        if self.op == LogicalOp::And && self.sliced_children.len() == 1 {
            Some(self.sliced_children[0])
        } else {
            None
        }
    }

    /// Recompute from already-evaluated children; `cond_cache` carries the
    /// values the children just produced.
    pub fn evaluate_with_children(
        &mut self,
        cond_cache: &mut [ConditionState],
        changed: &mut [bool],
    ) {
        let mut states = self.children.iter().map(|&c| cond_cache[c]);
        let value = combine_states(self.op, &mut states);

        let mut unsliced = self
            .children
            .iter()
            .filter(|c| !self.sliced_children.contains(*c))
            .map(|&c| cond_cache[c]);
        self.unsliced_part_state = combine_states(self.op, &mut unsliced);

        let any_child_changed = self.children.iter().any(|&c| changed[c]);
        cond_cache[self.index] = value;
        changed[self.index] = any_child_changed;
    }

    /// Current value from the children's current states, without an event.
    /// Children have strictly smaller indices, so recursion terminates.
    pub fn current_from_children(&self, all: &[ConditionTracker]) -> ConditionState {
        let mut states = self.children.iter().map(|&c| all[c].current_unsliced(all));
        combine_states(self.op, &mut states)
    }
}

/// Three-valued logic over an iterator of child states.
///
/// AND: false dominates, then unknown. OR: true dominates, then unknown.
/// NOT: negation of the single child. An empty AND is true, an empty OR
/// false, matching the neutral elements.
pub fn combine_states(
    op: LogicalOp,
    states: &mut dyn Iterator<Item = ConditionState>,
) -> ConditionState {
    match op {
        LogicalOp::And => {
            let mut result = ConditionState::True;
            for s in states {
                match s {
                    ConditionState::False => return ConditionState::False,
                    ConditionState::Unknown | ConditionState::NotEvaluated => {
                        result = ConditionState::Unknown;
                    }
                    ConditionState::True => {}
                }
            }
            result
        }
        LogicalOp::Or => {
            let mut result = ConditionState::False;
            for s in states {
                match s {
                    ConditionState::True => return ConditionState::True,
                    ConditionState::Unknown | ConditionState::NotEvaluated => {
                        result = ConditionState::Unknown;
                    }
                    ConditionState::False => {}
                }
            }
            result
        }
        LogicalOp::Not => match states.next() {
            Some(ConditionState::True) => ConditionState::False,
            Some(ConditionState::False) => ConditionState::True,
            _ => ConditionState::Unknown,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn combine(op: LogicalOp, states: &[ConditionState]) -> ConditionState {
        combine_states(op, &mut states.iter().copied())
    }

    #[test]
    fn test_and_truth_table() {
        use ConditionState::*;
        assert_eq!(combine(LogicalOp::And, &[True, True]), True);
        assert_eq!(combine(LogicalOp::And, &[True, False]), False);
        assert_eq!(combine(LogicalOp::And, &[True, Unknown]), Unknown);
        assert_eq!(combine(LogicalOp::And, &[False, Unknown]), False);
        assert_eq!(combine(LogicalOp::And, &[]), True);
    }

    #[test]
    fn test_or_truth_table() {
        use ConditionState::*;
        assert_eq!(combine(LogicalOp::Or, &[False, True]), True);
        assert_eq!(combine(LogicalOp::Or, &[False, False]), False);
        assert_eq!(combine(LogicalOp::Or, &[False, Unknown]), Unknown);
        assert_eq!(combine(LogicalOp::Or, &[Unknown, True]), True);
        assert_eq!(combine(LogicalOp::Or, &[]), False);
    }

    #[test]
    fn test_not() {
        use ConditionState::*;
        assert_eq!(combine(LogicalOp::Not, &[True]), False);
        assert_eq!(combine(LogicalOp::Not, &[False]), True);
        assert_eq!(combine(LogicalOp::Not, &[Unknown]), Unknown);
    }

    #[test]
    fn test_single_sliced_child_requires_and() {
        let and = CombinationConditionTracker::new(1, 2, LogicalOp::And, vec![0, 1], vec![1]);
        assert_eq!(and.single_sliced_child(), Some(1));

        let or = CombinationConditionTracker::new(1, 2, LogicalOp::Or, vec![0, 1], vec![1]);
        assert_eq!(or.single_sliced_child(), None);

        let two = CombinationConditionTracker::new(1, 3, LogicalOp::And, vec![0, 1, 2], vec![1, 2]);
        assert_eq!(two.single_sliced_child(), None);
    }
}
