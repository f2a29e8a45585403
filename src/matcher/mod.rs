//! Atom matchers.
//!
//! A matcher decides whether a raw atom is interesting to a configuration.
//! Simple matchers test a tag plus a conjunction of field/value equalities
//! and may rewrite the atom (attribution-chain truncation); combination
//! matchers apply a logical operation over child matchers. Evaluation within
//! one atom is memoized in a per-atom cache indexed by matcher position.

use std::sync::Arc;

use crate::field::{Atom, FieldMatcher, FieldValue, Position, Value};

/// Per-atom evaluation state for one matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingState {
    NotComputed,
    Matched,
    NotMatched,
}

/// Logical operation of a combination matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

/// One field/value equality test. The position selector controls how
/// repeated elements are located: `Any` passes if any occurrence carries the
/// value, `All` requires every occurrence to.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValueTest {
    pub field: FieldMatcher,
    pub value: Value,
}

impl FieldValueTest {
    fn passes(&self, values: &[FieldValue]) -> bool {
        match self.field.position {
            Position::All => {
                let mut any = false;
                for fv in values {
                    if self.field.covers(fv.field) {
                        any = true;
                        if fv.value != self.value {
                            return false;
                        }
                    }
                }
                any
            }
            Position::Any => values
                .iter()
                .any(|fv| self.field.covers(fv.field) && fv.value == self.value),
            _ => crate::dimension::filter_single_value(&self.field, values)
                .is_some_and(|fv| fv.value == self.value),
        }
    }
}

/// Rewrites applied to a matched atom before it reaches conditions and
/// producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transformation {
    /// Keep only the first element of the attribution chain rooted at
    /// `chain_field`; all other fields pass through.
    TruncateAttributionFirst { chain_field: u8 },
}

impl Transformation {
    fn apply(&self, atom: &Atom) -> Atom {
        match self {
            Transformation::TruncateAttributionFirst { chain_field } => {
                let values = atom
                    .values()
                    .iter()
                    .filter(|fv| {
                        fv.field.path.at(0) != *chain_field
                            || fv.field.path.depth() == 0
                            || fv.field.path.at(1) == 1
                    })
                    .cloned()
                    .collect();
                Atom::new(atom.tag(), atom.source_uid(), atom.elapsed_ns(), values)
            }
        }
    }
}

/// A conjunction of field tests over a single atom tag.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleAtomMatcher {
    pub id: i64,
    pub tag: i32,
    pub tests: Vec<FieldValueTest>,
    pub transformation: Option<Transformation>,
}

/// Logical combination of previously declared matchers, referenced by index.
/// Children always precede the parent in the matcher list.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinationAtomMatcher {
    pub id: i64,
    pub op: LogicalOp,
    pub children: Vec<usize>,
}

/// The matcher family, dispatched by tag.
#[derive(Debug, Clone, PartialEq)]
pub enum AtomMatcher {
    Simple(SimpleAtomMatcher),
    Combination(CombinationAtomMatcher),
}

impl AtomMatcher {
    pub fn id(&self) -> i64 {
        match self {
            AtomMatcher::Simple(m) => m.id,
            AtomMatcher::Combination(m) => m.id,
        }
    }

    /// Tag ids this matcher is interested in, used to build the dispatch map.
    pub fn interested_tags(&self, all: &[AtomMatcher]) -> Vec<i32> {
        match self {
            AtomMatcher::Simple(m) => vec![m.tag],
            AtomMatcher::Combination(m) => {
                let mut tags: Vec<i32> = m
                    .children
                    .iter()
                    .filter_map(|&c| all.get(c))
                    .flat_map(|child| child.interested_tags(all))
                    .collect();
                tags.sort_unstable();
                tags.dedup();
                tags
            }
        }
    }
}

/// Evaluate matcher `index` against `atom`, memoizing into `cache` and
/// recording rewritten atoms in `transformed`. Child matchers are evaluated
/// on demand; both caches must be sized to the matcher list.
pub fn evaluate_matcher(
    matchers: &[AtomMatcher],
    index: usize,
    atom: &Atom,
    cache: &mut [MatchingState],
    transformed: &mut [Option<Arc<Atom>>],
) {
    if cache[index] != MatchingState::NotComputed {
        return;
    }
    let state = match &matchers[index] {
        AtomMatcher::Simple(m) => {
            if m.tag != atom.tag() {
                MatchingState::NotMatched
            } else if m.tests.iter().all(|t| t.passes(atom.values())) {
                if let Some(tf) = &m.transformation {
                    transformed[index] = Some(Arc::new(tf.apply(atom)));
                }
                MatchingState::Matched
            } else {
                MatchingState::NotMatched
            }
        }
        AtomMatcher::Combination(m) => {
            for &child in &m.children {
                evaluate_matcher(matchers, child, atom, cache, transformed);
            }
            let matched = |i: &usize| cache[*i] == MatchingState::Matched;
            let result = match m.op {
                LogicalOp::And => m.children.iter().all(matched),
                LogicalOp::Or => m.children.iter().any(matched),
                LogicalOp::Not => !m.children.iter().any(matched),
            };
            if result {
                // Combinations pass through the first child's rewrite, if any.
                transformed[index] = m
                    .children
                    .iter()
                    .find_map(|&c| transformed[c].clone());
                MatchingState::Matched
            } else {
                MatchingState::NotMatched
            }
        }
    };
    cache[index] = state;
}
