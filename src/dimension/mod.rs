//! Dimension keys and the field filters that build them.
//!
//! A dimension key is an ordered sequence of field values; two keys are equal
//! iff their values are equal field-by-field after position masking. Filters
//! walk a matcher list over an atom's values and either produce a complete
//! key or nothing at all.

pub mod sampler;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::field::{FieldMatcher, FieldValue, Position};

/// An ordered sequence of field values identifying one slice of a metric.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimensionKey {
    values: Vec<FieldValue>,
}

impl DimensionKey {
    pub fn new(values: Vec<FieldValue>) -> Self {
        DimensionKey { values }
    }

    /// The empty key, used by unsliced metrics.
    pub fn empty() -> Self {
        DimensionKey { values: Vec::new() }
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, value: FieldValue) {
        self.values.push(value);
    }

    /// True if every value of `sub` appears in `self`, comparing field and
    /// value. Used by sliced-condition queries with partial links.
    pub fn contains(&self, sub: &DimensionKey) -> bool {
        sub.values()
            .iter()
            .all(|needle| self.values.iter().any(|fv| fv == needle))
    }

    /// Deterministic 32-bit digest, stable across processes and reboots.
    /// Feeds the dimension sampler; not used for in-memory maps.
    pub fn stable_hash(&self) -> u32 {
        let mut hasher = Sha256::new();
        for fv in &self.values {
            hasher.update(fv.field.tag.to_le_bytes());
            hasher.update(fv.field.path.raw().to_le_bytes());
            hasher.update([fv.value.type_id()]);
            match &fv.value {
                crate::field::Value::Int(v) => hasher.update(v.to_le_bytes()),
                crate::field::Value::Long(v) => hasher.update(v.to_le_bytes()),
                crate::field::Value::Float(v) => hasher.update(v.to_bits().to_le_bytes()),
                crate::field::Value::Str(v) => hasher.update(v.as_bytes()),
                crate::field::Value::Bytes(v) => hasher.update(v),
            }
        }
        let digest = hasher.finalize();
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}

/// The full key a producer files aggregates under: the dimension derived
/// from the matched event plus the current values of the slicing states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricDimensionKey {
    what: DimensionKey,
    state_values: DimensionKey,
}

impl MetricDimensionKey {
    pub fn new(what: DimensionKey, state_values: DimensionKey) -> Self {
        MetricDimensionKey { what, state_values }
    }

    pub fn what(&self) -> &DimensionKey {
        &self.what
    }

    pub fn state_values(&self) -> &DimensionKey {
        &self.state_values
    }

    pub fn has_state_values(&self) -> bool {
        !self.state_values.is_empty()
    }
}

/// Identity of a captured atom: tag plus its filtered field values. Used by
/// the event and gauge producers to deduplicate identical atoms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtomKey {
    pub tag: i32,
    pub field_values: DimensionKey,
}

impl AtomKey {
    pub fn new(tag: i32, field_values: DimensionKey) -> Self {
        AtomKey { tag, field_values }
    }
}

/// Translates between a metric's "what" fields and the fields of the linked
/// condition atom for one dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricConditionLink {
    pub condition_id: i64,
    pub metric_fields: Vec<FieldMatcher>,
    pub condition_fields: Vec<FieldMatcher>,
}

/// Translates between a metric's "what" fields and the primary-key fields of
/// a slicing-state atom.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricStateLink {
    pub state_atom_id: i32,
    pub metric_fields: Vec<FieldMatcher>,
    pub state_fields: Vec<FieldMatcher>,
}

/// Extracts the single value addressed by `matcher`, with position masking
/// applied for non-exact selectors. `All` selectors are rejected here; use
/// [`filter_values`] for key construction.
pub fn filter_single_value(matcher: &FieldMatcher, values: &[FieldValue]) -> Option<FieldValue> {
    if matcher.position == Position::All {
        return None;
    }
    let mut out = None;
    for fv in values {
        if !matcher.covers(fv.field) {
            continue;
        }
        match matcher.position {
            Position::Exact | Position::Any | Position::First => {
                out = Some(fv.clone());
                break;
            }
            // Last occurrence wins; keep scanning.
            Position::Last => out = Some(fv.clone()),
            Position::All => unreachable!(),
        }
    }
    let mut fv = out?;
    if let Some(level) = matcher.position_level() {
        fv.field.path = fv.field.path.with_index_masked(level);
    }
    Some(fv)
}

/// Builds a dimension key by walking `matchers` in order over `values`.
///
/// The filter fails as a unit: if any matcher finds no occurrence, no key is
/// produced. Filtering is referentially transparent; the same atom and
/// matcher list always yield equal keys.
pub fn filter_values(matchers: &[FieldMatcher], values: &[FieldValue]) -> Option<DimensionKey> {
    let mut key = DimensionKey::empty();
    for matcher in matchers {
        match matcher.position {
            Position::All => {
                let mut found = false;
                for fv in values {
                    if matcher.covers(fv.field) {
                        let mut copy = fv.clone();
                        if let Some(level) = matcher.position_level() {
                            copy.field.path = copy.field.path.with_index_masked(level);
                        }
                        key.push(copy);
                        found = true;
                    }
                }
                if !found {
                    return None;
                }
            }
            _ => key.push(filter_single_value(matcher, values)?),
        }
    }
    Some(key)
}

/// Builds a dimension key from `dim_matchers` and, in the same pass over the
/// atom, resolves the indices of the `value_matchers` hits. Used by producers
/// that need both slicing and aggregation fields from one atom.
pub fn filter_values_with_indices(
    dim_matchers: &[FieldMatcher],
    value_matchers: &[FieldMatcher],
    values: &[FieldValue],
) -> Option<(DimensionKey, Vec<usize>)> {
    let key = filter_values(dim_matchers, values)?;
    let mut indices = Vec::with_capacity(value_matchers.len());
    for matcher in value_matchers {
        let idx = values.iter().position(|fv| matcher.covers(fv.field))?;
        indices.push(idx);
    }
    Some((key, indices))
}

/// Snapshot filter for gauge capture: copies every value addressed by any of
/// the matchers, without masking. An empty matcher list copies everything.
pub fn filter_gauge_values(matchers: &[FieldMatcher], values: &[FieldValue]) -> Vec<FieldValue> {
    if matchers.is_empty() {
        return values.to_vec();
    }
    values
        .iter()
        .filter(|fv| matchers.iter().any(|m| m.covers(fv.field)))
        .cloned()
        .collect()
}

/// Projects a metric event's values onto the linked condition atom's field
/// space, producing the key to query the sliced condition with.
pub fn dimension_for_condition(
    event_values: &[FieldValue],
    link: &MetricConditionLink,
) -> DimensionKey {
    translate_fields(event_values, &link.metric_fields, &link.condition_fields)
}

/// Projects a metric event's values onto the linked state atom's primary-key
/// field space.
pub fn dimension_for_state(event_values: &[FieldValue], link: &MetricStateLink) -> DimensionKey {
    translate_fields(event_values, &link.metric_fields, &link.state_fields)
}

fn translate_fields(
    event_values: &[FieldValue],
    from: &[FieldMatcher],
    to: &[FieldMatcher],
) -> DimensionKey {
    let mut key = DimensionKey::empty();
    for (metric_field, target_field) in from.iter().zip(to.iter()) {
        if let Some(mut fv) = filter_single_value(metric_field, event_values) {
            // Readdress the value into the target atom's field space so it
            // compares equal to keys built from that atom directly.
            fv.field = target_field.field;
            if let Some(level) = target_field.position_level() {
                fv.field.path = fv.field.path.with_index_masked(level);
            }
            key.push(fv);
        }
    }
    key
}

/// True if `primary_key` (from a state atom) addresses a subset of
/// `what_key`'s values through one of the configured state links.
pub fn contains_linked_state_values(
    what_key: &DimensionKey,
    primary_key: &DimensionKey,
    state_links: &[MetricStateLink],
    state_atom_id: i32,
) -> bool {
    if primary_key.values().len() > what_key.values().len() {
        return false;
    }
    for state_value in primary_key.values() {
        let mut matched = false;
        for what_value in what_key.values() {
            if state_value.value == what_value.value
                && linked(state_links, state_atom_id, state_value, what_value)
            {
                matched = true;
                break;
            }
        }
        if !matched {
            return false;
        }
    }
    true
}

fn linked(
    state_links: &[MetricStateLink],
    state_atom_id: i32,
    state_value: &FieldValue,
    metric_value: &FieldValue,
) -> bool {
    state_links.iter().any(|link| {
        link.state_atom_id == state_atom_id
            && link
                .state_fields
                .iter()
                .zip(link.metric_fields.iter())
                .any(|(sf, mf)| sf.covers(state_value.field) && mf.covers(metric_value.field))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{Field, FieldPath, Value};
    use std::collections::HashMap;

    fn flat(tag: i32, field_num: u8, value: Value) -> FieldValue {
        FieldValue::new(Field::new(tag, FieldPath::leaf(field_num)), value)
    }

    fn chain_uid(tag: i32, index: u8, uid: i32) -> FieldValue {
        FieldValue::new(
            Field::new(tag, FieldPath::nested(1, index, 1)),
            Value::Int(uid),
        )
    }

    #[test]
    fn test_filter_exact() {
        let values = vec![flat(5, 1, Value::Int(7)), flat(5, 2, Value::Str("a".into()))];
        let matchers = vec![FieldMatcher::exact(Field::new(5, FieldPath::leaf(2)))];
        let key = filter_values(&matchers, &values).expect("key");
        assert_eq!(key.values().len(), 1);
        assert_eq!(key.values()[0].value, Value::Str("a".into()));
    }

    #[test]
    fn test_filter_fails_as_a_unit() {
        let values = vec![flat(5, 1, Value::Int(7))];
        let matchers = vec![
            FieldMatcher::exact(Field::new(5, FieldPath::leaf(1))),
            FieldMatcher::exact(Field::new(5, FieldPath::leaf(9))),
        ];
        assert!(filter_values(&matchers, &values).is_none());
    }

    #[test]
    fn test_filter_last_masks_position() {
        let matchers = vec![FieldMatcher::new(
            Field::new(5, FieldPath::nested(1, 1, 1)),
            Position::Last,
        )];

        let a = vec![chain_uid(5, 5, 1000)];
        let b = vec![chain_uid(5, 6, 1000)];
        let key_a = filter_values(&matchers, &a).expect("key");
        let key_b = filter_values(&matchers, &b).expect("key");
        assert_eq!(key_a, key_b);

        let mut map: HashMap<DimensionKey, u32> = HashMap::new();
        map.insert(key_a, 1);
        assert_eq!(map.get(&key_b), Some(&1));
    }

    #[test]
    fn test_filter_first_vs_last() {
        let values = vec![chain_uid(5, 1, 10), chain_uid(5, 2, 20)];
        let first = FieldMatcher::new(Field::new(5, FieldPath::nested(1, 1, 1)), Position::First);
        let last = FieldMatcher::new(Field::new(5, FieldPath::nested(1, 1, 1)), Position::Last);

        let f = filter_single_value(&first, &values).expect("first");
        let l = filter_single_value(&last, &values).expect("last");
        assert_eq!(f.value, Value::Int(10));
        assert_eq!(l.value, Value::Int(20));
    }

    #[test]
    fn test_filter_all_expands_chain() {
        let values = vec![chain_uid(5, 1, 10), chain_uid(5, 2, 20), flat(5, 2, Value::Int(0))];
        let matchers = vec![FieldMatcher::new(
            Field::new(5, FieldPath::nested(1, 1, 1)),
            Position::All,
        )];
        let key = filter_values(&matchers, &values).expect("key");
        assert_eq!(key.values().len(), 2);
        // All copies carry the masked position.
        for fv in key.values() {
            assert_eq!(fv.field.path.at(1), crate::field::POSITION_IRRELEVANT);
        }
    }

    #[test]
    fn test_filter_is_idempotent() {
        let values = vec![chain_uid(5, 3, 42), flat(5, 2, Value::Long(9))];
        let matchers = vec![
            FieldMatcher::new(Field::new(5, FieldPath::nested(1, 1, 1)), Position::Last),
            FieldMatcher::exact(Field::new(5, FieldPath::leaf(2))),
        ];
        let once = filter_values(&matchers, &values).expect("key");
        // Filtering the filtered output again must be a fixed point.
        let twice = filter_values(&matchers, once.values()).expect("key");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_filter_with_value_indices() {
        let values = vec![
            flat(5, 1, Value::Int(7)),
            flat(5, 2, Value::Long(100)),
            flat(5, 3, Value::Int(1)),
        ];
        let dims = vec![FieldMatcher::exact(Field::new(5, FieldPath::leaf(1)))];
        let vals = vec![FieldMatcher::exact(Field::new(5, FieldPath::leaf(2)))];
        let (key, indices) = filter_values_with_indices(&dims, &vals, &values).expect("hit");
        assert_eq!(key.values().len(), 1);
        assert_eq!(indices, vec![1]);
    }

    #[test]
    fn test_filter_gauge_values_no_masking() {
        let values = vec![chain_uid(5, 4, 77), flat(5, 2, Value::Int(3))];
        let matchers = vec![FieldMatcher::new(
            Field::new(5, FieldPath::nested(1, 1, 1)),
            Position::Any,
        )];
        let out = filter_gauge_values(&matchers, &values);
        assert_eq!(out.len(), 1);
        // Snapshot semantics: the original position survives.
        assert_eq!(out[0].field.path.at(1), 4);
    }

    #[test]
    fn test_dimension_for_condition_readdresses() {
        let link = MetricConditionLink {
            condition_id: 99,
            metric_fields: vec![FieldMatcher::exact(Field::new(5, FieldPath::leaf(1)))],
            condition_fields: vec![FieldMatcher::exact(Field::new(8, FieldPath::leaf(2)))],
        };
        let values = vec![flat(5, 1, Value::Int(1001))];
        let key = dimension_for_condition(&values, &link);
        assert_eq!(key.values().len(), 1);
        assert_eq!(key.values()[0].field.tag, 8);
        assert_eq!(key.values()[0].field.path, FieldPath::leaf(2));
        assert_eq!(key.values()[0].value, Value::Int(1001));
    }

    #[test]
    fn test_contains_linked_state_values() {
        let link = MetricStateLink {
            state_atom_id: 27,
            metric_fields: vec![FieldMatcher::exact(Field::new(10, FieldPath::leaf(1)))],
            state_fields: vec![FieldMatcher::exact(Field::new(27, FieldPath::leaf(1)))],
        };
        let what = DimensionKey::new(vec![
            flat(10, 1, Value::Int(1005)),
            flat(10, 2, Value::Str("compose".into())),
        ]);
        let primary = DimensionKey::new(vec![flat(27, 1, Value::Int(1005))]);
        assert!(contains_linked_state_values(&what, &primary, &[link.clone()], 27));

        let other_primary = DimensionKey::new(vec![flat(59, 1, Value::Int(1005))]);
        assert!(!contains_linked_state_values(&what, &other_primary, &[link], 59));
    }

    #[test]
    fn test_stable_hash_is_deterministic() {
        let key = DimensionKey::new(vec![flat(5, 1, Value::Int(1001))]);
        let again = DimensionKey::new(vec![flat(5, 1, Value::Int(1001))]);
        assert_eq!(key.stable_hash(), again.stable_hash());
        let other = DimensionKey::new(vec![flat(5, 1, Value::Int(1002))]);
        assert_ne!(key.stable_hash(), other.stable_hash());
    }
}
