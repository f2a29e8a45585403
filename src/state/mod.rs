//! Slicing-state tracking.
//!
//! A state atom announces the current value of some device/system state,
//! keyed by primary fields (e.g. the uid a screen-state applies to). The
//! tracker keeps the latest value per primary key so producers can slice
//! aggregates by state at event time.

use std::collections::HashMap;

use crate::dimension::{filter_single_value, filter_values, DimensionKey};
use crate::field::{Atom, Field, FieldMatcher, FieldValue, Value};

/// Sentinel state value reported when a key has no known state.
pub const STATE_UNKNOWN: i32 = -1;

/// A state transition observed for one primary key.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub atom_id: i32,
    pub primary_key: DimensionKey,
    pub old_value: FieldValue,
    pub new_value: FieldValue,
}

/// Tracks the current value of one state atom.
#[derive(Debug)]
pub struct StateTracker {
    pub atom_id: i32,
    pub primary_fields: Vec<FieldMatcher>,
    pub value_field: FieldMatcher,
    values: HashMap<DimensionKey, FieldValue>,
}

impl StateTracker {
    pub fn new(atom_id: i32, primary_fields: Vec<FieldMatcher>, value_field: FieldMatcher) -> Self {
        StateTracker {
            atom_id,
            primary_fields,
            value_field,
            values: HashMap::new(),
        }
    }

    /// The synthesized value reported for unknown keys.
    fn unknown_value(&self) -> FieldValue {
        FieldValue::new(
            Field::new(self.atom_id, self.value_field.field.path),
            Value::Int(STATE_UNKNOWN),
        )
    }

    /// Apply a state atom. Returns the transition when the tracked value
    /// actually changed.
    pub fn on_atom(&mut self, atom: &Atom) -> Option<StateChange> {
        debug_assert_eq!(atom.tag(), self.atom_id);
        let primary_key = if self.primary_fields.is_empty() {
            DimensionKey::empty()
        } else {
            filter_values(&self.primary_fields, atom.values())?
        };
        let new_value = filter_single_value(&self.value_field, atom.values())?;

        let old_value = self
            .values
            .insert(primary_key.clone(), new_value.clone())
            .unwrap_or_else(|| self.unknown_value());

        if old_value == new_value {
            return None;
        }
        Some(StateChange {
            atom_id: self.atom_id,
            primary_key,
            old_value,
            new_value,
        })
    }

    /// The current value for a primary key; unknown keys report the
    /// sentinel.
    pub fn query(&self, primary_key: &DimensionKey) -> FieldValue {
        self.values
            .get(primary_key)
            .cloned()
            .unwrap_or_else(|| self.unknown_value())
    }

    pub fn live_keys(&self) -> usize {
        self.values.len()
    }
}

/// All state trackers of one configuration, keyed by state atom id, plus the
/// per-metric value→group maps.
#[derive(Debug, Default)]
pub struct StateManager {
    trackers: HashMap<i32, StateTracker>,
}

impl StateManager {
    pub fn new() -> Self {
        StateManager::default()
    }

    pub fn register(&mut self, tracker: StateTracker) {
        self.trackers.insert(tracker.atom_id, tracker);
    }

    pub fn is_state_atom(&self, tag: i32) -> bool {
        self.trackers.contains_key(&tag)
    }

    pub fn on_atom(&mut self, atom: &Atom) -> Option<StateChange> {
        self.trackers.get_mut(&atom.tag())?.on_atom(atom)
    }

    pub fn query(&self, atom_id: i32, primary_key: &DimensionKey) -> Option<FieldValue> {
        self.trackers.get(&atom_id).map(|t| t.query(primary_key))
    }

    /// Remove and return a tracker, carrying its values across a config
    /// update that preserved the state.
    pub fn take_tracker(&mut self, atom_id: i32) -> Option<StateTracker> {
        self.trackers.remove(&atom_id)
    }
}

/// Rewrites a state value through a metric's value→group map. Values absent
/// from a non-empty map collapse to the unknown sentinel.
pub fn map_state_value(group_map: Option<&HashMap<i64, i64>>, value: &mut FieldValue) {
    let Some(map) = group_map else {
        return;
    };
    match map.get(&value.value.as_long()) {
        Some(group) => value.value = Value::Long(*group),
        None => value.value = Value::Int(STATE_UNKNOWN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldPath;

    const SCREEN_STATE: i32 = 29;

    fn tracker_with_uid_primary() -> StateTracker {
        StateTracker::new(
            SCREEN_STATE,
            vec![FieldMatcher::exact(Field::new(
                SCREEN_STATE,
                FieldPath::leaf(1),
            ))],
            FieldMatcher::exact(Field::new(SCREEN_STATE, FieldPath::leaf(2))),
        )
    }

    fn state_atom(uid: i32, state: i32) -> Atom {
        Atom::new(
            SCREEN_STATE,
            1000,
            1,
            vec![
                FieldValue::new(
                    Field::new(SCREEN_STATE, FieldPath::leaf(1)),
                    Value::Int(uid),
                ),
                FieldValue::new(
                    Field::new(SCREEN_STATE, FieldPath::leaf(2)),
                    Value::Int(state),
                ),
            ],
        )
    }

    fn uid_key(uid: i32) -> DimensionKey {
        DimensionKey::new(vec![FieldValue::new(
            Field::new(SCREEN_STATE, FieldPath::leaf(1)),
            Value::Int(uid),
        )])
    }

    #[test]
    fn test_unknown_before_first_atom() {
        let t = tracker_with_uid_primary();
        assert_eq!(t.query(&uid_key(7)).value, Value::Int(STATE_UNKNOWN));
    }

    #[test]
    fn test_tracks_latest_value_per_key() {
        let mut t = tracker_with_uid_primary();

        let change = t.on_atom(&state_atom(7, 1)).expect("changed");
        assert_eq!(change.old_value.value, Value::Int(STATE_UNKNOWN));
        assert_eq!(change.new_value.value, Value::Int(1));

        t.on_atom(&state_atom(8, 2));
        assert_eq!(t.query(&uid_key(7)).value, Value::Int(1));
        assert_eq!(t.query(&uid_key(8)).value, Value::Int(2));
        assert_eq!(t.live_keys(), 2);
    }

    #[test]
    fn test_same_value_is_not_a_change() {
        let mut t = tracker_with_uid_primary();
        t.on_atom(&state_atom(7, 1));
        assert!(t.on_atom(&state_atom(7, 1)).is_none());
    }

    #[test]
    fn test_group_mapping() {
        let mut map = HashMap::new();
        map.insert(1, 100);
        map.insert(2, 100);
        map.insert(3, 200);

        let mut fv = FieldValue::new(
            Field::new(SCREEN_STATE, FieldPath::leaf(2)),
            Value::Int(2),
        );
        map_state_value(Some(&map), &mut fv);
        assert_eq!(fv.value, Value::Long(100));

        let mut unmapped = FieldValue::new(
            Field::new(SCREEN_STATE, FieldPath::leaf(2)),
            Value::Int(9),
        );
        map_state_value(Some(&map), &mut unmapped);
        assert_eq!(unmapped.value, Value::Int(STATE_UNKNOWN));

        let mut untouched = FieldValue::new(
            Field::new(SCREEN_STATE, FieldPath::leaf(2)),
            Value::Int(9),
        );
        map_state_value(None, &mut untouched);
        assert_eq!(untouched.value, Value::Int(9));
    }

    #[test]
    fn test_manager_routes_by_tag() {
        let mut mgr = StateManager::new();
        mgr.register(tracker_with_uid_primary());
        assert!(mgr.is_state_atom(SCREEN_STATE));
        assert!(!mgr.is_state_atom(1));

        mgr.on_atom(&state_atom(7, 3));
        let value = mgr.query(SCREEN_STATE, &uid_key(7)).expect("tracked");
        assert_eq!(value.value, Value::Int(3));
    }
}
