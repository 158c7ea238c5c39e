//! Result snapshots and deltas produced by computation cycles.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Identifier of a single computed output within a view.
pub type OutputKey = String;

/// Sequence number of a computation cycle, monotonic within a view.
pub type CycleId = u64;

/// Tolerance applied when deciding whether an output value changed between
/// cycles. Values closer than this are treated as equal.
pub const VALUE_TOLERANCE: f64 = 1e-12;

/// Full snapshot of every output computed by one cycle. Never mutated after
/// construction.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ResultModel {
    pub cycle_id: CycleId,
    pub computed_at: i64,
    pub values: HashMap<OutputKey, f64>,
}

impl ResultModel {
    pub fn new(cycle_id: CycleId, computed_at: i64, values: HashMap<OutputKey, f64>) -> Self {
        Self {
            cycle_id,
            computed_at,
            values,
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// The outputs that changed relative to a stated baseline snapshot. Contains
/// changed keys only, never the full output set.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeltaModel {
    pub cycle_id: CycleId,
    pub values: HashMap<OutputKey, f64>,
}

impl DeltaModel {
    pub fn new(cycle_id: CycleId, values: HashMap<OutputKey, f64>) -> Self {
        Self { cycle_id, values }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

pub fn value_changed(previous: f64, current: f64) -> bool {
    if previous.is_nan() && current.is_nan() {
        return false;
    }
    (previous - current).abs() > VALUE_TOLERANCE
}

/// Computes the delta between a baseline snapshot and the current one. A key
/// of `current` is included iff it is absent from the baseline or its value
/// moved beyond [VALUE_TOLERANCE]. Keys that disappeared from `current` are
/// treated as unchanged and never appear in the delta.
pub fn diff(baseline: Option<&ResultModel>, current: &ResultModel) -> DeltaModel {
    let mut values = HashMap::new();
    for (key, value) in &current.values {
        let changed = match baseline.and_then(|b| b.get(key)) {
            Some(previous) => value_changed(previous, *value),
            None => true,
        };
        if changed {
            values.insert(key.clone(), *value);
        }
    }
    DeltaModel::new(current.cycle_id, values)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{diff, ResultModel, VALUE_TOLERANCE};

    fn result(cycle_id: u64, values: Vec<(&str, f64)>) -> ResultModel {
        let values: HashMap<String, f64> =
            values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        ResultModel::new(cycle_id, 100, values)
    }

    #[test]
    fn diff_against_empty_baseline_contains_every_key() {
        let current = result(0, vec![("p1", 1.0), ("p2", 2.0)]);
        let delta = diff(None, &current);
        assert_eq!(delta.len(), 2);
        assert_eq!(delta.get("p1"), Some(1.0));
        assert_eq!(delta.get("p2"), Some(2.0));
    }

    #[test]
    fn diff_contains_changed_keys_only() {
        let baseline = result(0, vec![("p1", 1.0), ("p2", 2.0)]);
        let current = result(1, vec![("p1", 3.0), ("p2", 2.0)]);
        let delta = diff(Some(&baseline), &current);
        assert_eq!(delta.len(), 1);
        assert_eq!(delta.get("p1"), Some(3.0));
        assert_eq!(delta.get("p2"), None);
    }

    #[test]
    fn diff_every_delta_key_exists_in_current_and_differs_from_baseline() {
        let baseline = result(0, vec![("p1", 1.0), ("p2", 2.0), ("gone", 9.0)]);
        let current = result(1, vec![("p1", 1.0), ("p2", 4.0), ("new", 5.0)]);
        let delta = diff(Some(&baseline), &current);
        for (key, value) in &delta.values {
            let in_current = current.get(key).expect("delta key missing from current");
            assert_eq!(*value, in_current);
            if let Some(base) = baseline.get(key) {
                assert!((base - value).abs() > VALUE_TOLERANCE);
            }
        }
        // A key that disappeared never shows up as a change.
        assert_eq!(delta.get("gone"), None);
        assert_eq!(delta.len(), 2);
    }

    #[test]
    fn diff_moves_within_tolerance_are_not_changes() {
        let baseline = result(0, vec![("p1", 1.0)]);
        let current = result(1, vec![("p1", 1.0 + VALUE_TOLERANCE / 2.0)]);
        let delta = diff(Some(&baseline), &current);
        assert!(delta.is_empty());
    }

    #[test]
    fn result_round_trips_through_bytes() {
        let current = result(7, vec![("p1", 1.5)]);
        let decoded = ResultModel::from_bytes(&current.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.cycle_id, 7);
        assert_eq!(decoded.get("p1"), Some(1.5));
    }
}
