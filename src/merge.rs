//! Deterministic per-field merge between a locally-stored record and an
//! incoming one (spec.md §4.1). Commutative and idempotent up to vector-clock
//! join (P1, P2); last-write-wins by timestamp with a deterministic
//! per-field tie-break when timestamps are equal (P3, S6).

use crate::error::{CoreError, CoreResult};
use crate::record::{join_clocks, DataMap, NodeRecord, StateMap, Value};

/// `merge(local, incoming) -> record`. See spec.md §4.1 for the full
/// algorithm; this function implements it verbatim.
pub fn merge(local: Option<&NodeRecord>, incoming: &NodeRecord) -> CoreResult<NodeRecord> {
    let local = match local {
        None => return Ok(incoming.clone()),
        Some(l) => l,
    };

    if local.id != incoming.id {
        return Err(CoreError::MergeMismatch(local.id.clone(), incoming.id.clone()));
    }

    let merged_clock = join_clocks(&local.vector_clock, &incoming.vector_clock);

    if incoming.timestamp > local.timestamp {
        let (data, state) = deep_merge(&local.data, &local.state, &incoming.data, &incoming.state, incoming.timestamp);
        return Ok(NodeRecord {
            id: incoming.id.clone(),
            data,
            node_type: incoming.node_type.clone().or_else(|| local.node_type.clone()),
            vector: incoming.vector.clone().or_else(|| local.vector.clone()),
            timestamp: incoming.timestamp,
            state,
            vector_clock: merged_clock,
        });
    }

    if incoming.timestamp < local.timestamp {
        let mut result = local.clone();
        result.vector_clock = merged_clock;
        return Ok(result);
    }

    // Equal timestamps: deep-merge with per-field tie-break (incoming wins
    // ties of `state[field]` too — spec.md §4.1 step 6).
    let (data, state) = deep_merge(&local.data, &local.state, &incoming.data, &incoming.state, incoming.timestamp);
    Ok(NodeRecord {
        id: incoming.id.clone(),
        data,
        node_type: incoming.node_type.clone().or_else(|| local.node_type.clone()),
        vector: incoming.vector.clone().or_else(|| local.vector.clone()),
        timestamp: incoming.timestamp,
        state,
        vector_clock: merged_clock,
    })
}

/// Deep per-field merge of `base`/`base_state` with `incoming`/`incoming_state`
/// at merge timestamp `merge_ts`. See spec.md §4.1.
fn deep_merge(
    base: &DataMap,
    base_state: &StateMap,
    incoming: &DataMap,
    incoming_state: &StateMap,
    merge_ts: i64,
) -> (DataMap, StateMap) {
    let mut out_data = base.clone();
    let mut out_state = base_state.clone();

    for (key, inc_value) in incoming {
        let inc_ts = *incoming_state.get(key).unwrap_or(&merge_ts);
        let base_ts = *base_state.get(key).unwrap_or(&0);

        if inc_ts < base_ts {
            continue; // base wins, skip this key entirely
        }

        if inc_value.is_null() {
            out_data.remove(key);
            out_state.insert(key.clone(), inc_ts);
            continue;
        }

        // Recurse into nested mappings using the same top-level timestamps
        // for both sides (flat scheme: spec.md §4.1).
        if let (Some(base_map), Value::Mapping(inc_map)) = (base.get(key).and_then(Value::as_mapping), inc_value) {
            let mut nested_base_state = StateMap::new();
            let mut nested_inc_state = StateMap::new();
            for k in base_map.keys().chain(inc_map.keys()) {
                nested_base_state.insert(k.clone(), base_ts);
                nested_inc_state.insert(k.clone(), inc_ts);
            }
            let (nested_data, _) = deep_merge(base_map, &nested_base_state, inc_map, &nested_inc_state, inc_ts);
            out_data.insert(key.clone(), Value::Mapping(nested_data));
            out_state.insert(key.clone(), inc_ts);
            continue;
        }

        out_data.insert(key.clone(), inc_value.clone());
        out_state.insert(key.clone(), inc_ts);
    }

    (out_data, out_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::VectorClock;
    use std::collections::BTreeMap;

    fn rec(id: &str, ts: i64, data: DataMap, state: StateMap, clock: VectorClock) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            data,
            node_type: None,
            vector: None,
            timestamp: ts,
            state,
            vector_clock: clock,
        }
    }

    fn map(pairs: &[(&str, Value)]) -> DataMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn state(pairs: &[(&str, i64)]) -> StateMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    /// P1: merge is commutative.
    #[test]
    fn p1_merge_is_commutative() {
        let a = rec("n1", 100, map(&[("x", Value::Number(1.0))]), state(&[("x", 100)]), VectorClock::new());
        let b = rec("n1", 200, map(&[("y", Value::Number(2.0))]), state(&[("y", 200)]), VectorClock::new());

        let ab = merge(Some(&a), &b).unwrap();
        let ba = merge(Some(&b), &a).unwrap();

        assert_eq!(ab.data, ba.data);
        assert_eq!(ab.state, ba.state);
        assert_eq!(ab.vector_clock, ba.vector_clock);
    }

    /// P2: merge is idempotent.
    #[test]
    fn p2_merge_is_idempotent() {
        let mut clock = VectorClock::new();
        clock.insert("p1".into(), 3);
        let a = rec("n1", 100, map(&[("x", Value::Number(1.0))]), state(&[("x", 100)]), clock);

        let merged = merge(Some(&a), &a).unwrap();
        assert_eq!(merged, a);
    }

    /// P3: LWW on differing timestamps, regardless of operand order.
    #[test]
    fn p3_lww_on_differing_timestamps() {
        let a = rec("n1", 100, map(&[("x", Value::Number(1.0))]), state(&[("x", 100)]), VectorClock::new());
        let b = rec("n1", 200, map(&[("x", Value::Number(2.0))]), state(&[("x", 200)]), VectorClock::new());

        let merged = merge(Some(&a), &b).unwrap();
        assert_eq!(merged.data, b.data);
        assert_eq!(merged.timestamp, 200);
    }

    /// P4: tombstone removes the key and records the tombstone timestamp.
    #[test]
    fn p4_tombstone_removes_key() {
        let a = rec("n1", 100, map(&[("x", Value::Number(1.0))]), state(&[("x", 100)]), VectorClock::new());
        let b = rec("n1", 200, map(&[("x", Value::Null)]), state(&[("x", 200)]), VectorClock::new());

        let merged = merge(Some(&a), &b).unwrap();
        assert!(!merged.data.contains_key("x"));
        assert_eq!(merged.state.get("x"), Some(&200));
    }

    /// S6: equal-timestamp merge, incoming wins on shared-key tie.
    #[test]
    fn s6_equal_timestamp_tie_break() {
        let a = rec(
            "n1",
            500,
            map(&[("a", Value::Number(1.0)), ("shared", Value::Number(1.0))]),
            state(&[("a", 500), ("shared", 500)]),
            VectorClock::new(),
        );
        let b = rec(
            "n1",
            500,
            map(&[("b", Value::Number(2.0)), ("shared", Value::Number(2.0))]),
            state(&[("b", 500), ("shared", 500)]),
            VectorClock::new(),
        );

        let merged = merge(Some(&a), &b).unwrap();
        assert_eq!(merged.data.get("a"), Some(&Value::Number(1.0)));
        assert_eq!(merged.data.get("b"), Some(&Value::Number(2.0)));
        assert_eq!(merged.data.get("shared"), Some(&Value::Number(2.0)));
    }

    #[test]
    fn merge_mismatch_on_different_ids() {
        let a = rec("n1", 100, BTreeMap::new(), BTreeMap::new(), VectorClock::new());
        let b = rec("n2", 100, BTreeMap::new(), BTreeMap::new(), VectorClock::new());
        assert!(matches!(merge(Some(&a), &b), Err(CoreError::MergeMismatch(_, _))));
    }

    #[test]
    fn merge_with_no_local_returns_incoming() {
        let b = rec("n1", 100, map(&[("x", Value::Number(1.0))]), state(&[("x", 100)]), VectorClock::new());
        let merged = merge(None, &b).unwrap();
        assert_eq!(merged, b);
    }

    #[test]
    fn stale_field_is_skipped() {
        // incoming has an older per-field timestamp than what's already stored
        let a = rec("n1", 500, map(&[("x", Value::Number(9.0))]), state(&[("x", 500)]), VectorClock::new());
        let mut incoming_data = map(&[("x", Value::Number(1.0))]);
        incoming_data.insert("y".into(), Value::Number(2.0));
        let b = rec("n1", 600, incoming_data, state(&[("x", 100), ("y", 600)]), VectorClock::new());

        let merged = merge(Some(&a), &b).unwrap();
        // x's incoming state (100) is older than base's (500) -> base wins
        assert_eq!(merged.data.get("x"), Some(&Value::Number(9.0)));
        assert_eq!(merged.data.get("y"), Some(&Value::Number(2.0)));
    }
}
