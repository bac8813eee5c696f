//! Payload sanitisation (spec.md §4.4, §9 "Cycles in input payloads").
//!
//! Host bindings hand the façade a payload built from a dynamic, possibly
//! self-referential object graph (the same shape a JS or Python binding
//! would pass across the boundary). `RawValue` models that graph explicitly
//! — `Rc<RefCell<_>>` nodes so two keys can alias the same sub-object, and a
//! `Function` variant so callables can be represented at all — and
//! `sanitize` walks it with a visited-set threaded through the recursion,
//! replacing functions and back-references with a fixed sentinel string
//! before it ever reaches `Value` (spec.md's merge-friendly, cycle-free tree).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::rc::Rc;

use crate::record::{DataMap, Value};

pub const FUNCTION_SENTINEL: &str = "[unsupported: function]";
pub const CYCLE_SENTINEL: &str = "[unsupported: circular reference]";

/// Keys that would perturb a runtime prototype in a dynamically-typed host
/// language. Stripped unconditionally from incoming data (spec.md §4.4).
const DANGEROUS_KEYS: &[&str] = &["__proto__", "constructor"];

/// A node in the raw, possibly-cyclic payload graph handed in by a caller
/// or host binding.
#[derive(Debug, Clone)]
pub enum RawValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Function,
    Sequence(Vec<Rc<RefCell<RawValue>>>),
    Mapping(BTreeMap<String, Rc<RefCell<RawValue>>>),
}

impl RawValue {
    pub fn leaf(v: RawValue) -> Rc<RefCell<RawValue>> {
        Rc::new(RefCell::new(v))
    }
}

/// Sanitise a raw payload into the merge-safe `Value` tree.
pub fn sanitize(raw: &Rc<RefCell<RawValue>>) -> Value {
    let mut visited: HashSet<usize> = HashSet::new();
    sanitize_inner(raw, &mut visited)
}

fn sanitize_inner(raw: &Rc<RefCell<RawValue>>, visited: &mut HashSet<usize>) -> Value {
    let ptr = Rc::as_ptr(raw) as usize;
    if visited.contains(&ptr) {
        return Value::Text(CYCLE_SENTINEL.to_string());
    }
    visited.insert(ptr);

    let result = match &*raw.borrow() {
        RawValue::Null => Value::Null,
        RawValue::Bool(b) => Value::Bool(*b),
        RawValue::Number(n) => {
            if n.is_finite() {
                Value::Number(*n)
            } else {
                Value::Null
            }
        }
        RawValue::Text(s) => Value::Text(s.clone()),
        RawValue::Function => Value::Text(FUNCTION_SENTINEL.to_string()),
        RawValue::Sequence(items) => {
            Value::Sequence(items.iter().map(|v| sanitize_inner(v, visited)).collect())
        }
        RawValue::Mapping(entries) => {
            let mut out = BTreeMap::new();
            for (k, v) in entries {
                if DANGEROUS_KEYS.contains(&k.as_str()) {
                    continue;
                }
                out.insert(k.clone(), sanitize_inner(v, visited));
            }
            Value::Mapping(out)
        }
    };

    visited.remove(&ptr);
    result
}

/// Convenience: sanitise data that is already a well-formed, cycle-free
/// `DataMap` (the common case — dangerous keys are still stripped).
pub fn sanitize_data_map(data: DataMap) -> DataMap {
    data.into_iter()
        .filter(|(k, _)| !DANGEROUS_KEYS.contains(&k.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(v: RawValue) -> Rc<RefCell<RawValue>> {
        RawValue::leaf(v)
    }

    /// P12: function, cycle, and `__proto__` all sanitise correctly in one payload.
    #[test]
    fn p12_sanitises_function_cycle_and_proto_key() {
        let mut root_map = BTreeMap::new();
        root_map.insert("name".to_string(), leaf(RawValue::Text("Alice".into())));
        root_map.insert("handler".to_string(), leaf(RawValue::Function));
        root_map.insert("__proto__".to_string(), leaf(RawValue::Text("evil".into())));

        let root = leaf(RawValue::Mapping(root_map));

        // introduce a cycle: root's "self" key points back at root
        if let RawValue::Mapping(m) = &mut *root.borrow_mut() {
            m.insert("self".to_string(), Rc::clone(&root));
        }

        let sanitized = sanitize(&root);
        let map = sanitized.as_mapping().unwrap();

        assert_eq!(map.get("name"), Some(&Value::Text("Alice".into())));
        assert_eq!(map.get("handler"), Some(&Value::Text(FUNCTION_SENTINEL.into())));
        assert!(!map.contains_key("__proto__"));
        assert_eq!(map.get("self"), Some(&Value::Text(CYCLE_SENTINEL.into())));
    }

    #[test]
    fn non_finite_numbers_become_null() {
        let root = leaf(RawValue::Number(f64::NAN));
        assert_eq!(sanitize(&root), Value::Null);
    }

    #[test]
    fn sanitize_data_map_strips_constructor_key() {
        let mut data = DataMap::new();
        data.insert("constructor".into(), Value::Text("x".into()));
        data.insert("ok".into(), Value::Text("y".into()));
        let out = sanitize_data_map(data);
        assert!(!out.contains_key("constructor"));
        assert!(out.contains_key("ok"));
    }
}
