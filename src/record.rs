//! The node record: the unit of replication.
//!
//! Schema follows spec.md §3.1. `Value` is a tagged sum so merge and
//! sanitisation can traverse payloads without depending on any particular
//! host-language representation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A dynamically-shaped field value stored inside a node's `data` map.
///
/// Flat JSON-ish tree: scalars, sequences, and nested maps. `Null` doubles
/// as the tombstone marker when it appears in an *incoming* update (see
/// `merge.rs`) — a stored record never actually holds a `Null` leaf, since
/// the merge step removes the key instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Sequence(Vec<Value>),
    Mapping(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_mapping(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Top-level field map of a record. Keyed by field name.
pub type DataMap = BTreeMap<String, Value>;

/// Per-top-level-field timestamp, used for deterministic tie-breaking
/// between writes that share a record-level `timestamp` (spec.md §3.1, §4.1).
pub type StateMap = BTreeMap<String, i64>;

/// A vector clock: peer id -> monotonically increasing counter.
/// Causal metadata only — never used to order writes (spec.md §4.2, GLOSSARY).
pub type VectorClock = BTreeMap<String, u64>;

/// Join two vector clocks pointwise (take the max of each entry).
pub fn join_clocks(a: &VectorClock, b: &VectorClock) -> VectorClock {
    let mut out = a.clone();
    for (peer, &count) in b {
        let entry = out.entry(peer.clone()).or_insert(0);
        if count > *entry {
            *entry = count;
        }
    }
    out
}

/// A fixed-dimension embedding vector used for similarity search.
pub type Embedding = Vec<f32>;

/// A node record: an opaque JSON-shaped document keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub data: DataMap,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<Embedding>,
    pub timestamp: i64,
    pub state: StateMap,
    #[serde(rename = "vectorClock")]
    pub vector_clock: VectorClock,
}

impl NodeRecord {
    /// Construct a brand-new record for a local write. `clock` should
    /// already include the bumped `self` entry (see `Database::put`).
    pub fn new(
        id: impl Into<String>,
        data: DataMap,
        node_type: Option<String>,
        vector: Option<Embedding>,
        timestamp: i64,
        clock: VectorClock,
    ) -> Self {
        let id = id.into();
        let state = data.keys().map(|k| (k.clone(), timestamp)).collect();
        Self {
            id,
            data,
            node_type,
            vector,
            timestamp,
            state,
            vector_clock: clock,
        }
    }

    /// True if `vector` is present and non-empty (spec.md §3.1, §4.3).
    pub fn has_vector(&self) -> bool {
        self.vector.as_ref().is_some_and(|v| !v.is_empty())
    }
}
