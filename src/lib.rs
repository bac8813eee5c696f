//! Local-first, peer-to-peer document/graph store: CRDT merge over a flat
//! record schema, pluggable durable storage, a brute-force vector index, a
//! reactive rule engine, and a multi-transport replication fabric.
//!
//! The crate root only declares modules and re-exports the surface a
//! collaborator (CLI, language binding, SQL front-end) builds on —
//! `Database`, `Storage`, and `Transport`/`Connection` (spec.md §1, §9).

pub mod config;
pub mod embedding;
pub mod error;
pub mod facade;
pub mod merge;
pub mod record;
pub mod replication;
pub mod rules;
pub mod sanitize;
pub mod storage;
pub mod vector;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
pub use facade::{Database, Stats, SubscriptionHandle, VectorQuery};
pub use record::{DataMap, NodeRecord, Value, VectorClock};
pub use replication::{Connection, Transport};
pub use rules::{Rule, RuleContext, RuleEngine};
pub use storage::Storage;
