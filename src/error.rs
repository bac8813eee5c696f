//! Error taxonomy (spec.md §7).
//!
//! Every public façade operation returns `Result<T, CoreError>`. Replication
//! and transport glue use `anyhow::Result` internally (as the teacher's
//! `iroh.rs`/`s2s.rs` do) and convert into `CoreError::TransportFailure` only
//! at the boundary where a failure would otherwise escape to the façade —
//! per spec.md §7, transport errors are logged and confined to the
//! offending connection, never surfaced to the high-level caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("operation called before initialisation or after close")]
    NotReady,

    #[error("failed to open storage: {0}")]
    StorageOpen(String),

    #[error("failed to write to storage: {0}")]
    StorageWrite(String),

    #[error("failed to read from storage: {0}")]
    StorageRead(String),

    #[error("merge called on records with different ids: {0} != {1}")]
    MergeMismatch(String, String),

    #[error("no history entry at timestamp {timestamp} for node {id}")]
    VersionNotFound { id: String, timestamp: i64 },

    #[error("sync key does not match /^[0-9a-f]{{64}}$/")]
    InvalidSyncKey,

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("malformed inbound frame: {0}")]
    ProtocolParse(String),
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::StorageRead(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::ProtocolParse(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
