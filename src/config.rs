//! Process-wide configuration (spec.md §6.3), read once at startup and
//! passed by value — no process-wide singleton (spec.md §9 "Global
//! configuration"). Shaped like the teacher's `ServerConfig`, parsed with
//! `clap` for the example harness binary.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "graphdb-core", about = "Local-first peer-to-peer document store")]
pub struct CoreConfig {
    /// Location of the persistent store. If omitted, storage is in-memory.
    #[arg(long)]
    pub kv_path: Option<PathBuf>,

    /// Listening port for the built-in server-hosted socket transport.
    #[arg(long)]
    pub port: Option<u16>,

    /// Outbound dial addresses attempted at startup.
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Stable peer identifier. Defaults to a freshly generated id,
    /// persisted under `data_dir` so restarts keep the same identity.
    #[arg(long)]
    pub peer_id: Option<String>,

    /// Offset added to `port` to locate an optional HTTP surface. The core
    /// does not implement that surface (spec.md §1); this field only
    /// reserves room for a collaborator to use.
    #[arg(long)]
    pub api_port_offset: Option<u16>,

    /// 32-byte hex key enabling the DHT-discovery transport.
    #[arg(long)]
    pub sync_key: Option<String>,

    /// Directory for persisted identity/state that isn't the node store
    /// itself (e.g. the generated peer id, the DHT secret key).
    #[arg(long, default_value = ".")]
    pub data_dir: PathBuf,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            kv_path: None,
            port: None,
            peers: Vec::new(),
            peer_id: None,
            api_port_offset: None,
            sync_key: None,
            data_dir: PathBuf::from("."),
        }
    }
}

impl CoreConfig {
    pub fn data_dir(&self) -> &std::path::Path {
        &self.data_dir
    }
}
