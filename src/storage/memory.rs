//! Ephemeral in-memory storage backend (spec.md §4.2 variant (a)).
//!
//! Mirrors the teacher's `Db::open_memory` role: tests and throwaway nodes
//! only, no file ever touches disk.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::Storage;
use crate::error::CoreResult;
use crate::record::NodeRecord;

#[derive(Default)]
pub struct MemoryStorage {
    nodes: RwLock<HashMap<String, NodeRecord>>,
    history: RwLock<HashMap<String, Vec<NodeRecord>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn set_node(&self, record: &NodeRecord) -> CoreResult<()> {
        self.nodes.write().insert(record.id.clone(), record.clone());
        self.history.write().entry(record.id.clone()).or_default().push(record.clone());
        Ok(())
    }

    fn get_node(&self, id: &str) -> CoreResult<Option<NodeRecord>> {
        Ok(self.nodes.read().get(id).cloned())
    }

    fn delete_node(&self, id: &str) -> CoreResult<()> {
        self.nodes.write().remove(id);
        Ok(())
    }

    fn list_nodes(&self) -> CoreResult<Vec<NodeRecord>> {
        Ok(self.nodes.read().values().cloned().collect())
    }

    fn get_node_history(&self, id: &str) -> CoreResult<Vec<NodeRecord>> {
        Ok(self.history.read().get(id).cloned().unwrap_or_default())
    }

    fn prune_history(&self, id: &str, max_keep: usize) -> CoreResult<()> {
        if let Some(entries) = self.history.write().get_mut(id) {
            let len = entries.len();
            if len > max_keep {
                entries.drain(0..len - max_keep);
            }
        }
        Ok(())
    }
}
