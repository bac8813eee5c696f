//! In-memory brute-force cosine-similarity vector index (spec.md §4.3).
//!
//! Kept in sync with storage by the façade: `upsert` on every put whose
//! merged record carries a non-empty vector, `remove` on delete or when a
//! merge drops the vector. Rebuilt at startup by streaming every record
//! from storage (see `facade.rs::Database::open`).

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::record::Embedding;

/// One indexed entry: the vector plus its insertion order, used to break
/// ties deterministically (spec.md §4.3).
struct Entry {
    vector: Embedding,
    order: u64,
}

/// Brute-force nearest-neighbour index over node vectors.
pub struct VectorIndex {
    entries: RwLock<HashMap<String, Entry>>,
    next_order: std::sync::atomic::AtomicU64,
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_order: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn upsert(&self, id: &str, vector: Embedding) {
        let mut entries = self.entries.write();
        let order = match entries.get(id) {
            Some(existing) => existing.order,
            None => self.next_order.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        };
        entries.insert(id.to_string(), Entry { vector, order });
    }

    pub fn remove(&self, id: &str) {
        self.entries.write().remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top-k most similar entries to `query`, highest similarity first.
    /// Ties are broken by insertion order (earlier wins). Non-finite scores
    /// are filtered out. Returns an empty sequence if the index is empty.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        let entries = self.entries.read();
        let mut scored: Vec<(String, f32, u64)> = entries
            .iter()
            .filter_map(|(id, entry)| {
                let score = cosine_similarity(query, &entry.vector);
                score.is_finite().then(|| (id.clone(), score, entry.order))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.2.cmp(&b.2)));
        scored.into_iter().take(k).map(|(id, score, _)| (id, score)).collect()
    }
}

/// Cosine similarity in `[-1, 1]`. Uses the shorter of the two lengths if
/// they differ (spec.md §4.3).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    if len == 0 {
        return f32::NAN;
    }
    let (a, b) = (&a[..len], &b[..len]);

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return f32::NAN;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_have_similarity_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_have_similarity_zero() {
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn mismatched_lengths_use_shorter() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_index_returns_empty_results() {
        let idx = VectorIndex::new();
        assert!(idx.search(&[1.0, 0.0], 5).is_empty());
    }

    #[test]
    fn search_orders_by_similarity_with_insertion_order_tiebreak() {
        let idx = VectorIndex::new();
        idx.upsert("a", vec![1.0, 0.0]);
        idx.upsert("b", vec![1.0, 0.0]); // tie with a, inserted after
        idx.upsert("c", vec![0.0, 1.0]);

        let results = idx.search(&[1.0, 0.0], 3);
        assert_eq!(results[0].0, "a");
        assert_eq!(results[1].0, "b");
        assert_eq!(results[2].0, "c");
    }

    #[test]
    fn remove_drops_entry_from_search() {
        let idx = VectorIndex::new();
        idx.upsert("a", vec![1.0, 0.0]);
        idx.remove("a");
        assert!(idx.is_empty());
    }
}
