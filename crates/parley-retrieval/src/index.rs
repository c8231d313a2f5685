//! In-memory vector index with brute-force cosine similarity search.
//!
//! Session indexes hold at most a few thousand chunks, so an O(n) scan per
//! query is fast enough.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use parley_core::error::ParleyError;

/// A chunk of an attached document.
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub source: PathBuf,
    /// Position of the chunk within its source file.
    pub chunk_index: usize,
    pub text: String,
}

/// A single hit returned from a vector search.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: Uuid,
    /// Cosine similarity score.
    pub score: f64,
    pub passage: Passage,
}

#[derive(Debug, Clone)]
struct VectorEntry {
    embedding: Vec<f32>,
    passage: Passage,
}

/// In-memory vector index using brute-force cosine similarity.
///
/// Thread-safe via interior RwLock.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    entries: Arc<RwLock<HashMap<Uuid, VectorEntry>>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert a vector and its passage. Overwrites any entry with the same ID.
    pub fn insert(&self, id: Uuid, embedding: Vec<f32>, passage: Passage) -> Result<(), ParleyError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| ParleyError::Retrieval(format!("Lock poisoned: {}", e)))?;
        entries.insert(id, VectorEntry { embedding, passage });
        Ok(())
    }

    /// Search for the k nearest neighbors to the query vector by cosine similarity.
    ///
    /// Returns results sorted by descending similarity score; equal scores
    /// keep document order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, ParleyError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| ParleyError::Retrieval(format!("Lock poisoned: {}", e)))?;

        let mut scored: Vec<SearchHit> = entries
            .iter()
            .map(|(id, entry)| SearchHit {
                id: *id,
                score: cosine_similarity(query, &entry.embedding),
                passage: entry.passage.clone(),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.passage.source.cmp(&b.passage.source))
                .then_with(|| a.passage.chunk_index.cmp(&b.passage.chunk_index))
        });
        scored.truncate(k);

        Ok(scored)
    }

    /// Return the number of vectors currently stored in the index.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 if the lengths differ or either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum();

    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(source: &str, chunk_index: usize) -> Passage {
        Passage {
            source: PathBuf::from(source),
            chunk_index,
            text: format!("{source}#{chunk_index}"),
        }
    }

    #[test]
    fn test_insert_and_search() {
        let index = VectorIndex::new();
        index
            .insert(Uuid::new_v4(), vec![1.0, 0.0, 0.0], passage("a.txt", 0))
            .unwrap();
        index
            .insert(Uuid::new_v4(), vec![0.0, 1.0, 0.0], passage("b.txt", 0))
            .unwrap();
        assert_eq!(index.len(), 2);

        let hits = index.search(&[0.9, 0.1, 0.0], 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].passage.source, PathBuf::from("a.txt"));
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_search_empty_index() {
        let index = VectorIndex::new();
        let hits = index.search(&[1.0f32; 8], 10).unwrap();
        assert!(hits.is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_search_respects_k_limit() {
        let index = VectorIndex::new();
        for i in 0..10 {
            index
                .insert(Uuid::new_v4(), vec![1.0f32; 8], passage("doc.txt", i))
                .unwrap();
        }
        let hits = index.search(&[1.0f32; 8], 3).unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_equal_scores_keep_document_order() {
        let index = VectorIndex::new();
        for i in (0..4).rev() {
            index
                .insert(Uuid::new_v4(), vec![1.0f32; 4], passage("doc.txt", i))
                .unwrap();
        }
        let order: Vec<usize> = index
            .search(&[1.0f32; 4], 4)
            .unwrap()
            .iter()
            .map(|h| h.passage.chunk_index)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 1.0]), 0.0);
    }
}
