//! Approximate nearest-neighbor indexing.

mod hnsw;

pub use hnsw::{HnswConfig, HnswIndex};

use serde::{Deserialize, Serialize};

/// A dense vector tagged with the model that produced it. Two vectors are
/// only comparable when their dimensions match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vector {
    pub values: Vec<f32>,
}

impl Vector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. `None` when dimensions differ.
    pub fn cosine_similarity(&self, other: &Vector) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let dot: f32 = self
            .values
            .iter()
            .zip(&other.values)
            .map(|(a, b)| a * b)
            .sum();
        let norm_a: f32 = self.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        let norm_b: f32 = other.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return Some(0.0);
        }
        Some(dot / (norm_a * norm_b))
    }
}

/// A scored search hit.
#[derive(Debug, Clone)]
pub struct AnnResult {
    pub id: String,
    pub score: f32,
}

/// Abstracts over ANN implementations (currently only HNSW) so the index
/// manager can swap strategies without the query executor noticing.
pub trait AnnIndex: Send + Sync {
    fn add(&self, id: String, vector: Vector) -> Result<(), crate::error::DbError>;
    fn remove(&self, id: &str);
    fn search(&self, query: &Vector, k: usize) -> Result<Vec<AnnResult>, crate::error::DbError>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn clear(&self);
    fn dimension(&self) -> Option<usize>;
}
