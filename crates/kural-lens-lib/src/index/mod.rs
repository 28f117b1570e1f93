pub mod flat;

use crate::config::NORMALIZE_EPS;

/// Parallel arrays returned by a nearest-neighbour search, best match first.
///
/// A position of `-1` marks an empty slot (the index held fewer vectors than
/// requested); its score is `f32::NEG_INFINITY`.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub scores: Vec<f32>,
    pub positions: Vec<i64>,
}

impl SearchResult {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Iterate `(score, position)` pairs in rank order.
    pub fn iter(&self) -> impl Iterator<Item = (f32, i64)> + '_ {
        self.scores
            .iter()
            .copied()
            .zip(self.positions.iter().copied())
    }
}

/// Similarity search over fixed-dimension vectors by inner product.
///
/// Position `i` of the index is aligned with entry `i` of the corpus metadata.
pub trait VectorIndex: Send + Sync {
    /// Dimension of every stored vector.
    fn dimension(&self) -> usize;

    /// Total number of stored vectors.
    fn ntotal(&self) -> usize;

    /// Return the `k` stored vectors with the highest inner product with `query`,
    /// ordered by descending score.
    fn search(&self, query: &[f32], k: usize) -> anyhow::Result<SearchResult>;
}

/// L2-normalize a vector in place. Vectors with (near) zero norm are left unchanged.
pub fn normalize_l2(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > NORMALIZE_EPS {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Inner product of two equal-length vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
