//! Exact nearest-neighbor index over squared Euclidean distance.
//!
//! [`FlatL2Index`] stores all rows in one contiguous `n × d` buffer and
//! answers queries by scanning every row. There is no approximation: the
//! corpus is expected to fit in memory (hundreds to low thousands of chunks),
//! where a flat scan is both fast enough and exact.
//!
//! Distances are **squared** L2, the same scale FAISS `IndexFlatL2` reports.
//! Only the relative ordering is part of the contract.
//!
//! # Example
//!
//! ```rust
//! use docqa_core::index::FlatL2Index;
//!
//! let index = FlatL2Index::build(&[vec![0.0, 0.0], vec![1.0, 0.0], vec![10.0, 10.0]]).unwrap();
//! let hits = index.search(&[0.1, 0.0], 2).unwrap();
//! assert_eq!(hits.indices, vec![0, 1]);
//! ```

use std::cmp::Ordering;

use crate::embedding::{squared_l2, uniform_dimension, Vector};
use crate::error::{PipelineError, Result};

/// Parallel distance/index sequences returned by [`FlatL2Index::search`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHits {
    /// Squared L2 distances, non-decreasing.
    pub distances: Vec<f32>,
    /// Row numbers matching `distances` position for position.
    pub indices: Vec<usize>,
}

impl SearchHits {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Iterate `(row, distance)` pairs in rank order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.indices
            .iter()
            .copied()
            .zip(self.distances.iter().copied())
    }
}

/// Brute-force exact search structure.
#[derive(Debug, Clone)]
pub struct FlatL2Index {
    dim: usize,
    rows: usize,
    data: Vec<f32>,
}

impl FlatL2Index {
    /// Build an index from `n` rows of `d` components.
    ///
    /// # Errors
    ///
    /// [`PipelineError::InvalidVectorShape`] if `n == 0`, `d == 0`, or rows
    /// differ in length.
    pub fn build(vectors: &[Vector]) -> Result<Self> {
        let dim = uniform_dimension(vectors)?;
        let mut data = Vec::with_capacity(vectors.len() * dim);
        for v in vectors {
            data.extend_from_slice(v);
        }
        tracing::debug!(rows = vectors.len(), dim, "built flat L2 index");
        Ok(Self {
            dim,
            rows: vectors.len(),
            data,
        })
    }

    /// Vector dimensionality.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of indexed rows.
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Return the `top_k` rows closest to `query`.
    ///
    /// Results are ordered by ascending distance with ties broken by the lower
    /// row number. `top_k` larger than the row count returns every row;
    /// `top_k == 0` returns nothing.
    ///
    /// # Errors
    ///
    /// [`PipelineError::DimensionMismatch`] if `query.len() != dim()`.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<SearchHits> {
        if query.len() != self.dim {
            return Err(PipelineError::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        let k = top_k.min(self.rows);
        if k == 0 {
            return Ok(SearchHits::default());
        }

        let mut scored: Vec<(f32, usize)> = self
            .data
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(i, row)| (squared_l2(row, query), i))
            .collect();

        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, rank_order);
            scored.truncate(k);
        }
        scored.sort_unstable_by(rank_order);

        let (distances, indices) = scored.into_iter().unzip();
        Ok(SearchHits { distances, indices })
    }
}

/// Ascending distance, then ascending row. NaN sorts after every number.
fn rank_order(a: &(f32, usize), b: &(f32, usize)) -> Ordering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Vec<Vector> {
        (0..50)
            .map(|i| vec![(i % 7) as f32, (i / 7) as f32, (i * 3 % 5) as f32])
            .collect()
    }

    #[test]
    fn test_three_point_scenario() {
        let index = FlatL2Index::build(&[vec![0.0, 0.0], vec![1.0, 0.0], vec![10.0, 10.0]]).unwrap();
        let hits = index.search(&[0.1, 0.0], 2).unwrap();
        assert_eq!(hits.indices, vec![0, 1]);
        assert!((hits.distances[0] - 0.01).abs() < 1e-6);
        assert!((hits.distances[1] - 0.81).abs() < 1e-6);
    }

    #[test]
    fn test_exact_match_recovery() {
        let vectors = grid();
        let index = FlatL2Index::build(&vectors).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            let hits = index.search(v, 1).unwrap();
            assert_eq!(hits.distances, vec![0.0]);
            // Duplicated rows resolve to the first occurrence.
            let first = vectors.iter().position(|w| w == v).unwrap();
            assert_eq!(hits.indices, vec![first], "row {}", i);
        }
    }

    #[test]
    fn test_results_non_decreasing() {
        let index = FlatL2Index::build(&grid()).unwrap();
        let hits = index.search(&[2.5, 3.1, 0.4], 20).unwrap();
        assert_eq!(hits.len(), 20);
        assert!(hits.distances.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_partial_selection_matches_full_sort() {
        let index = FlatL2Index::build(&grid()).unwrap();
        let query = [1.2, 4.4, 2.0];
        let all = index.search(&query, 50).unwrap();
        let top = index.search(&query, 7).unwrap();
        assert_eq!(top.indices, all.indices[..7].to_vec());
    }

    #[test]
    fn test_top_k_larger_than_rows_returns_all() {
        let index = FlatL2Index::build(&[vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let hits = index.search(&[0.0], 10).unwrap();
        assert_eq!(hits.indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_top_k_zero_returns_nothing() {
        let index = FlatL2Index::build(&[vec![1.0]]).unwrap();
        assert!(index.search(&[1.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_ties_broken_by_lowest_index() {
        let index =
            FlatL2Index::build(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![-1.0, 0.0], vec![0.0, -1.0]])
                .unwrap();
        let hits = index.search(&[0.0, 0.0], 4).unwrap();
        assert_eq!(hits.indices, vec![0, 1, 2, 3]);
        let hits = index.search(&[0.0, 0.0], 2).unwrap();
        assert_eq!(hits.indices, vec![0, 1]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let index = FlatL2Index::build(&[vec![1.0, 2.0]]).unwrap();
        assert_eq!(
            index.search(&[1.0, 2.0, 3.0], 1).unwrap_err(),
            PipelineError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        );
    }

    #[test]
    fn test_build_rejects_bad_shapes() {
        assert!(matches!(
            FlatL2Index::build(&[]),
            Err(PipelineError::InvalidVectorShape(_))
        ));
        assert!(matches!(
            FlatL2Index::build(&[vec![]]),
            Err(PipelineError::InvalidVectorShape(_))
        ));
        assert!(matches!(
            FlatL2Index::build(&[vec![1.0, 2.0], vec![1.0]]),
            Err(PipelineError::InvalidVectorShape(_))
        ));
    }

    #[test]
    fn test_build_dimensions() {
        let index = FlatL2Index::build(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(index.dim(), 2);
        assert_eq!(index.len(), 2);
    }
}
