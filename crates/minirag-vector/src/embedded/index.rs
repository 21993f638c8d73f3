//! Dense secondary index of the embedded engine
//!
//! Stores every vector of a collection as one row of an `ndarray` matrix.
//! For the cosine metric rows are pre-normalized, so a single matrix-vector
//! product scores the whole collection.

use minirag_core::DistanceMetric;
use ndarray::{s, Array2, ArrayView1, Axis};
use std::collections::HashMap;

pub struct DenseIndex {
    metric: DistanceMetric,
    ids: Vec<i64>,
    positions: HashMap<i64, usize>,
    matrix: Array2<f32>,
}

impl DenseIndex {
    /// Build an index over `(id, vector)` pairs
    pub fn build<'a, I>(metric: DistanceMetric, width: usize, points: I) -> Self
    where
        I: IntoIterator<Item = (i64, &'a [f32])>,
    {
        let mut index = Self {
            metric,
            ids: Vec::new(),
            positions: HashMap::new(),
            matrix: Array2::zeros((0, width)),
        };
        for (id, vector) in points {
            index.upsert(id, vector);
        }
        index
    }

    /// Insert or overwrite the row of `id`
    pub fn upsert(&mut self, id: i64, vector: &[f32]) {
        let row = self.prepare(vector);

        match self.positions.get(&id).copied() {
            Some(pos) => self.matrix.row_mut(pos).assign(&row),
            None => {
                // push_row only fails on a width mismatch, which callers rule out
                if self.matrix.push_row(row.view()).is_ok() {
                    self.positions.insert(id, self.ids.len());
                    self.ids.push(id);
                }
            }
        }
    }

    /// Drop the row of `id`, moving the last row into its slot
    pub fn remove(&mut self, id: i64) -> bool {
        let Some(pos) = self.positions.remove(&id) else {
            return false;
        };

        let last = self.ids.len() - 1;
        if pos != last {
            let moved = self.matrix.row(last).to_owned();
            self.matrix.row_mut(pos).assign(&moved);
            let moved_id = self.ids[last];
            self.ids[pos] = moved_id;
            self.positions.insert(moved_id, pos);
        }
        self.ids.pop();
        self.matrix.slice_collapse(s![..last, ..]);
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Top `limit` `(id, score)` pairs, highest score first
    pub fn search(&self, query: &[f32], limit: usize) -> Vec<(i64, f32)> {
        if self.is_empty() || limit == 0 {
            return Vec::new();
        }

        let query = self.prepare(query);
        let scores = self.matrix.dot(&query);

        let mut scored: Vec<(i64, f32)> = self
            .ids
            .iter()
            .copied()
            .zip(scores.iter().copied())
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        scored
    }

    fn prepare(&self, vector: &[f32]) -> ndarray::Array1<f32> {
        let view = ArrayView1::from(vector);
        match self.metric {
            DistanceMetric::Dot => view.to_owned(),
            DistanceMetric::Cosine => {
                let norm = view.dot(&view).sqrt();
                if norm > 0.0 {
                    view.mapv(|x| x / norm)
                } else {
                    view.to_owned()
                }
            }
        }
    }

    /// Number of stored rows, as reported in collection details
    pub fn rows(&self) -> usize {
        self.matrix.len_of(Axis(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_index_ranks_by_angle() {
        let vectors: Vec<(i64, Vec<f32>)> = vec![
            (1, vec![10.0, 0.0]),
            (2, vec![0.0, 3.0]),
            (3, vec![1.0, 1.0]),
        ];
        let index = DenseIndex::build(
            DistanceMetric::Cosine,
            2,
            vectors.iter().map(|(id, v)| (*id, v.as_slice())),
        );

        let results = index.search(&[1.0, 0.0], 3);
        assert_eq!(results[0].0, 1);
        assert!((results[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(results[1].0, 3);
        assert_eq!(results[2].0, 2);
    }

    #[test]
    fn test_upsert_overwrites_existing_row() {
        let mut index = DenseIndex::build(DistanceMetric::Dot, 2, Vec::<(i64, &[f32])>::new());
        index.upsert(7, &[1.0, 0.0]);
        index.upsert(7, &[0.0, 2.0]);

        assert_eq!(index.len(), 1);
        assert_eq!(index.rows(), 1);
        let results = index.search(&[0.0, 1.0], 1);
        assert_eq!(results, vec![(7, 2.0)]);
    }

    #[test]
    fn test_remove_keeps_remaining_rows_addressable() {
        let mut index = DenseIndex::build(DistanceMetric::Dot, 1, Vec::<(i64, &[f32])>::new());
        for id in 1..=3 {
            index.upsert(id, &[id as f32]);
        }

        assert!(index.remove(1));
        assert!(!index.remove(1));
        assert_eq!(index.rows(), 2);
        assert_eq!(index.search(&[1.0], 3), vec![(3, 3.0), (2, 2.0)]);

        index.upsert(3, &[0.5]);
        index.upsert(4, &[4.0]);
        assert_eq!(index.search(&[1.0], 1), vec![(4, 4.0)]);
        assert_eq!(index.len(), 3);
    }
}
