//! In-memory vector index with nearest-neighbor search by distance.
//!
//! Entries are keyed by chunk id and carry the full chunk so a loaded
//! replica can answer queries without touching chunk files.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::content::Chunk;

/// An entry in the vector index.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

/// In-memory vector index.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    entries: HashMap<String, VectorEntry>,
    dimensions: usize,
}

/// A candidate returned by [`VectorIndex::nearest`].
#[derive(Debug, Clone)]
pub struct Neighbor<'a> {
    pub chunk: &'a Chunk,
    /// Squared euclidean distance to the query
    pub distance: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot index zero-norm vector")]
    ZeroNormVector,

    #[error("Embedding contains non-finite values")]
    NonFinite,
}

impl VectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            dimensions,
        }
    }

    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the entry for `chunk.id`.
    pub fn insert(&mut self, chunk: Chunk, embedding: Vec<f32>) -> Result<(), IndexError> {
        self.check_vector(&embedding)?;

        if l2_norm(&embedding) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        self.entries
            .insert(chunk.id.clone(), VectorEntry { chunk, embedding });

        Ok(())
    }

    /// Remove every chunk of a content source, returning the removed ids.
    pub fn remove_content(&mut self, content_id: &str) -> Vec<String> {
        let ids = self.chunk_ids_for(content_id);
        for id in &ids {
            self.entries.remove(id);
        }
        ids
    }

    pub fn get(&self, id: &str) -> Option<&VectorEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Chunk ids of one content source, ordered by chunk position.
    pub fn chunk_ids_for(&self, content_id: &str) -> Vec<String> {
        let mut chunks: Vec<&Chunk> = self
            .entries
            .values()
            .map(|entry| &entry.chunk)
            .filter(|chunk| chunk.content_id.as_str() == content_id)
            .collect();
        chunks.sort_by(|a, b| a.ordinal().cmp(&b.ordinal()).then_with(|| a.id.cmp(&b.id)));
        chunks.into_iter().map(|chunk| chunk.id.clone()).collect()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.entries.values().map(|entry| &entry.chunk)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VectorEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The `k` entries closest to `query`, nearest first.
    ///
    /// Equal distances are ordered by chunk id so results are reproducible.
    pub fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor<'_>>, IndexError> {
        self.check_vector(query)?;

        if k == 0 {
            return Ok(vec![]);
        }

        let mut neighbors: Vec<Neighbor<'_>> = self
            .entries
            .par_iter()
            .map(|(_, entry)| Neighbor {
                chunk: &entry.chunk,
                distance: squared_l2(query, &entry.embedding),
            })
            .collect();

        neighbors.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        neighbors.truncate(k);

        Ok(neighbors)
    }

    fn check_vector(&self, v: &[f32]) -> Result<(), IndexError> {
        if v.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: v.len(),
            });
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(IndexError::NonFinite);
        }
        Ok(())
    }
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Squared euclidean distance. For unit vectors this is `2 - 2cos`, in `[0, 4]`.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}
