//! Keyed registry of in-memory vector indexes.
//!
//! Each key maps to an immutable [`IndexEntry`] (chunks, parallel vectors,
//! search structure) held behind an `Arc`. A `put` builds the new entry
//! completely before taking the write lock and swapping the `Arc`, so a
//! concurrent reader always observes either the old entry or the new one,
//! never a mix. Readers clone the `Arc` and release the lock before
//! searching, so a long query never blocks a build under another key.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::embedding::Vector;
use crate::error::{PipelineError, Result};
use crate::index::FlatL2Index;

/// One registered index: ordered chunks, their vectors, and the search
/// structure built over them. `vectors[i]` embeds `chunks[i]`.
#[derive(Debug)]
pub struct IndexEntry {
    chunks: Vec<String>,
    vectors: Vec<Vector>,
    index: FlatL2Index,
}

impl IndexEntry {
    /// Validate and build an entry.
    ///
    /// # Errors
    ///
    /// [`PipelineError::InconsistentIndexData`] when counts differ, or the
    /// shape errors of [`FlatL2Index::build`].
    pub fn new(chunks: Vec<String>, vectors: Vec<Vector>) -> Result<Self> {
        if chunks.len() != vectors.len() {
            return Err(PipelineError::InconsistentIndexData {
                chunks: chunks.len(),
                vectors: vectors.len(),
            });
        }
        let index = FlatL2Index::build(&vectors)?;
        Ok(Self {
            chunks,
            vectors,
            index,
        })
    }

    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }

    pub fn vectors(&self) -> &[Vector] {
        &self.vectors
    }

    pub fn index(&self) -> &FlatL2Index {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Search and map row numbers back to chunk text.
    pub fn query(&self, query_vector: &[f32], top_k: usize) -> Result<Vec<ChunkMatch>> {
        let hits = self.index.search(query_vector, top_k)?;
        Ok(hits
            .iter()
            .filter_map(|(row, distance)| {
                self.chunks.get(row).map(|text| ChunkMatch {
                    index: row,
                    text: text.clone(),
                    distance,
                })
            })
            .collect())
    }
}

/// A retrieved chunk with its rank data.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMatch {
    /// Position of the chunk in the entry's ordered sequence.
    pub index: usize,
    /// Verbatim chunk text.
    pub text: String,
    /// Squared L2 distance to the query.
    pub distance: f32,
}

/// Thread-safe `key → IndexEntry` map.
#[derive(Debug, Default)]
pub struct IndexRegistry {
    entries: RwLock<HashMap<String, Arc<IndexEntry>>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an entry and register it under `key`, replacing any previous one.
    ///
    /// On error the registry is left untouched.
    pub fn put(&self, key: &str, chunks: Vec<String>, vectors: Vec<Vector>) -> Result<usize> {
        let entry = IndexEntry::new(chunks, vectors)?;
        let count = entry.len();
        let dim = entry.index().dim();
        let previous = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), Arc::new(entry));
        tracing::info!(
            key,
            chunks = count,
            dim,
            replaced = previous.is_some(),
            "registered index"
        );
        Ok(count)
    }

    /// Fetch the entry registered under `key`.
    pub fn get(&self, key: &str) -> Result<Arc<IndexEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::IndexNotFound(key.to_string()))
    }

    /// Look up `key` and return the `top_k` closest chunks to `query_vector`.
    pub fn query(&self, key: &str, query_vector: &[f32], top_k: usize) -> Result<Vec<ChunkMatch>> {
        let entry = self.get(key)?;
        entry.query(query_vector, top_k)
    }

    /// Drop the entry under `key`. Returns whether one existed.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some();
        if removed {
            tracing::debug!(key, "removed index");
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}
