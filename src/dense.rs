use std::collections::HashSet;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    candidate::{RankedCandidate, top_k},
    error::{Error, Result},
    registry::ChunkId,
};

/// The embedding of one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub chunk_id: ChunkId,
    pub vector: Vec<f32>,
}

/// Exact cosine-similarity search over one embedding per chunk.
///
/// Vectors are L2-normalised once at build time, so a query is a single
/// dot product per row. Rows are scored in parallel; the result order is
/// independent of thread scheduling.
#[derive(Debug, Default)]
pub struct DenseIndex {
    built: Option<DenseData>,
}

#[derive(Debug)]
struct DenseData {
    dimension: usize,
    /// Row index -> chunk id.
    ids: Vec<ChunkId>,
    /// Vectors exactly as supplied, row-major.
    raw: Vec<f32>,
    /// Unit-length copies of `raw`, row-major.
    unit: Vec<f32>,
}

impl DenseIndex {
    /// Build from embedding records, replacing any previous contents.
    ///
    /// On error the index is left unbuilt.
    pub fn build(
        &mut self,
        records: impl IntoIterator<Item = EmbeddingRecord>,
    ) -> Result<()> {
        self.built = None;

        let mut dimension = None;
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        let mut raw = Vec::new();

        for record in records {
            let expected = *dimension.get_or_insert(record.vector.len());
            if record.vector.is_empty() {
                return Err(Error::IntegrityMismatch(format!(
                    "embedding for {} is empty",
                    record.chunk_id
                )));
            }
            if record.vector.len() != expected {
                return Err(Error::DimensionMismatch {
                    chunk_id: record.chunk_id.to_string(),
                    expected,
                    found: record.vector.len(),
                });
            }
            if record.vector.iter().any(|x| !x.is_finite()) {
                return Err(Error::IntegrityMismatch(format!(
                    "embedding for {} has non-finite components",
                    record.chunk_id
                )));
            }
            if !seen.insert(record.chunk_id.clone()) {
                return Err(Error::DuplicateChunk(record.chunk_id));
            }
            ids.push(record.chunk_id);
            raw.extend_from_slice(&record.vector);
        }

        let dimension = dimension.unwrap_or(0);
        let unit = if dimension == 0 {
            Vec::new()
        } else {
            raw.par_chunks(dimension).flat_map_iter(normalized).collect()
        };

        info!(rows = ids.len(), dimension, "dense index built");
        self.built = Some(DenseData {
            dimension,
            ids,
            raw,
            unit,
        });
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.built.is_some()
    }

    /// Embedding dimensionality, `0` for an empty corpus.
    pub fn dimension(&self) -> Result<usize> {
        Ok(self.data()?.dimension)
    }

    pub fn len(&self) -> usize {
        self.built.as_ref().map_or(0, |d| d.ids.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunk ids in row order.
    pub fn chunk_ids(&self) -> Result<&[ChunkId]> {
        Ok(&self.data()?.ids)
    }

    /// The original (un-normalised) vectors, in row order.
    pub fn records(&self) -> Result<Vec<EmbeddingRecord>> {
        let data = self.data()?;
        if data.dimension == 0 {
            return Ok(Vec::new());
        }
        Ok(data
            .ids
            .iter()
            .zip(data.raw.chunks(data.dimension))
            .map(|(id, v)| EmbeddingRecord {
                chunk_id: id.clone(),
                vector: v.to_vec(),
            })
            .collect())
    }

    /// The `k` most similar chunks to `vector`, best first.
    ///
    /// Exact similarity ties are broken by ascending chunk id. `k` is
    /// clamped to the corpus size.
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<RankedCandidate>> {
        let data = self.data()?;
        if data.ids.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if vector.len() != data.dimension {
            return Err(Error::DimensionMismatch {
                chunk_id: "<query>".to_string(),
                expected: data.dimension,
                found: vector.len(),
            });
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(Error::invalid(
                "query vector",
                "contains non-finite components",
            ));
        }

        let query: Vec<f32> = normalized(vector).collect();
        let scores: Vec<f32> = data
            .unit
            .par_chunks(data.dimension)
            .map(|row| dot(row, &query))
            .collect();

        let scored = scores.into_iter().zip(data.ids.iter()).collect();
        let ranked = top_k(scored, k);
        debug!(k, returned = ranked.len(), "dense query");
        Ok(ranked)
    }

    fn data(&self) -> Result<&DenseData> {
        self.built.as_ref().ok_or(Error::NotReady {
            component: "dense index",
        })
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Unit-length copy of `v`; a zero vector stays zero.
///
/// The norm is accumulated in f64 so large finite components cannot overflow
/// it to infinity.
fn normalized(v: &[f32]) -> impl Iterator<Item = f32> + '_ {
    let norm = v
        .iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt();
    let scale = if norm > 0.0 { norm.recip() } else { 0.0 };
    v.iter().map(move |&x| (f64::from(x) * scale) as f32)
}
