use std::collections::HashMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    candidate::{RankedCandidate, top_k},
    error::{Error, Result},
    registry::{Chunk, ChunkId},
    tokenizer::{Tokenizer, TokenizerPolicy},
};

/// BM25 tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    /// Term-frequency saturation.
    pub k1: f32,
    /// Length normalisation strength, `0..=1`.
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

impl Bm25Params {
    pub fn validate(&self) -> Result<()> {
        if !self.k1.is_finite() || self.k1 < 0.0 {
            return Err(Error::invalid(
                "bm25_k1",
                format!("must be a finite number >= 0, got {}", self.k1),
            ));
        }
        if !self.b.is_finite() || !(0.0..=1.0).contains(&self.b) {
            return Err(Error::invalid(
                "bm25_b",
                format!("must be between 0 and 1, got {}", self.b),
            ));
        }
        Ok(())
    }
}

/// One entry of a postings list.
///
/// `doc` is the chunk's ordinal: its position in the ascending list of
/// chunk ids, so ordinal order is chunk-id order.
#[repr(C)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    bytemuck::Pod,
    bytemuck::Zeroable,
)]
pub struct Posting {
    pub doc: u32,
    pub term_frequency: u32,
}

/// Inverted index with BM25 scoring.
#[derive(Debug)]
pub struct SparseIndex {
    tokenizer: Tokenizer,
    params: Bm25Params,
    built: Option<SparseData>,
}

#[derive(Debug)]
struct SparseData {
    /// Ordinal -> chunk id, ascending.
    ids: Vec<ChunkId>,
    /// Ordinal -> token count.
    doc_lengths: Vec<u32>,
    /// Term -> postings sorted by ordinal.
    postings: HashMap<String, Vec<Posting>>,
    avg_doc_len: f32,
}

impl Default for SparseIndex {
    fn default() -> Self {
        Self::new(TokenizerPolicy::default(), Bm25Params::default())
    }
}

impl SparseIndex {
    /// An unbuilt index.
    pub fn new(policy: TokenizerPolicy, params: Bm25Params) -> Self {
        Self {
            tokenizer: Tokenizer::new(policy),
            params,
            built: None,
        }
    }

    /// Tokenize every chunk and build the postings, replacing any previous
    /// contents. On error the index is left unbuilt.
    pub fn build<'a>(
        &mut self,
        chunks: impl IntoIterator<Item = &'a Chunk>,
    ) -> Result<()> {
        self.params.validate()?;
        self.built = None;

        let mut docs: Vec<(&ChunkId, &str)> = chunks
            .into_iter()
            .map(|c| (&c.id, c.text.as_str()))
            .collect();
        docs.sort_by(|a, b| a.0.cmp(b.0));
        if let Some(pair) = docs.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(Error::DuplicateChunk(pair[0].0.clone()));
        }

        let tokenized: Vec<(u32, HashMap<String, u32>)> = docs
            .par_iter()
            .map(|(_, text)| {
                let terms = self.tokenizer.tokenize(text);
                let len = terms.len() as u32;
                let mut counts: HashMap<String, u32> = HashMap::new();
                for term in terms {
                    *counts.entry(term).or_default() += 1;
                }
                (len, counts)
            })
            .collect();

        let mut postings: HashMap<String, Vec<Posting>> = HashMap::new();
        let mut doc_lengths = Vec::with_capacity(docs.len());
        for (ordinal, (len, counts)) in tokenized.into_iter().enumerate() {
            doc_lengths.push(len);
            for (term, term_frequency) in counts {
                postings.entry(term).or_default().push(Posting {
                    doc: ordinal as u32,
                    term_frequency,
                });
            }
        }

        let ids: Vec<ChunkId> =
            docs.into_iter().map(|(id, _)| id.clone()).collect();
        let avg_doc_len = average(&doc_lengths);

        info!(
            chunks = ids.len(),
            terms = postings.len(),
            avg_doc_len,
            "sparse index built"
        );
        self.built = Some(SparseData {
            ids,
            doc_lengths,
            postings,
            avg_doc_len,
        });
        Ok(())
    }

    /// Reassemble a built index from persisted parts, checking that the
    /// parts are consistent with each other.
    pub fn from_parts(
        policy: TokenizerPolicy,
        params: Bm25Params,
        ids: Vec<ChunkId>,
        doc_lengths: Vec<u32>,
        postings: HashMap<String, Vec<Posting>>,
    ) -> Result<Self> {
        params.validate()?;
        if ids.len() != doc_lengths.len() {
            return Err(Error::IntegrityMismatch(format!(
                "sparse index has {} chunk ids but {} document lengths",
                ids.len(),
                doc_lengths.len()
            )));
        }
        if let Some(pair) = ids.windows(2).find(|w| w[0] >= w[1]) {
            return Err(Error::IntegrityMismatch(format!(
                "sparse chunk ids out of order at {}",
                pair[1]
            )));
        }
        for (term, list) in &postings {
            let ordered = list.windows(2).all(|w| w[0].doc < w[1].doc);
            let in_range = list.iter().all(|p| {
                (p.doc as usize) < ids.len() && p.term_frequency > 0
            });
            if list.is_empty() || !ordered || !in_range {
                return Err(Error::IntegrityMismatch(format!(
                    "corrupt postings list for term '{term}'"
                )));
            }
        }

        let avg_doc_len = average(&doc_lengths);
        Ok(Self {
            tokenizer: Tokenizer::new(policy),
            params,
            built: Some(SparseData {
                ids,
                doc_lengths,
                postings,
                avg_doc_len,
            }),
        })
    }

    /// Replace the BM25 tunables. Postings do not depend on them, so this
    /// works on a built index.
    pub fn set_params(&mut self, params: Bm25Params) -> Result<()> {
        params.validate()?;
        self.params = params;
        Ok(())
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn is_ready(&self) -> bool {
        self.built.is_some()
    }

    pub fn len(&self) -> usize {
        self.built.as_ref().map_or(0, |d| d.ids.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunk ids in ordinal (ascending) order.
    pub fn chunk_ids(&self) -> Result<&[ChunkId]> {
        Ok(&self.data()?.ids)
    }

    pub fn doc_lengths(&self) -> Result<&[u32]> {
        Ok(&self.data()?.doc_lengths)
    }

    pub fn postings(&self) -> Result<&HashMap<String, Vec<Posting>>> {
        Ok(&self.data()?.postings)
    }

    pub fn avg_doc_len(&self) -> Result<f32> {
        Ok(self.data()?.avg_doc_len)
    }

    /// Number of chunks containing `term` (already tokenized).
    pub fn document_frequency(&self, term: &str) -> Result<usize> {
        Ok(self.data()?.postings.get(term).map_or(0, Vec::len))
    }

    /// The `k` best-scoring chunks for `text`, best first.
    ///
    /// Each distinct query term contributes once. Chunks matching no query
    /// term are left out; ties are broken by ascending chunk id.
    pub fn query(&self, text: &str, k: usize) -> Result<Vec<RankedCandidate>> {
        let data = self.data()?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut terms = self.tokenizer.tokenize(text);
        terms.sort_unstable();
        terms.dedup();

        let Bm25Params { k1, b } = self.params;
        let n = data.ids.len() as f32;
        let avg_doc_len = if data.avg_doc_len > 0.0 {
            data.avg_doc_len
        } else {
            1.0
        };

        let mut scores: HashMap<u32, f32> = HashMap::new();
        for term in &terms {
            let Some(list) = data.postings.get(term) else {
                continue;
            };
            let df = list.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            for posting in list {
                let tf = posting.term_frequency as f32;
                let dl = data.doc_lengths[posting.doc as usize] as f32;
                let norm = k1 * (1.0 - b + b * dl / avg_doc_len);
                *scores.entry(posting.doc).or_default() +=
                    idf * (tf * (k1 + 1.0)) / (tf + norm);
            }
        }

        let scored = scores
            .into_iter()
            .map(|(doc, score)| (score, &data.ids[doc as usize]))
            .collect();
        let ranked = top_k(scored, k);
        debug!(
            terms = terms.len(),
            k,
            returned = ranked.len(),
            "sparse query"
        );
        Ok(ranked)
    }

    fn data(&self) -> Result<&SparseData> {
        self.built.as_ref().ok_or(Error::NotReady {
            component: "sparse index",
        })
    }
}

fn average(lengths: &[u32]) -> f32 {
    if lengths.is_empty() {
        return 0.0;
    }
    let total: u64 = lengths.iter().map(|&l| u64::from(l)).sum();
    (total as f64 / lengths.len() as f64) as f32
}
