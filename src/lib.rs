//! hybrag - hybrid passage retrieval for retrieval-augmented generation.
//!
//! A fixed corpus of text chunks is indexed twice: once as dense embeddings
//! searched by cosine similarity, once as an inverted index scored with
//! BM25. A query runs against both and the two ranked lists are merged with
//! Reciprocal Rank Fusion into one ordered list of passages, ready to be
//! formatted as context for an answer generator.
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//!
//! use hybrag::{
//!     Chunk, Embedder, HashingEmbedder, IndexHandle, QueryPipeline,
//!     RetrievalConfig, RetrievalIndex, TokenizerPolicy,
//!     dense::EmbeddingRecord, sparse::Bm25Params,
//! };
//!
//! let chunks = vec![
//!     Chunk::new("c1", "doc", "Ownership", "each value has one owner", 0)?,
//!     Chunk::new("c2", "doc", "Borrowing", "references borrow values", 1)?,
//! ];
//! let embedder = HashingEmbedder::new(64)?;
//! let records = chunks
//!     .iter()
//!     .map(|c| {
//!         Ok(EmbeddingRecord {
//!             chunk_id: c.id.clone(),
//!             vector: embedder.embed_document(&c.text)?,
//!         })
//!     })
//!     .collect::<hybrag::Result<Vec<_>>>()?;
//!
//! let index = RetrievalIndex::build(
//!     chunks,
//!     records,
//!     TokenizerPolicy::Simple,
//!     Bm25Params::default(),
//! )?;
//! let pipeline = QueryPipeline::new(
//!     Arc::new(IndexHandle::with_index(index)),
//!     Arc::new(embedder),
//!     RetrievalConfig::default(),
//! )?;
//!
//! let passages = pipeline.execute("who owns a value?")?;
//! assert_eq!(passages[0].chunk_id.as_str(), "c1");
//! # Ok::<(), hybrag::Error>(())
//! ```

pub mod candidate;
pub mod cli;
pub mod config;
pub mod config_db;
pub mod data_dir;
pub mod dense;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod generation;
pub mod index;
pub mod model_manager;
pub mod pipeline;
pub mod registry;
pub mod search;
pub mod sparse;
pub mod store;
pub mod tokenizer;

pub use candidate::RankedCandidate;
pub use config::{RetrievalConfig, Settings};
pub use config_db::ConfigDb;
pub use data_dir::DataDir;
pub use dense::DenseIndex;
pub use embedding::{
    ColbertEmbedder,
    Embedder,
    EmbedderDescriptor,
    HashingEmbedder,
};
pub use error::{Error, FailureClass, Result};
pub use fusion::{FusedResult, RRF_K, fuse};
pub use generation::{Answer, Generator, answer, build_prompt, format_context};
pub use index::{IndexHandle, IndexState, RetrievalIndex};
pub use model_manager::ModelManager;
pub use pipeline::{QueryPipeline, QueryTrace, RetrievedPassage};
pub use registry::{Chunk, ChunkId, ChunkRegistry};
pub use sparse::SparseIndex;
pub use tokenizer::{Tokenizer, TokenizerPolicy};
