use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Serialize, Serializer};
use tracing::{debug, debug_span, error};

use crate::{
    candidate::RankedCandidate,
    config::RetrievalConfig,
    embedding::Embedder,
    error::{Error, Result},
    fusion::{FusedResult, fuse},
    index::{IndexHandle, RetrievalIndex},
    registry::ChunkId,
};

/// A fused result enriched with the chunk it refers to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedPassage {
    pub chunk_id: ChunkId,
    pub title: String,
    pub source_id: String,
    pub text: String,
    pub position_in_source: usize,
    pub rrf_score: f64,
    pub dense_rank: Option<usize>,
    pub sparse_rank: Option<usize>,
    pub dense_score: Option<f32>,
    pub sparse_score: Option<f32>,
}

/// Wall-clock time spent in each query stage.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageTimings {
    #[serde(serialize_with = "as_millis")]
    pub embed: Duration,
    #[serde(serialize_with = "as_millis")]
    pub dense: Duration,
    #[serde(serialize_with = "as_millis")]
    pub sparse: Duration,
    #[serde(serialize_with = "as_millis")]
    pub fuse: Duration,
    #[serde(serialize_with = "as_millis")]
    pub total: Duration,
}

fn as_millis<S: Serializer>(
    d: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// Everything a query produced: both source lists, the fused passages and
/// how long each stage took.
#[derive(Debug, Clone, Serialize)]
pub struct QueryTrace {
    pub query: String,
    pub dense: Vec<RankedCandidate>,
    pub sparse: Vec<RankedCandidate>,
    pub passages: Vec<RetrievedPassage>,
    pub timings: StageTimings,
}

/// Runs queries against whatever index the handle currently publishes.
pub struct QueryPipeline {
    handle: Arc<IndexHandle>,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl QueryPipeline {
    pub fn new(
        handle: Arc<IndexHandle>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            handle,
            embedder,
            config,
        })
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn handle(&self) -> &Arc<IndexHandle> {
        &self.handle
    }

    /// The top `final_top_n` passages for `query`.
    pub fn execute(&self, query: &str) -> Result<Vec<RetrievedPassage>> {
        Ok(self.execute_detailed(query)?.passages)
    }

    /// Like [`execute`](Self::execute), also returning the dense and sparse
    /// candidate lists and per-stage timings.
    pub fn execute_detailed(&self, query: &str) -> Result<QueryTrace> {
        let started = Instant::now();
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::EmptyQuery);
        }
        let _span = debug_span!("query", query).entered();

        let index = self.handle.snapshot()?;
        self.check_embedder(&index)?;

        let t = Instant::now();
        let vector = self.embedder.embed_query(query)?;
        let embed = t.elapsed();
        debug!(dimension = vector.len(), ?embed, "query embedded");

        let RetrievalConfig {
            dense_top_k,
            sparse_top_k,
            rrf_k,
            final_top_n,
            ..
        } = self.config;

        let (dense, sparse) = rayon::join(
            || timed(|| index.dense().query(&vector, dense_top_k)),
            || timed(|| index.sparse().query(query, sparse_top_k)),
        );
        let (dense, dense_time) = (dense.0?, dense.1);
        let (sparse, sparse_time) = (sparse.0?, sparse.1);
        debug!(
            dense = dense.len(),
            sparse = sparse.len(),
            ?dense_time,
            ?sparse_time,
            "candidates retrieved"
        );

        let t = Instant::now();
        let fused = fuse(&dense, &sparse, rrf_k, final_top_n)?;
        let passages = resolve(&index, fused)?;
        let fuse_time = t.elapsed();

        let timings = StageTimings {
            embed,
            dense: dense_time,
            sparse: sparse_time,
            fuse: fuse_time,
            total: started.elapsed(),
        };
        debug!(passages = passages.len(), total = ?timings.total, "query done");

        Ok(QueryTrace {
            query: query.to_string(),
            dense,
            sparse,
            passages,
            timings,
        })
    }

    fn check_embedder(&self, index: &RetrievalIndex) -> Result<()> {
        let Some(built_with) = index.embedder() else {
            return Ok(());
        };
        let querying_with = self.embedder.descriptor();
        if *built_with != querying_with {
            return Err(Error::invalid(
                "embedder",
                format!(
                    "index was built with {built_with} but queries use {querying_with}"
                ),
            ));
        }
        Ok(())
    }
}

fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let t = Instant::now();
    let out = f();
    (out, t.elapsed())
}

fn resolve(
    index: &RetrievalIndex,
    fused: Vec<FusedResult>,
) -> Result<Vec<RetrievedPassage>> {
    fused
        .into_iter()
        .map(|f| {
            let chunk = index.registry().get(&f.chunk_id).inspect_err(|e| {
                error!(
                    chunk_id = %f.chunk_id,
                    error = %e,
                    "fused id missing from registry"
                );
            })?;
            Ok(RetrievedPassage {
                title: chunk.title.clone(),
                source_id: chunk.source_id.clone(),
                text: chunk.text.clone(),
                position_in_source: chunk.position_in_source,
                chunk_id: f.chunk_id,
                rrf_score: f.rrf_score,
                dense_rank: f.dense_rank,
                sparse_rank: f.sparse_rank,
                dense_score: f.dense_score,
                sparse_score: f.sparse_score,
            })
        })
        .collect()
}
