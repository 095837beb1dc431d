use std::{
    collections::BTreeSet,
    sync::{Arc, PoisonError, RwLock},
};

use tracing::{info, warn};

use crate::{
    dense::{DenseIndex, EmbeddingRecord},
    embedding::EmbedderDescriptor,
    error::{Error, Result},
    registry::{Chunk, ChunkId, ChunkRegistry},
    sparse::{Bm25Params, SparseIndex},
    tokenizer::TokenizerPolicy,
};

/// How many offending ids an integrity error lists.
const MAX_REPORTED_IDS: usize = 5;

/// Chunk registry plus both indices, built from one chunk universe and
/// checked to cover exactly the same chunk ids.
///
/// A `RetrievalIndex` is immutable once constructed and can be queried from
/// any number of threads.
#[derive(Debug)]
pub struct RetrievalIndex {
    registry: ChunkRegistry,
    dense: DenseIndex,
    sparse: SparseIndex,
    embedder: Option<EmbedderDescriptor>,
}

impl RetrievalIndex {
    /// Build the registry and both indices. Any failure aborts the whole
    /// build.
    pub fn build(
        chunks: Vec<Chunk>,
        records: Vec<EmbeddingRecord>,
        policy: TokenizerPolicy,
        params: Bm25Params,
    ) -> Result<Self> {
        info!(
            chunks = chunks.len(),
            embeddings = records.len(),
            tokenizer = %policy,
            "building retrieval index"
        );
        let registry = ChunkRegistry::build(chunks)?;

        let mut sparse = SparseIndex::new(policy, params);
        sparse.build(registry.iter())?;

        let mut dense = DenseIndex::default();
        dense.build(records)?;

        Self::from_parts(registry, dense, sparse)
    }

    /// Assemble a bundle from already-built parts, verifying that the
    /// registry, the dense index and the sparse index share one chunk-id
    /// universe.
    pub fn from_parts(
        registry: ChunkRegistry,
        dense: DenseIndex,
        sparse: SparseIndex,
    ) -> Result<Self> {
        let dense_ids: BTreeSet<&ChunkId> = dense.chunk_ids()?.iter().collect();
        let sparse_ids: BTreeSet<&ChunkId> = sparse.chunk_ids()?.iter().collect();
        let registry_ids: BTreeSet<&ChunkId> = registry.ids().collect();

        check_same("dense", &dense_ids, "sparse", &sparse_ids)?;
        check_same("sparse", &sparse_ids, "registry", &registry_ids)?;

        Ok(Self {
            registry,
            dense,
            sparse,
            embedder: None,
        })
    }

    /// Record which embedder produced the dense vectors.
    pub fn with_embedder(mut self, embedder: EmbedderDescriptor) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn registry(&self) -> &ChunkRegistry {
        &self.registry
    }

    pub fn dense(&self) -> &DenseIndex {
        &self.dense
    }

    pub fn sparse(&self) -> &SparseIndex {
        &self.sparse
    }

    pub fn embedder(&self) -> Option<&EmbedderDescriptor> {
        self.embedder.as_ref()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Swap the BM25 tunables used at query time.
    pub fn set_bm25_params(&mut self, params: Bm25Params) -> Result<()> {
        self.sparse.set_params(params)
    }
}

fn check_same(
    left_name: &str,
    left: &BTreeSet<&ChunkId>,
    right_name: &str,
    right: &BTreeSet<&ChunkId>,
) -> Result<()> {
    if left == right {
        return Ok(());
    }
    let only_left: Vec<String> = left
        .difference(right)
        .take(MAX_REPORTED_IDS)
        .map(ToString::to_string)
        .collect();
    let only_right: Vec<String> = right
        .difference(left)
        .take(MAX_REPORTED_IDS)
        .map(ToString::to_string)
        .collect();
    Err(Error::IntegrityMismatch(format!(
        "{left_name} has {} chunks, {right_name} has {}; \
         only in {left_name}: [{}]; only in {right_name}: [{}]",
        left.len(),
        right.len(),
        only_left.join(", "),
        only_right.join(", "),
    )))
}

/// Lifecycle of the index served by an [`IndexHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Unbuilt,
    Building,
    Ready,
    /// The first build failed; nothing is being served.
    Failed,
}

/// The published index, replaced atomically on rebuild.
///
/// Readers take an `Arc` snapshot and never hold the lock while querying,
/// so an in-flight query keeps the bundle it started with even if a new
/// one is published meanwhile.
#[derive(Debug)]
pub struct IndexHandle {
    slot: RwLock<Slot>,
}

#[derive(Debug)]
struct Slot {
    state: IndexState,
    current: Option<Arc<RetrievalIndex>>,
}

impl Default for IndexHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexHandle {
    /// A handle with nothing published yet.
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(Slot {
                state: IndexState::Unbuilt,
                current: None,
            }),
        }
    }

    /// A handle already serving `index`.
    pub fn with_index(index: RetrievalIndex) -> Self {
        Self {
            slot: RwLock::new(Slot {
                state: IndexState::Ready,
                current: Some(Arc::new(index)),
            }),
        }
    }

    pub fn state(&self) -> IndexState {
        self.slot.read().unwrap_or_else(PoisonError::into_inner).state
    }

    /// The currently published bundle.
    pub fn snapshot(&self) -> Result<Arc<RetrievalIndex>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
            .ok_or(Error::NotReady {
                component: "retrieval index",
            })
    }

    /// Publish `index`, returning the bundle it replaces.
    pub fn publish(&self, index: RetrievalIndex) -> Option<Arc<RetrievalIndex>> {
        let next = Arc::new(index);
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        slot.state = IndexState::Ready;
        info!(chunks = next.len(), "retrieval index published");
        slot.current.replace(next)
    }

    /// Run `build` and publish its result.
    ///
    /// The previous bundle keeps serving while `build` runs. If `build`
    /// fails the previous bundle stays published; with no previous bundle
    /// the handle moves to [`IndexState::Failed`].
    pub fn rebuild(
        &self,
        build: impl FnOnce() -> Result<RetrievalIndex>,
    ) -> Result<()> {
        self.set_state(IndexState::Building);

        match build() {
            Ok(index) => {
                self.publish(index);
                Ok(())
            }
            Err(err) => {
                let mut slot =
                    self.slot.write().unwrap_or_else(PoisonError::into_inner);
                if slot.current.is_some() {
                    warn!(error = %err, "rebuild failed, keeping previous index");
                    slot.state = IndexState::Ready;
                } else {
                    warn!(error = %err, "index build failed");
                    slot.state = IndexState::Failed;
                }
                Err(err)
            }
        }
    }

    fn set_state(&self, state: IndexState) {
        self.slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .state = state;
    }
}
