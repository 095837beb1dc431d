use std::{
    fmt,
    str::FromStr,
    sync::{Mutex, PoisonError},
};

use candle_core::Tensor;
use kdam::{BarExt, tqdm};
use tracing::{debug, info};

use crate::{
    dense::EmbeddingRecord,
    error::{Error, Result},
    model_manager::ModelManager,
    registry::Chunk,
    tokenizer::{Tokenizer, TokenizerPolicy},
};

/// Dimension of the default hashing embedder.
pub const DEFAULT_HASHING_DIMENSION: usize = 384;

/// Which embedder produced (or should produce) dense vectors.
///
/// Written as `hashing:<dimension>` or `colbert:<model-id>`. The descriptor
/// is stored with the dense index so queries use the same model as the
/// build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedderDescriptor {
    Hashing { dimension: usize },
    Colbert { model_id: String },
}

impl Default for EmbedderDescriptor {
    fn default() -> Self {
        EmbedderDescriptor::Hashing {
            dimension: DEFAULT_HASHING_DIMENSION,
        }
    }
}

impl fmt::Display for EmbedderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbedderDescriptor::Hashing { dimension } => {
                write!(f, "hashing:{dimension}")
            }
            EmbedderDescriptor::Colbert { model_id } => {
                write!(f, "colbert:{model_id}")
            }
        }
    }
}

impl FromStr for EmbedderDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, arg) = s.split_once(':').unwrap_or((s, ""));
        match kind {
            "hashing" => {
                let dimension = if arg.is_empty() {
                    DEFAULT_HASHING_DIMENSION
                } else {
                    arg.parse().map_err(|_| {
                        Error::invalid(
                            "embedder",
                            format!("'{arg}' is not a dimension"),
                        )
                    })?
                };
                if dimension == 0 {
                    return Err(Error::invalid(
                        "embedder",
                        "hashing dimension must be at least 1",
                    ));
                }
                Ok(EmbedderDescriptor::Hashing { dimension })
            }
            "colbert" => {
                let model_id = if arg.is_empty() {
                    crate::model_manager::DEFAULT_MODEL_ID
                } else {
                    arg
                };
                Ok(EmbedderDescriptor::Colbert {
                    model_id: model_id.to_string(),
                })
            }
            other => Err(Error::invalid(
                "embedder",
                format!(
                    "unknown embedder '{other}' (expected hashing:<dim> or colbert:<model>)"
                ),
            )),
        }
    }
}

/// Turns text into one dense vector.
///
/// Query and document encodings are separate because late-interaction
/// models encode the two sides differently.
pub trait Embedder: Send + Sync {
    fn descriptor(&self) -> EmbedderDescriptor;

    fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_document(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed_document(t)).collect()
    }
}

/// Build the embedder a descriptor names.
pub fn build_embedder(
    descriptor: &EmbedderDescriptor,
) -> Result<Box<dyn Embedder>> {
    Ok(match descriptor {
        EmbedderDescriptor::Hashing { dimension } => {
            Box::new(HashingEmbedder::new(*dimension)?)
        }
        EmbedderDescriptor::Colbert { model_id } => Box::new(
            ColbertEmbedder::new(ModelManager::with_model_id(model_id.clone())),
        ),
    })
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Feature-hashing embedder: every token adds ±1 to one bucket.
///
/// Needs no model files and is fully deterministic, so two runs over the
/// same text always produce the same vector. It captures lexical overlap
/// only.
#[derive(Debug)]
pub struct HashingEmbedder {
    dimension: usize,
    tokenizer: Tokenizer,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::invalid(
                "embedder",
                "hashing dimension must be at least 1",
            ));
        }
        Ok(Self {
            dimension,
            tokenizer: Tokenizer::new(TokenizerPolicy::Simple),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in self.tokenizer.tokenize(text) {
            let hash = fnv1a(token.as_bytes());
            let bucket = (hash % self.dimension as u64) as usize;
            // The top bit picks the sign so collisions tend to cancel.
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_HASHING_DIMENSION,
            tokenizer: Tokenizer::new(TokenizerPolicy::Simple),
        }
    }
}

impl Embedder for HashingEmbedder {
    fn descriptor(&self) -> EmbedderDescriptor {
        EmbedderDescriptor::Hashing {
            dimension: self.dimension,
        }
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed(text))
    }

    fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed(text))
    }
}

/// ColBERT token embeddings mean-pooled into one unit vector per text.
///
/// The model is loaded lazily on first use. Texts are encoded one at a
/// time so padding tokens never enter the pooled vector.
pub struct ColbertEmbedder {
    model: Mutex<ModelManager>,
}

impl ColbertEmbedder {
    pub fn new(model: ModelManager) -> Self {
        Self {
            model: Mutex::new(model),
        }
    }

    fn encode(&self, text: &str, is_query: bool) -> Result<Vec<f32>> {
        let mut model =
            self.model.lock().unwrap_or_else(PoisonError::into_inner);
        let tokens = if is_query {
            model.encode_query(text)?
        } else {
            model.encode_document(text)?
        };
        mean_pool(&tokens)
    }
}

impl fmt::Debug for ColbertEmbedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColbertEmbedder").finish_non_exhaustive()
    }
}

impl Embedder for ColbertEmbedder {
    fn descriptor(&self) -> EmbedderDescriptor {
        let model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        EmbedderDescriptor::Colbert {
            model_id: model.model_id().to_string(),
        }
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.encode(text, true)
    }

    fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        self.encode(text, false)
    }
}

/// Average a `[tokens, dimension]` tensor over its tokens.
fn mean_pool(tokens: &Tensor) -> Result<Vec<f32>> {
    let pooled = tokens
        .mean(0)
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|e| {
            Error::Embedding(format!("failed to pool token embeddings: {e}"))
        })?;
    Ok(pooled)
}

/// Embed every chunk's text, `batch_size` chunks at a time, with a progress
/// bar on stderr.
pub fn embed_chunks(
    embedder: &dyn Embedder,
    chunks: &[Chunk],
    batch_size: usize,
    show_progress: bool,
) -> Result<Vec<EmbeddingRecord>> {
    let batch_size = batch_size.max(1);
    info!(
        chunks = chunks.len(),
        batch_size,
        embedder = %embedder.descriptor(),
        "embedding chunks"
    );

    let mut pb = tqdm!(
        total = chunks.len(),
        desc = "Embedding",
        unit = " chunks",
        disable = !show_progress
    );

    let mut records = Vec::with_capacity(chunks.len());
    for batch in chunks.chunks(batch_size) {
        let texts: Vec<&str> = batch.iter().map(|c| c.text.as_str()).collect();
        let vectors = embedder.embed_documents(&texts)?;
        if vectors.len() != batch.len() {
            return Err(Error::Embedding(format!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            )));
        }
        records.extend(batch.iter().zip(vectors).map(|(chunk, vector)| {
            EmbeddingRecord {
                chunk_id: chunk.id.clone(),
                vector,
            }
        }));
        pb.update(batch.len())?;
        debug!(done = records.len(), "embedded batch");
    }
    if show_progress {
        eprintln!();
    }

    Ok(records)
}
