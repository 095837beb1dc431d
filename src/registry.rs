use std::{
    collections::BTreeMap,
    fmt,
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A stable, opaque chunk identifier.
///
/// Identifiers order lexicographically; every tie in the ranking code is
/// broken by this order.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChunkId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A slice of a source document: the unit of retrieval.
///
/// Field aliases accept the records written by the ingestion stage
/// (`chunk_id`, `url`, `position`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(alias = "chunk_id")]
    pub id: ChunkId,
    #[serde(alias = "url", default)]
    pub source_id: String,
    #[serde(default)]
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub token_count: usize,
    #[serde(alias = "position", default)]
    pub position_in_source: usize,
}

impl Chunk {
    /// Create a chunk, rejecting an empty identifier.
    pub fn new(
        id: impl Into<String>,
        source_id: impl Into<String>,
        title: impl Into<String>,
        text: impl Into<String>,
        position_in_source: usize,
    ) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::invalid("chunk_id", "must not be empty"));
        }
        let text = text.into();
        let token_count = text.split_whitespace().count();
        Ok(Self {
            id: ChunkId(id),
            source_id: source_id.into(),
            title: title.into(),
            text,
            token_count,
            position_in_source,
        })
    }
}

/// Immutable mapping from chunk id to chunk metadata.
#[derive(Debug, Clone, Default)]
pub struct ChunkRegistry {
    chunks: BTreeMap<ChunkId, Chunk>,
}

impl ChunkRegistry {
    /// Build the registry, failing on the first repeated id.
    pub fn build(chunks: impl IntoIterator<Item = Chunk>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for chunk in chunks {
            if map.contains_key(&chunk.id) {
                return Err(Error::DuplicateChunk(chunk.id));
            }
            map.insert(chunk.id.clone(), chunk);
        }
        Ok(Self { chunks: map })
    }

    pub fn get(&self, id: &ChunkId) -> Result<&Chunk> {
        self.chunks.get(id).ok_or_else(|| Error::NotFound {
            kind: "chunk",
            name: id.to_string(),
        })
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.chunks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunk ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = &ChunkId> {
        self.chunks.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }
}

/// Load a chunk universe from a JSON array or a JSON Lines file.
///
/// Chunks without a `token_count` get a whitespace word count.
pub fn load_chunks(path: &Path) -> Result<Vec<Chunk>> {
    let contents = std::fs::read_to_string(path)?;
    let mut chunks: Vec<Chunk> = if contents.trim_start().starts_with('[') {
        serde_json::from_str(&contents)?
    } else {
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?
    };

    for chunk in &mut chunks {
        if chunk.id.as_str().trim().is_empty() {
            return Err(Error::invalid("chunk_id", "must not be empty"));
        }
        if chunk.token_count == 0 {
            chunk.token_count = chunk.text.split_whitespace().count();
        }
    }

    Ok(chunks)
}
