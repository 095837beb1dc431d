use std::path::PathBuf;

use crate::registry::ChunkId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{component} is not ready: build or load an index first")]
    NotReady { component: &'static str },

    #[error(
        "dimension mismatch for {chunk_id}: expected {expected}, found {found}"
    )]
    DimensionMismatch {
        chunk_id: String,
        expected: usize,
        found: usize,
    },

    #[error("duplicate chunk id: {0}")]
    DuplicateChunk(ChunkId),

    #[error("index integrity violation: {0}")]
    IntegrityMismatch(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidConfig { key: &'static str, reason: String },

    #[error("query is empty")]
    EmptyQuery,

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("generation error: {0}")]
    Generation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

/// Coarse classification the calling layer uses to pick messaging and
/// retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The request itself was malformed.
    Caller,
    /// No index is available to serve the request.
    Unavailable,
    /// Corpus or index data is inconsistent.
    Integrity,
    /// I/O, storage and model failures.
    System,
}

impl Error {
    pub fn class(&self) -> FailureClass {
        match self {
            Error::EmptyQuery | Error::InvalidConfig { .. } => {
                FailureClass::Caller
            }
            Error::NotReady { .. } => FailureClass::Unavailable,
            Error::DimensionMismatch { .. }
            | Error::DuplicateChunk(_)
            | Error::IntegrityMismatch(_)
            | Error::NotFound { .. } => FailureClass::Integrity,
            _ => FailureClass::System,
        }
    }

    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            key,
            reason: reason.into(),
        }
    }
}
