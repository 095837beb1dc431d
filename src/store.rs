//! On-disk index generations.
//!
//! Each save writes a complete `gen-<n>` directory holding `dense.redb` and
//! `sparse.redb`, then publishes it by atomically replacing the `CURRENT`
//! pointer file. Readers only ever follow `CURRENT`, so they see either the
//! previous generation or the new one, never a partial write. The generation
//! just replaced is kept on disk until the next save, and a load that loses
//! its generation to a concurrent prune follows `CURRENT` again.
//!
//! Vectors and postings are stored as raw little-endian `bytemuck` casts.

use std::{
    collections::HashMap,
    fs,
    io::Write,
    mem::size_of,
    path::{Path, PathBuf},
};

use redb::{
    Database,
    ReadOnlyDatabase,
    ReadableDatabase,
    ReadableTable,
    TableDefinition,
};
use tracing::{debug, info, warn};

use crate::{
    dense::{DenseIndex, EmbeddingRecord},
    embedding::EmbedderDescriptor,
    error::{Error, Result},
    index::RetrievalIndex,
    registry::{Chunk, ChunkId, ChunkRegistry},
    sparse::{Bm25Params, Posting, SparseIndex},
    tokenizer::TokenizerPolicy,
};

const FORMAT_VERSION: &str = "1";
const CURRENT: &str = "CURRENT";
const CURRENT_TMP: &str = "CURRENT.tmp";
const GENERATION_PREFIX: &str = "gen-";
const DENSE_FILE: &str = "dense.redb";
const SPARSE_FILE: &str = "sparse.redb";

const META: TableDefinition<&str, &str> = TableDefinition::new("meta");

// dense.redb
const ROWS: TableDefinition<u64, &str> = TableDefinition::new("rows");
const VECTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("vectors");

// sparse.redb
const CHUNKS: TableDefinition<&str, &[u8]> = TableDefinition::new("chunks");
const ORDINALS: TableDefinition<u64, &str> = TableDefinition::new("ordinals");
const DOC_LENGTHS: TableDefinition<u64, u32> =
    TableDefinition::new("doc_lengths");
const POSTINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("postings");

/// Write `index` as a new generation under `index_dir` and publish it.
///
/// Returns the new generation number. Once the new one is published, every
/// generation older than its predecessor is removed.
pub fn save(index: &RetrievalIndex, index_dir: &Path) -> Result<u64> {
    fs::create_dir_all(index_dir)?;
    let generation = next_generation(index_dir)?;
    let name = generation_name(generation);
    let dir = index_dir.join(&name);
    fs::create_dir_all(&dir)?;

    let written = write_dense(index, &dir.join(DENSE_FILE))
        .and_then(|()| write_sparse(index, &dir.join(SPARSE_FILE)));
    if let Err(err) = written {
        warn!(generation, error = %err, "index write failed, discarding");
        discard(&dir, generation);
        return Err(err);
    }

    publish(index_dir, &name)?;
    info!(generation, chunks = index.len(), "index generation published");
    prune(index_dir, generation);
    Ok(generation)
}

/// Load the published generation and validate it.
///
/// `params` are the BM25 tunables to query with; they are not part of the
/// persisted index.
pub fn load(index_dir: &Path, params: Bm25Params) -> Result<RetrievalIndex> {
    let mut generation =
        current_generation(index_dir)?.ok_or(Error::NotReady {
            component: "persisted index",
        })?;
    loop {
        let err = match load_generation(index_dir, generation, params) {
            Ok(index) => return Ok(index),
            Err(err) => err,
        };
        // A save may have published and pruned while we were reading.
        match current_generation(index_dir)? {
            Some(next) if next != generation => {
                debug!(
                    from = generation,
                    to = next,
                    error = %err,
                    "generation replaced during load, following CURRENT"
                );
                generation = next;
            }
            _ => return Err(err),
        }
    }
}

fn load_generation(
    index_dir: &Path,
    generation: u64,
    params: Bm25Params,
) -> Result<RetrievalIndex> {
    let dir = index_dir.join(generation_name(generation));
    debug!(generation, dir = %dir.display(), "loading index generation");

    let dense_db = open_artifact(&dir.join(DENSE_FILE))?;
    let sparse_db = open_artifact(&dir.join(SPARSE_FILE))?;
    let (dense, embedder) = read_dense(&dense_db)?;
    let (registry, sparse) = read_sparse(&sparse_db, params)?;

    let mut index = RetrievalIndex::from_parts(registry, dense, sparse)?;
    if let Some(embedder) = embedder {
        index = index.with_embedder(embedder);
    }
    info!(generation, chunks = index.len(), "index loaded");
    Ok(index)
}

/// The generation `CURRENT` points at, if any.
pub fn current_generation(index_dir: &Path) -> Result<Option<u64>> {
    let pointer = index_dir.join(CURRENT);
    let contents = match fs::read_to_string(&pointer) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    parse_generation(contents.trim()).map(Some).ok_or_else(|| {
        Error::IntegrityMismatch(format!(
            "{} does not name a generation: '{}'",
            pointer.display(),
            contents.trim()
        ))
    })
}

fn generation_name(generation: u64) -> String {
    format!("{GENERATION_PREFIX}{generation}")
}

fn parse_generation(name: &str) -> Option<u64> {
    name.strip_prefix(GENERATION_PREFIX)?.parse().ok()
}

/// Generation directories present under `index_dir`.
fn generations(index_dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(index_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(n) = entry.file_name().to_str().and_then(parse_generation)
        {
            found.push((n, entry.path()));
        }
    }
    found.sort_by_key(|(n, _)| *n);
    Ok(found)
}

fn next_generation(index_dir: &Path) -> Result<u64> {
    let newest_dir = generations(index_dir)?.last().map(|(n, _)| *n);
    let newest = newest_dir.max(current_generation(index_dir)?);
    Ok(newest.map_or(1, |n| n + 1))
}

fn publish(index_dir: &Path, name: &str) -> Result<()> {
    let tmp = index_dir.join(CURRENT_TMP);
    {
        let mut file = fs::File::create(&tmp)?;
        writeln!(file, "{name}")?;
        file.sync_all()?;
    }
    fs::rename(&tmp, index_dir.join(CURRENT))?;
    Ok(())
}

/// Remove an unpublished generation. Failure only leaves clutter that the
/// next prune picks up.
fn discard(dir: &Path, generation: u64) -> bool {
    match fs::remove_dir_all(dir) {
        Ok(()) => true,
        Err(e) => {
            warn!(
                generation,
                dir = %dir.display(),
                error = %e,
                "could not remove failed generation"
            );
            false
        }
    }
}

fn prune(index_dir: &Path, keep: u64) {
    let old = match generations(index_dir) {
        Ok(found) => found,
        Err(e) => {
            warn!(error = %e, "could not list old index generations");
            return;
        }
    };
    let predecessor = keep.saturating_sub(1);
    for (n, path) in old.into_iter().filter(|(n, _)| *n < predecessor) {
        match fs::remove_dir_all(&path) {
            Ok(()) => debug!(generation = n, "pruned old generation"),
            Err(e) => warn!(generation = n, error = %e, "prune failed"),
        }
    }
}

fn write_dense(index: &RetrievalIndex, path: &Path) -> Result<()> {
    let dense = index.dense();
    let dimension = dense.dimension()?;
    let records = dense.records()?;

    let db = Database::create(path)?;
    let txn = db.begin_write()?;
    {
        let mut meta = txn.open_table(META)?;
        meta.insert("format_version", FORMAT_VERSION)?;
        meta.insert("dimension", dimension.to_string().as_str())?;
        if let Some(embedder) = index.embedder() {
            meta.insert("embedder", embedder.to_string().as_str())?;
        }

        let mut rows = txn.open_table(ROWS)?;
        let mut vectors = txn.open_table(VECTORS)?;
        for (row, record) in records.iter().enumerate() {
            rows.insert(row as u64, record.chunk_id.as_str())?;
            vectors.insert(
                row as u64,
                bytemuck::cast_slice::<f32, u8>(&record.vector),
            )?;
        }
    }
    txn.commit()?;
    debug!(rows = records.len(), dimension, "dense artifact written");
    Ok(())
}

fn write_sparse(index: &RetrievalIndex, path: &Path) -> Result<()> {
    let sparse = index.sparse();

    let db = Database::create(path)?;
    let txn = db.begin_write()?;
    {
        let mut meta = txn.open_table(META)?;
        meta.insert("format_version", FORMAT_VERSION)?;
        meta.insert("tokenizer", sparse.tokenizer().policy().as_str())?;

        let mut chunks = txn.open_table(CHUNKS)?;
        for chunk in index.registry().iter() {
            let json = serde_json::to_vec(chunk)?;
            chunks.insert(chunk.id.as_str(), json.as_slice())?;
        }

        let mut ordinals = txn.open_table(ORDINALS)?;
        let mut lengths = txn.open_table(DOC_LENGTHS)?;
        for (ordinal, (id, len)) in sparse
            .chunk_ids()?
            .iter()
            .zip(sparse.doc_lengths()?)
            .enumerate()
        {
            ordinals.insert(ordinal as u64, id.as_str())?;
            lengths.insert(ordinal as u64, *len)?;
        }

        let mut postings = txn.open_table(POSTINGS)?;
        for (term, list) in sparse.postings()? {
            postings.insert(
                term.as_str(),
                bytemuck::cast_slice::<Posting, u8>(list),
            )?;
        }
    }
    txn.commit()?;
    debug!(chunks = index.len(), "sparse artifact written");
    Ok(())
}

fn open_artifact(path: &Path) -> Result<ReadOnlyDatabase> {
    if !path.is_file() {
        return Err(Error::IntegrityMismatch(format!(
            "index artifact missing: {}",
            path.display()
        )));
    }
    Ok(ReadOnlyDatabase::open(path)?)
}

fn read_meta(db: &ReadOnlyDatabase) -> Result<HashMap<String, String>> {
    let txn = db.begin_read()?;
    let table = txn.open_table(META)?;
    let mut meta = HashMap::new();
    for entry in table.iter()? {
        let (k, v) = entry?;
        meta.insert(k.value().to_string(), v.value().to_string());
    }

    match meta.get("format_version").map(String::as_str) {
        Some(FORMAT_VERSION) => Ok(meta),
        other => Err(Error::IntegrityMismatch(format!(
            "unsupported index format version {other:?}"
        ))),
    }
}

fn read_dense(
    db: &ReadOnlyDatabase,
) -> Result<(DenseIndex, Option<EmbedderDescriptor>)> {
    let meta = read_meta(db)?;
    let dimension: usize = meta
        .get("dimension")
        .and_then(|d| d.parse().ok())
        .ok_or_else(|| {
            Error::IntegrityMismatch("dense artifact has no dimension".into())
        })?;
    let embedder = meta
        .get("embedder")
        .map(|s| s.parse::<EmbedderDescriptor>())
        .transpose()?;

    let txn = db.begin_read()?;
    let rows = txn.open_table(ROWS)?;
    let vectors = txn.open_table(VECTORS)?;

    let mut records = Vec::new();
    for entry in rows.iter()? {
        let (row, id) = entry?;
        let row = row.value();
        let bytes = vectors.get(row)?.ok_or_else(|| {
            Error::IntegrityMismatch(format!("dense row {row} has no vector"))
        })?;
        let vector = decode_f32s(bytes.value());
        if vector.len() != dimension {
            return Err(Error::DimensionMismatch {
                chunk_id: id.value().to_string(),
                expected: dimension,
                found: vector.len(),
            });
        }
        records.push(EmbeddingRecord {
            chunk_id: ChunkId::new(id.value()),
            vector,
        });
    }

    let mut dense = DenseIndex::default();
    dense.build(records)?;
    Ok((dense, embedder))
}

fn read_sparse(
    db: &ReadOnlyDatabase,
    params: Bm25Params,
) -> Result<(ChunkRegistry, SparseIndex)> {
    let meta = read_meta(db)?;
    let policy: TokenizerPolicy = meta
        .get("tokenizer")
        .ok_or_else(|| {
            Error::IntegrityMismatch("sparse artifact has no tokenizer".into())
        })?
        .parse()?;

    let txn = db.begin_read()?;

    let mut chunks = Vec::new();
    for entry in txn.open_table(CHUNKS)?.iter()? {
        let (_, json) = entry?;
        chunks.push(serde_json::from_slice::<Chunk>(json.value())?);
    }
    let registry = ChunkRegistry::build(chunks)?;

    let ordinals = txn.open_table(ORDINALS)?;
    let lengths = txn.open_table(DOC_LENGTHS)?;
    let mut ids = Vec::new();
    let mut doc_lengths = Vec::new();
    for entry in ordinals.iter()? {
        let (ordinal, id) = entry?;
        let ordinal = ordinal.value();
        if ordinal != ids.len() as u64 {
            return Err(Error::IntegrityMismatch(format!(
                "sparse ordinals skip from {} to {ordinal}",
                ids.len()
            )));
        }
        let len = lengths.get(ordinal)?.ok_or_else(|| {
            Error::IntegrityMismatch(format!(
                "sparse ordinal {ordinal} has no document length"
            ))
        })?;
        ids.push(ChunkId::new(id.value()));
        doc_lengths.push(len.value());
    }

    let mut postings = HashMap::new();
    for entry in txn.open_table(POSTINGS)?.iter()? {
        let (term, bytes) = entry?;
        let bytes = bytes.value();
        if bytes.len() % size_of::<Posting>() != 0 {
            return Err(Error::IntegrityMismatch(format!(
                "truncated postings for term '{}'",
                term.value()
            )));
        }
        let list: Vec<Posting> = bytes
            .chunks_exact(size_of::<Posting>())
            .map(bytemuck::pod_read_unaligned)
            .collect();
        postings.insert(term.value().to_string(), list);
    }

    let sparse =
        SparseIndex::from_parts(policy, params, ids, doc_lengths, postings)?;
    Ok((registry, sparse))
}

/// redb hands out byte slices with no alignment guarantee, so decode
/// element by element.
fn decode_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(size_of::<f32>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    fn sample_index() -> RetrievalIndex {
        let chunks = vec![
            Chunk::new("a", "doc1", "Rust", "rust ownership and borrowing", 0)
                .unwrap(),
            Chunk::new("b", "doc1", "Rust", "the borrow checker", 1).unwrap(),
            Chunk::new("c", "doc2", "Garden", "tomatoes need sun", 0).unwrap(),
        ];
        let records = vec![
            EmbeddingRecord {
                chunk_id: "a".into(),
                vector: vec![0.3, 0.4, 0.0],
            },
            EmbeddingRecord {
                chunk_id: "b".into(),
                vector: vec![0.1, 0.9, 0.2],
            },
            EmbeddingRecord {
                chunk_id: "c".into(),
                vector: vec![-1.0, 0.0, 0.5],
            },
        ];
        RetrievalIndex::build(
            chunks,
            records,
            TokenizerPolicy::EnStem,
            Bm25Params::default(),
        )
        .unwrap()
        .with_embedder(EmbedderDescriptor::Hashing { dimension: 3 })
    }

    #[test]
    fn nothing_published_is_not_ready() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(current_generation(tmp.path()).unwrap(), None);
        let err = load(tmp.path(), Bm25Params::default()).unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }));
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let index = sample_index();
        let generation = save(&index, tmp.path()).unwrap();
        assert_eq!(current_generation(tmp.path()).unwrap(), Some(generation));

        let loaded = load(tmp.path(), Bm25Params::default()).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(
            loaded.embedder(),
            Some(&EmbedderDescriptor::Hashing { dimension: 3 })
        );
        assert_eq!(loaded.sparse().tokenizer().policy(), TokenizerPolicy::EnStem);
        assert_eq!(
            loaded.registry().get(&"b".into()).unwrap(),
            index.registry().get(&"b".into()).unwrap()
        );
        assert_eq!(
            loaded.dense().records().unwrap(),
            index.dense().records().unwrap()
        );

        let q = [0.2, 0.8, 0.1];
        assert_eq!(
            loaded.dense().query(&q, 3).unwrap(),
            index.dense().query(&q, 3).unwrap()
        );
        assert_eq!(
            loaded.sparse().query("borrowing rust", 3).unwrap(),
            index.sparse().query("borrowing rust", 3).unwrap()
        );
    }

    #[test]
    fn saving_again_keeps_only_the_predecessor() {
        let tmp = tempfile::tempdir().unwrap();
        let first = save(&sample_index(), tmp.path()).unwrap();
        let second = save(&sample_index(), tmp.path()).unwrap();
        assert!(second > first);
        assert!(tmp.path().join(generation_name(first)).exists());

        let third = save(&sample_index(), tmp.path()).unwrap();
        assert_eq!(current_generation(tmp.path()).unwrap(), Some(third));
        assert!(!tmp.path().join(generation_name(first)).exists());
        assert!(tmp.path().join(generation_name(second)).exists());
        assert!(tmp.path().join(generation_name(third)).exists());
        assert!(!tmp.path().join(CURRENT_TMP).exists());
    }

    #[test]
    fn load_follows_current_when_its_generation_is_pruned() {
        let tmp = tempfile::tempdir().unwrap();
        let first = save(&sample_index(), tmp.path()).unwrap();
        let second = save(&sample_index(), tmp.path()).unwrap();
        // Simulate a reader that resolved `first` just before a prune.
        fs::remove_dir_all(tmp.path().join(generation_name(first))).unwrap();

        let err =
            load_generation(tmp.path(), first, Bm25Params::default())
                .unwrap_err();
        assert!(matches!(err, Error::IntegrityMismatch(_)));
        assert_eq!(current_generation(tmp.path()).unwrap(), Some(second));
        assert_eq!(load(tmp.path(), Bm25Params::default()).unwrap().len(), 3);
    }

    #[test]
    fn loads_never_fail_while_saves_publish() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_path_buf();
        save(&sample_index(), &dir).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let dir = dir.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut loads = 0;
                while !done.load(Ordering::Acquire) {
                    let index = load(&dir, Bm25Params::default()).unwrap();
                    assert_eq!(index.len(), 3);
                    loads += 1;
                }
                loads
            })
        };

        for _ in 0..30 {
            save(&sample_index(), &dir).unwrap();
        }
        done.store(true, Ordering::Release);
        reader.join().unwrap();
        assert_eq!(current_generation(&dir).unwrap(), Some(31));
    }

    #[test]
    fn discard_reports_cleanup_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(generation_name(7));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DENSE_FILE), b"partial").unwrap();

        assert!(discard(&dir, 7));
        assert!(!dir.exists());
        assert!(!discard(&dir, 7));
    }

    #[test]
    fn garbage_pointer_is_an_integrity_failure() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(CURRENT), "nonsense\n").unwrap();
        let err = current_generation(tmp.path()).unwrap_err();
        assert!(matches!(err, Error::IntegrityMismatch(_)));
    }

    #[test]
    fn missing_artifact_is_an_integrity_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let generation = save(&sample_index(), tmp.path()).unwrap();
        fs::remove_file(
            tmp.path().join(generation_name(generation)).join(SPARSE_FILE),
        )
        .unwrap();

        let err = load(tmp.path(), Bm25Params::default()).unwrap_err();
        assert!(matches!(err, Error::IntegrityMismatch(_)));
    }

    #[test]
    fn decodes_unaligned_vectors() {
        let values = [1.5f32, -2.0, 0.25];
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(bytemuck::cast_slice(&values));
        assert_eq!(decode_f32s(&bytes[1..]), values.to_vec());
    }
}
