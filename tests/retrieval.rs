use std::sync::Arc;

use hybrag::{
    Chunk,
    Embedder,
    Error,
    FailureClass,
    HashingEmbedder,
    IndexHandle,
    QueryPipeline,
    RankedCandidate,
    RetrievalConfig,
    RetrievalIndex,
    TokenizerPolicy,
    dense::EmbeddingRecord,
    fuse,
    sparse::Bm25Params,
    store,
};

fn corpus() -> Vec<Chunk> {
    [
        ("rust-1", "Rust", "Rust guarantees memory safety without a garbage collector."),
        ("rust-2", "Rust", "The borrow checker enforces ownership and borrowing rules."),
        ("go-1", "Go", "Go uses a garbage collector and goroutines for concurrency."),
        ("py-1", "Python", "Python is dynamically typed and garbage collected."),
        ("tomato-1", "Tomato", "Tomato plants need full sun and regular watering."),
        ("tomato-2", "Tomato", "Prune tomato suckers to improve air flow."),
    ]
    .into_iter()
    .enumerate()
    .map(|(i, (id, title, text))| {
        Chunk::new(id, format!("https://example.org/{title}"), title, text, i)
            .unwrap()
    })
    .collect()
}

fn embed(embedder: &HashingEmbedder, chunks: &[Chunk]) -> Vec<EmbeddingRecord> {
    chunks
        .iter()
        .map(|c| EmbeddingRecord {
            chunk_id: c.id.clone(),
            vector: embedder.embed_document(&c.text).unwrap(),
        })
        .collect()
}

fn build(policy: TokenizerPolicy) -> RetrievalIndex {
    let embedder = HashingEmbedder::new(128).unwrap();
    let chunks = corpus();
    let records = embed(&embedder, &chunks);
    RetrievalIndex::build(chunks, records, policy, Bm25Params::default())
        .unwrap()
        .with_embedder(embedder.descriptor())
}

fn pipeline_for(index: RetrievalIndex) -> QueryPipeline {
    let embedder: Arc<dyn Embedder> =
        Arc::new(HashingEmbedder::new(128).unwrap());
    QueryPipeline::new(
        Arc::new(IndexHandle::with_index(index)),
        embedder,
        RetrievalConfig::default(),
    )
    .unwrap()
}

#[test]
fn reload_gives_identical_results() {
    let tmp = tempfile::tempdir().unwrap();
    let built = build(TokenizerPolicy::EnStem);
    store::save(&built, tmp.path()).unwrap();
    let loaded = store::load(tmp.path(), Bm25Params::default()).unwrap();

    let before = pipeline_for(built);
    let after = pipeline_for(loaded);

    for query in [
        "garbage collector",
        "ownership rules in rust",
        "how much sun do tomatoes need",
        "nothing matches this xyzzy",
    ] {
        let a = before.execute_detailed(query).unwrap();
        let b = after.execute_detailed(query).unwrap();
        assert_eq!(a.dense, b.dense, "{query}");
        assert_eq!(a.sparse, b.sparse, "{query}");
        assert_eq!(a.passages, b.passages, "{query}");
        for (x, y) in a.passages.iter().zip(&b.passages) {
            assert_eq!(x.rrf_score.to_bits(), y.rrf_score.to_bits());
        }
    }
}

#[test]
fn keyword_and_semantic_evidence_are_combined() {
    let pipeline = pipeline_for(build(TokenizerPolicy::Simple));
    let passages = pipeline.execute("garbage collector").unwrap();

    assert!(passages.len() <= 5);
    let top = &passages[0];
    assert!(top.dense_rank.is_some() && top.sparse_rank.is_some());
    assert!(
        ["rust-1", "go-1"].contains(&top.chunk_id.as_str()),
        "unexpected top passage {}",
        top.chunk_id
    );
    assert!(passages.iter().all(|p| !p.text.is_empty()));
}

#[test]
fn worked_rrf_example() {
    let list = |ids: &[&str]| -> Vec<RankedCandidate> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| RankedCandidate {
                chunk_id: (*id).into(),
                rank: i + 1,
                score: 0.0,
            })
            .collect()
    };
    let fused = fuse(&list(&["A", "B", "C"]), &list(&["B", "C", "D"]), 60.0, 10)
        .unwrap();

    let got: Vec<(&str, f64)> = fused
        .iter()
        .map(|f| (f.chunk_id.as_str(), f.rrf_score))
        .collect();
    let want = [
        ("B", 0.032522),
        ("C", 0.032002),
        ("A", 0.016393),
        ("D", 0.015873),
    ];
    assert_eq!(got.len(), want.len());
    for ((id, score), (want_id, want_score)) in got.iter().zip(want) {
        assert_eq!(*id, want_id);
        assert!((score - want_score).abs() < 1e-6, "{id}: {score}");
    }
}

#[test]
fn empty_query_is_a_caller_error() {
    let pipeline = pipeline_for(build(TokenizerPolicy::Simple));
    let err = pipeline.execute("   ").unwrap_err();
    assert!(matches!(err, Error::EmptyQuery));
    assert_eq!(err.class(), FailureClass::Caller);
}

#[test]
fn unbuilt_handle_is_unavailable() {
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
    let pipeline = QueryPipeline::new(
        Arc::new(IndexHandle::new()),
        embedder,
        RetrievalConfig::default(),
    )
    .unwrap();
    let err = pipeline.execute("rust").unwrap_err();
    assert!(matches!(err, Error::NotReady { .. }));
    assert_eq!(err.class(), FailureClass::Unavailable);
}

#[test]
fn mismatched_universes_are_an_integrity_fault() {
    let embedder = HashingEmbedder::new(16).unwrap();
    let chunks = corpus();
    let mut records = embed(&embedder, &chunks);
    records.pop();

    let err = RetrievalIndex::build(
        chunks,
        records,
        TokenizerPolicy::Simple,
        Bm25Params::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::IntegrityMismatch(_)));
    assert_eq!(err.class(), FailureClass::Integrity);
}

#[test]
fn concurrent_queries_agree() {
    let pipeline = Arc::new(pipeline_for(build(TokenizerPolicy::Simple)));
    let expected = pipeline.execute("tomato sun").unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            std::thread::spawn(move || pipeline.execute("tomato sun").unwrap())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
}
