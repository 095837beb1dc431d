use std::cmp::Ordering;

use serde::Serialize;

use crate::registry::ChunkId;

/// One entry of a single retriever's ranked list.
///
/// `score` is specific to the retriever that produced it (cosine similarity
/// or BM25) and is not comparable across lists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedCandidate {
    pub chunk_id: ChunkId,
    /// 1-based position in the list.
    pub rank: usize,
    pub score: f32,
}

/// Order by score descending, then chunk id ascending.
pub(crate) fn by_score_then_id(
    a: &(f32, &ChunkId),
    b: &(f32, &ChunkId),
) -> Ordering {
    b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1))
}

/// Select the best `k` of `scored` and assign 1-based ranks.
pub(crate) fn top_k(
    mut scored: Vec<(f32, &ChunkId)>,
    k: usize,
) -> Vec<RankedCandidate> {
    let k = k.min(scored.len());
    if k == 0 {
        return Vec::new();
    }
    if k < scored.len() {
        scored.select_nth_unstable_by(k - 1, by_score_then_id);
        scored.truncate(k);
    }
    scored.sort_unstable_by(by_score_then_id);

    scored
        .into_iter()
        .enumerate()
        .map(|(i, (score, id))| RankedCandidate {
            chunk_id: id.clone(),
            rank: i + 1,
            score,
        })
        .collect()
}
