//! Reciprocal Rank Fusion of the dense and sparse candidate lists.
//!
//! `rrf_score(d) = Σ 1 / (k + rank_i(d))` over the lists that contain `d`.
//! Only ranks contribute; the retrievers' own scores are carried along for
//! display.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    candidate::RankedCandidate,
    error::{Error, Result},
    registry::ChunkId,
};

/// Default RRF constant (Cormack, Clarke & Buettcher, SIGIR 2009).
pub const RRF_K: f64 = 60.0;

/// A chunk's fused score and its rank and score in each source list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedResult {
    pub chunk_id: ChunkId,
    pub rrf_score: f64,
    pub dense_rank: Option<usize>,
    pub sparse_rank: Option<usize>,
    pub dense_score: Option<f32>,
    pub sparse_score: Option<f32>,
}

type Hit = Option<(usize, f32)>;

fn keep_best(slot: &mut Hit, c: &RankedCandidate) {
    if slot.is_none_or(|(rank, _)| c.rank < rank) {
        *slot = Some((c.rank, c.score));
    }
}

/// Fuse two ranked lists and keep the best `final_n`.
///
/// The output is sorted by `rrf_score` descending with ties broken by
/// ascending chunk id, so it depends only on the rank assignments, not on
/// the order of the input slices. A chunk listed twice in one input keeps
/// its better rank.
pub fn fuse(
    dense: &[RankedCandidate],
    sparse: &[RankedCandidate],
    k_constant: f64,
    final_n: usize,
) -> Result<Vec<FusedResult>> {
    if !k_constant.is_finite() || k_constant <= 0.0 {
        return Err(Error::invalid(
            "rrf_k",
            format!("must be a positive number, got {k_constant}"),
        ));
    }
    if final_n == 0 {
        return Ok(Vec::new());
    }

    let mut hits: BTreeMap<&ChunkId, (Hit, Hit)> = BTreeMap::new();
    for c in dense {
        keep_best(&mut hits.entry(&c.chunk_id).or_default().0, c);
    }
    for c in sparse {
        keep_best(&mut hits.entry(&c.chunk_id).or_default().1, c);
    }

    let contribution =
        |hit: Hit| hit.map_or(0.0, |(r, _)| 1.0 / (k_constant + r as f64));

    let mut fused: Vec<FusedResult> = hits
        .into_iter()
        .map(|(id, (dense_hit, sparse_hit))| FusedResult {
            chunk_id: id.clone(),
            rrf_score: contribution(dense_hit) + contribution(sparse_hit),
            dense_rank: dense_hit.map(|(r, _)| r),
            sparse_rank: sparse_hit.map(|(r, _)| r),
            dense_score: dense_hit.map(|(_, s)| s),
            sparse_score: sparse_hit.map(|(_, s)| s),
        })
        .collect();

    fused.sort_by(|a, b| {
        b.rrf_score
            .total_cmp(&a.rrf_score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    fused.truncate(final_n);
    Ok(fused)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(ids: &[&str]) -> Vec<RankedCandidate> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| RankedCandidate {
                chunk_id: (*id).into(),
                rank: i + 1,
                score: 1.0 / (i + 1) as f32,
            })
            .collect()
    }

    fn order(fused: &[FusedResult]) -> Vec<&str> {
        fused.iter().map(|f| f.chunk_id.as_str()).collect()
    }

    #[test]
    fn worked_example() {
        let dense = ranked(&["A", "B", "C"]);
        let sparse = ranked(&["B", "C", "D"]);

        let fused = fuse(&dense, &sparse, 60.0, 4).unwrap();
        assert_eq!(order(&fused), vec!["B", "C", "A", "D"]);

        let expect = [
            ("B", 1.0 / 62.0 + 1.0 / 61.0, Some(2), Some(1)),
            ("C", 1.0 / 63.0 + 1.0 / 62.0, Some(3), Some(2)),
            ("A", 1.0 / 61.0, Some(1), None),
            ("D", 1.0 / 63.0, None, Some(3)),
        ];
        for (result, (id, score, dense_rank, sparse_rank)) in
            fused.iter().zip(expect)
        {
            assert_eq!(result.chunk_id.as_str(), id);
            assert!((result.rrf_score - score).abs() < 1e-12);
            assert_eq!(result.dense_rank, dense_rank);
            assert_eq!(result.sparse_rank, sparse_rank);
        }
        assert!((fused[0].rrf_score - 0.032522).abs() < 1e-6);
        assert!((fused[1].rrf_score - 0.032002).abs() < 1e-6);
        assert!((fused[2].rrf_score - 0.016393).abs() < 1e-6);
        assert!((fused[3].rrf_score - 0.015873).abs() < 1e-6);
    }

    #[test]
    fn source_scores_travel_with_their_ranks() {
        let dense = vec![
            RankedCandidate {
                chunk_id: "A".into(),
                rank: 1,
                score: 0.9,
            },
            RankedCandidate {
                chunk_id: "A".into(),
                rank: 3,
                score: 0.1,
            },
        ];
        let sparse = vec![RankedCandidate {
            chunk_id: "B".into(),
            rank: 1,
            score: 7.5,
        }];

        let fused = fuse(&dense, &sparse, RRF_K, 10).unwrap();
        let a = fused.iter().find(|f| f.chunk_id.as_str() == "A").unwrap();
        assert_eq!((a.dense_rank, a.dense_score), (Some(1), Some(0.9)));
        assert_eq!((a.sparse_rank, a.sparse_score), (None, None));
        let b = fused.iter().find(|f| f.chunk_id.as_str() == "B").unwrap();
        assert_eq!((b.sparse_rank, b.sparse_score), (Some(1), Some(7.5)));
        assert_eq!(b.dense_score, None);
    }

    #[test]
    fn truncates_to_final_n() {
        let fused =
            fuse(&ranked(&["A", "B", "C"]), &ranked(&["D"]), RRF_K, 2).unwrap();
        assert_eq!(fused.len(), 2);
    }

    #[test]
    fn final_n_zero_is_empty_not_an_error() {
        let fused = fuse(&ranked(&["A"]), &ranked(&["B"]), RRF_K, 0).unwrap();
        assert!(fused.is_empty());
    }

    #[test]
    fn non_positive_k_is_rejected() {
        for k in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = fuse(&ranked(&["A"]), &[], k, 5).unwrap_err();
            assert!(matches!(err, Error::InvalidConfig { key: "rrf_k", .. }));
        }
    }

    #[test]
    fn input_order_does_not_matter() {
        let dense = ranked(&["A", "B", "C", "E"]);
        let sparse = ranked(&["B", "C", "D"]);
        let expected = fuse(&dense, &sparse, RRF_K, 10).unwrap();

        let mut dense_rev = dense.clone();
        dense_rev.reverse();
        let mut sparse_rot = sparse.clone();
        sparse_rot.rotate_left(1);
        assert_eq!(fuse(&dense_rev, &sparse_rot, RRF_K, 10).unwrap(), expected);
    }

    #[test]
    fn fusion_is_idempotent() {
        let dense = ranked(&["X", "Y", "Z"]);
        let sparse = ranked(&["Z", "Y", "W"]);
        let first = fuse(&dense, &sparse, RRF_K, 10).unwrap();
        let second = fuse(&dense, &sparse, RRF_K, 10).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn exact_ties_break_by_chunk_id() {
        // Both have a single rank-1 contribution.
        let fused = fuse(&ranked(&["zeta"]), &ranked(&["alpha"]), RRF_K, 10)
            .unwrap();
        assert_eq!(order(&fused), vec!["alpha", "zeta"]);
        assert_eq!(fused[0].rrf_score, fused[1].rrf_score);
    }

    #[test]
    fn presence_in_both_lists_dominates() {
        // "both" is rank 3 in each list; "single" is rank 3 in one list.
        let dense = ranked(&["d1", "d2", "both", "single"]);
        let sparse = ranked(&["s1", "s2", "both"]);
        let fused = fuse(&dense, &sparse, RRF_K, 10).unwrap();

        let score = |id: &str| {
            fused
                .iter()
                .find(|f| f.chunk_id.as_str() == id)
                .map(|f| f.rrf_score)
                .unwrap()
        };
        assert!(score("both") > score("single"));
        assert!(score("both") > score("d1"));
    }

    #[test]
    fn better_rank_scores_strictly_higher() {
        let fused = fuse(&ranked(&["a", "b", "c"]), &[], RRF_K, 10).unwrap();
        assert!(fused[0].rrf_score > fused[1].rrf_score);
        assert!(fused[1].rrf_score > fused[2].rrf_score);
    }

    #[test]
    fn scores_never_increase_along_the_list() {
        let fused = fuse(
            &ranked(&["a", "b", "c", "d", "e"]),
            &ranked(&["e", "d", "f", "a"]),
            RRF_K,
            10,
        )
        .unwrap();
        for w in fused.windows(2) {
            assert!(w[0].rrf_score >= w[1].rrf_score);
        }
    }

    #[test]
    fn duplicate_entries_keep_the_better_rank() {
        let mut dense = ranked(&["a", "b"]);
        dense.push(RankedCandidate {
            chunk_id: "a".into(),
            rank: 7,
            score: 0.0,
        });
        let fused = fuse(&dense, &[], RRF_K, 10).unwrap();
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].dense_rank, Some(1));
    }

    #[test]
    fn empty_inputs_fuse_to_nothing() {
        assert!(fuse(&[], &[], RRF_K, 5).unwrap().is_empty());
    }
}
