use serde::Serialize;

use crate::{
    candidate::RankedCandidate,
    error::Result,
    pipeline::{QueryTrace, RetrievedPassage},
};

/// Characters of passage text shown per result in human output.
const PREVIEW_CHARS: usize = 160;

#[derive(Serialize)]
struct JsonResults<'a> {
    query: &'a str,
    result_count: usize,
    results: &'a [RetrievedPassage],
}

/// Format passages for human-readable terminal output.
pub fn format_human(passages: &[RetrievedPassage]) -> String {
    if passages.is_empty() {
        return "No results found.\n".to_string();
    }

    let mut out = String::new();
    for (i, p) in passages.iter().enumerate() {
        out.push_str(&format!(
            "{:>3}. [{:.6}] {} (dense {}, sparse {})\n",
            i + 1,
            p.rrf_score,
            p.chunk_id,
            hit_label(p.dense_rank, p.dense_score),
            hit_label(p.sparse_rank, p.sparse_score),
        ));
        if !p.title.is_empty() {
            out.push_str(&format!("     {}\n", p.title));
        }
        out.push_str(&format!("     {}\n", preview(&p.text)));
    }
    out.push_str(&format!("\n{} result(s)\n", passages.len()));
    out
}

/// Format passages as a JSON document.
pub fn format_json(
    query: &str,
    passages: &[RetrievedPassage],
) -> Result<String> {
    Ok(serde_json::to_string_pretty(&JsonResults {
        query,
        result_count: passages.len(),
        results: passages,
    })?)
}

/// Human output plus both source lists and stage timings.
pub fn format_detailed(trace: &QueryTrace) -> String {
    let mut out = String::new();
    out.push_str(&format_candidates("Dense candidates", &trace.dense));
    out.push_str(&format_candidates("Sparse candidates", &trace.sparse));
    out.push_str("Fused:\n");
    out.push_str(&format_human(&trace.passages));

    let t = &trace.timings;
    out.push_str(&format!(
        "\nembed {:.2?}, dense {:.2?}, sparse {:.2?}, fuse {:.2?}, total {:.2?}\n",
        t.embed, t.dense, t.sparse, t.fuse, t.total
    ));
    out
}

/// `QueryTrace` as a JSON document.
pub fn format_detailed_json(trace: &QueryTrace) -> Result<String> {
    Ok(serde_json::to_string_pretty(trace)?)
}

fn format_candidates(heading: &str, candidates: &[RankedCandidate]) -> String {
    let mut out = format!("{heading}:\n");
    if candidates.is_empty() {
        out.push_str("  (none)\n");
    }
    for c in candidates {
        out.push_str(&format!("{:>3}. [{:.4}] {}\n", c.rank, c.score, c.chunk_id));
    }
    out.push('\n');
    out
}

fn hit_label(rank: Option<usize>, score: Option<f32>) -> String {
    match (rank, score) {
        (Some(r), Some(s)) => format!("#{r} {s:.4}"),
        (Some(r), None) => format!("#{r}"),
        _ => "-".to_string(),
    }
}

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}
