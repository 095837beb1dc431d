//! Turning retrieved passages into a grounded prompt for an answer model.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    pipeline::{QueryPipeline, RetrievedPassage},
};

/// Produces an answer from a fully built prompt.
pub trait Generator: Send + Sync {
    fn generate(&self, prompt: &str) -> Result<String>;
}

/// Passages as numbered, titled blocks separated by blank lines.
pub fn format_context(passages: &[RetrievedPassage]) -> String {
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| {
            format!("Document {} (Source: {}):\n{}", i + 1, p.title, p.text)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The instruction prompt: answer only from `context`, and say so when the
/// answer is not there.
pub fn build_prompt(query: &str, context: &str) -> String {
    format!(
        "You are a helpful assistant. Answer the question precisely based \
         ONLY on the provided context documents. \n\
         If the information is not present in the context, state that the \
         information is not available.\n\
         \n\
         Context Documents:\n\
         {context}\n\
         \n\
         Question: {query}\n\
         \n\
         Please provide a clear and concise answer:"
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub query: String,
    pub answer: String,
    pub context: String,
    pub passages: Vec<RetrievedPassage>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(
    d: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// Retrieve passages for `query` and ask `generator` to answer from them.
pub fn answer(
    pipeline: &QueryPipeline,
    generator: &dyn Generator,
    query: &str,
) -> Result<Answer> {
    let started = Instant::now();
    let passages = pipeline.execute(query)?;
    let context = format_context(&passages);
    let prompt = build_prompt(query.trim(), &context);
    debug!(passages = passages.len(), prompt_len = prompt.len(), "prompt built");

    let answer = generator.generate(&prompt).map_err(|e| match e {
        Error::Generation(_) => e,
        other => Error::Generation(other.to_string()),
    })?;
    let elapsed = started.elapsed();
    info!(passages = passages.len(), ?elapsed, "answer generated");

    Ok(Answer {
        query: query.trim().to_string(),
        answer,
        context,
        passages,
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        config::RetrievalConfig,
        dense::EmbeddingRecord,
        embedding::{Embedder, HashingEmbedder},
        index::{IndexHandle, RetrievalIndex},
        registry::Chunk,
        sparse::Bm25Params,
        tokenizer::TokenizerPolicy,
    };

    fn passage(id: &str, title: &str, text: &str) -> RetrievedPassage {
        RetrievedPassage {
            chunk_id: id.into(),
            title: title.to_string(),
            source_id: String::new(),
            text: text.to_string(),
            position_in_source: 0,
            rrf_score: 0.0,
            dense_rank: None,
            sparse_rank: None,
            dense_score: None,
            sparse_score: None,
        }
    }

    /// Records the prompt it was given.
    #[derive(Default)]
    struct Echo {
        seen: Mutex<Option<String>>,
    }

    impl Generator for Echo {
        fn generate(&self, prompt: &str) -> Result<String> {
            *self.seen.lock().unwrap() = Some(prompt.to_string());
            Ok("forty-two".to_string())
        }
    }

    struct Broken;

    impl Generator for Broken {
        fn generate(&self, _prompt: &str) -> Result<String> {
            Err(Error::Io(std::io::Error::other("model offline")))
        }
    }

    fn pipeline() -> QueryPipeline {
        let embedder = HashingEmbedder::new(16).unwrap();
        let chunks = vec![
            Chunk::new("c1", "u", "Towels", "always carry a towel", 0)
                .unwrap(),
            Chunk::new("c2", "u", "Answer", "the answer is forty-two", 0)
                .unwrap(),
        ];
        let records = chunks
            .iter()
            .map(|c| EmbeddingRecord {
                chunk_id: c.id.clone(),
                vector: embedder.embed_document(&c.text).unwrap(),
            })
            .collect();
        let index = RetrievalIndex::build(
            chunks,
            records,
            TokenizerPolicy::Simple,
            Bm25Params::default(),
        )
        .unwrap()
        .with_embedder(embedder.descriptor());
        QueryPipeline::new(
            Arc::new(IndexHandle::with_index(index)),
            Arc::new(embedder),
            RetrievalConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn context_numbers_documents_from_one() {
        let context = format_context(&[
            passage("a", "Rust", "Ownership."),
            passage("b", "Go", "Goroutines."),
        ]);
        assert_eq!(
            context,
            "Document 1 (Source: Rust):\nOwnership.\n\n\
             Document 2 (Source: Go):\nGoroutines."
        );
    }

    #[test]
    fn empty_context_is_empty() {
        assert_eq!(format_context(&[]), "");
    }

    #[test]
    fn prompt_embeds_context_and_question() {
        let prompt = build_prompt("Why?", "Document 1 (Source: T):\nBecause.");
        assert!(prompt.starts_with("You are a helpful assistant."));
        assert!(prompt.contains("based ONLY on the provided context"));
        assert!(prompt.contains(
            "Context Documents:\nDocument 1 (Source: T):\nBecause.\n\nQuestion: Why?\n\n"
        ));
        assert!(prompt.ends_with("Please provide a clear and concise answer:"));
    }

    #[test]
    fn answer_passes_the_prompt_through() {
        let pipeline = pipeline();
        let generator = Echo::default();
        let answer = answer(&pipeline, &generator, "  what is the answer  ")
            .unwrap();

        assert_eq!(answer.query, "what is the answer");
        assert_eq!(answer.answer, "forty-two");
        assert!(!answer.passages.is_empty());
        let seen = generator.seen.lock().unwrap().clone().unwrap();
        assert!(seen.contains(&answer.context));
        assert!(seen.contains("Question: what is the answer"));
    }

    #[test]
    fn generator_failures_are_generation_errors() {
        let err = answer(&pipeline(), &Broken, "towel").unwrap_err();
        assert!(matches!(err, Error::Generation(msg) if msg.contains("model offline")));
    }

    #[test]
    fn empty_query_never_reaches_the_generator() {
        let generator = Echo::default();
        let err = answer(&pipeline(), &generator, " ").unwrap_err();
        assert!(matches!(err, Error::EmptyQuery));
        assert!(generator.seen.lock().unwrap().is_none());
    }
}
