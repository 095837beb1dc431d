use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use crate::{
    config::RetrievalConfig,
    embedding::EmbedderDescriptor,
    error::Result,
    tokenizer::TokenizerPolicy,
};

#[derive(Debug, Parser)]
#[command(
    name = "hybrag",
    version,
    about = "Hybrid dense + BM25 passage retrieval with reciprocal rank fusion"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build an index from a chunk file and publish it
    Index(IndexArgs),
    /// Retrieve passages for a question
    Search(SearchArgs),
    /// Show the published index and effective settings
    Status(StatusArgs),
    /// Manage stored retrieval settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Index --

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// Chunk file: a JSON array or JSON Lines of chunk records
    pub chunks: PathBuf,

    /// Precomputed embeddings (JSON array of {chunk_id, vector}); when
    /// omitted, chunks are embedded with --embedder
    #[arg(long)]
    pub embeddings: Option<PathBuf>,

    /// Embedder descriptor, e.g. hashing:384 or colbert:<model-id>
    #[arg(long)]
    pub embedder: Option<EmbedderDescriptor>,

    /// Sparse tokenization policy: simple, whitespace or en_stem
    #[arg(long)]
    pub tokenizer: Option<TokenizerPolicy>,

    /// Chunks embedded per batch
    #[arg(long, default_value = "32")]
    pub batch_size: usize,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The question to retrieve passages for
    pub query: String,

    /// Number of passages to return after fusion
    #[arg(short = 'n', long)]
    pub top_n: Option<usize>,

    /// Candidates taken from the dense index
    #[arg(long)]
    pub dense_k: Option<usize>,

    /// Candidates taken from the sparse index
    #[arg(long)]
    pub sparse_k: Option<usize>,

    /// RRF smoothing constant
    #[arg(long)]
    pub rrf_k: Option<f64>,

    /// BM25 term-frequency saturation
    #[arg(long)]
    pub bm25_k1: Option<f32>,

    /// BM25 length normalisation
    #[arg(long)]
    pub bm25_b: Option<f32>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,

    /// Print the generation prompt built from the results
    #[arg(long, conflicts_with = "detailed")]
    pub prompt: bool,

    /// Also show the dense and sparse candidate lists and stage timings
    #[arg(long)]
    pub detailed: bool,
}

impl SearchArgs {
    /// Apply command-line overrides on top of `base` and validate.
    pub fn retrieval_config(
        &self,
        base: RetrievalConfig,
    ) -> Result<RetrievalConfig> {
        let mut config = base;
        if let Some(n) = self.top_n {
            config.final_top_n = n;
        }
        if let Some(k) = self.dense_k {
            config.dense_top_k = k;
        }
        if let Some(k) = self.sparse_k {
            config.sparse_top_k = k;
        }
        if let Some(k) = self.rrf_k {
            config.rrf_k = k;
        }
        if let Some(k1) = self.bm25_k1 {
            config.bm25.k1 = k1;
        }
        if let Some(b) = self.bm25_b {
            config.bm25.b = b;
        }
        config.validate()?;
        Ok(config)
    }
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show effective settings
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate and store a setting
    Set {
        /// Setting name, e.g. rrf_k
        key: String,
        /// New value
        value: String,
    },
    /// Remove a stored setting (revert to its default)
    Clear {
        /// Setting name
        key: String,
    },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "hybrag",
            &mut std::io::stdout(),
        );
    }
}
