use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use tantivy::tokenizer::{
    Language,
    LowerCaser,
    RemoveLongFilter,
    SimpleTokenizer,
    Stemmer,
    TextAnalyzer,
    TokenStream,
    WhitespaceTokenizer,
};

use crate::error::{Error, Result};

/// Tokens longer than this many bytes are dropped by the word-boundary
/// policies.
const MAX_TOKEN_LEN: usize = 40;

/// How chunk and query text is split into terms for sparse scoring.
///
/// The policy chosen at build time is persisted with the sparse index and
/// reused for every query against it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerPolicy {
    /// Split on non-alphanumeric boundaries, then lowercase.
    #[default]
    Simple,
    /// Split on whitespace only, then lowercase. Punctuation stays attached.
    Whitespace,
    /// `Simple` followed by English stemming.
    EnStem,
}

impl TokenizerPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenizerPolicy::Simple => "simple",
            TokenizerPolicy::Whitespace => "whitespace",
            TokenizerPolicy::EnStem => "en_stem",
        }
    }
}

impl fmt::Display for TokenizerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenizerPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simple" => Ok(TokenizerPolicy::Simple),
            "whitespace" => Ok(TokenizerPolicy::Whitespace),
            "en_stem" => Ok(TokenizerPolicy::EnStem),
            other => Err(Error::invalid(
                "tokenizer",
                format!(
                    "unknown policy '{other}' (expected simple, whitespace or en_stem)"
                ),
            )),
        }
    }
}

/// A text analyzer bound to a [`TokenizerPolicy`].
#[derive(Clone)]
pub struct Tokenizer {
    policy: TokenizerPolicy,
    analyzer: TextAnalyzer,
}

impl Tokenizer {
    pub fn new(policy: TokenizerPolicy) -> Self {
        let analyzer = match policy {
            TokenizerPolicy::Simple => {
                TextAnalyzer::builder(SimpleTokenizer::default())
                    .filter(RemoveLongFilter::limit(MAX_TOKEN_LEN))
                    .filter(LowerCaser)
                    .build()
            }
            TokenizerPolicy::Whitespace => {
                TextAnalyzer::builder(WhitespaceTokenizer::default())
                    .filter(LowerCaser)
                    .build()
            }
            TokenizerPolicy::EnStem => {
                TextAnalyzer::builder(SimpleTokenizer::default())
                    .filter(RemoveLongFilter::limit(MAX_TOKEN_LEN))
                    .filter(LowerCaser)
                    .filter(Stemmer::new(Language::English))
                    .build()
            }
        };
        Self { policy, analyzer }
    }

    pub fn policy(&self) -> TokenizerPolicy {
        self.policy
    }

    /// Split `text` into terms, in order, duplicates kept.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        // Token streams borrow the analyzer mutably; a clone keeps
        // `tokenize` usable from many threads at once.
        let mut analyzer = self.analyzer.clone();
        let mut stream = analyzer.token_stream(text);
        let mut terms = Vec::new();
        while stream.advance() {
            terms.push(stream.token().text.clone());
        }
        terms
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(TokenizerPolicy::default())
    }
}

impl fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tokenizer")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
