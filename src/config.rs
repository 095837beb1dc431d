use serde::Serialize;

use crate::{
    config_db::ConfigDb,
    embedding::EmbedderDescriptor,
    error::{Error, Result},
    fusion::RRF_K,
    sparse::Bm25Params,
    tokenizer::TokenizerPolicy,
};

/// Every key `hybrag config set` accepts.
pub const SETTING_KEYS: [&str; 8] = [
    "dense_top_k",
    "sparse_top_k",
    "rrf_k",
    "final_top_n",
    "bm25_k1",
    "bm25_b",
    "tokenizer",
    "embedder",
];

/// Query-time tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetrievalConfig {
    /// Candidates requested from the dense index.
    pub dense_top_k: usize,
    /// Candidates requested from the sparse index.
    pub sparse_top_k: usize,
    /// RRF smoothing constant.
    pub rrf_k: f64,
    /// Passages returned after fusion.
    pub final_top_n: usize,
    pub bm25: Bm25Params,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dense_top_k: 10,
            sparse_top_k: 10,
            rrf_k: RRF_K,
            final_top_n: 5,
            bm25: Bm25Params::default(),
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dense_top_k == 0 {
            return Err(Error::invalid("dense_top_k", "must be at least 1"));
        }
        if self.sparse_top_k == 0 {
            return Err(Error::invalid("sparse_top_k", "must be at least 1"));
        }
        if !self.rrf_k.is_finite() || self.rrf_k <= 0.0 {
            return Err(Error::invalid(
                "rrf_k",
                format!("must be a positive number, got {}", self.rrf_k),
            ));
        }
        self.bm25.validate()
    }
}

/// Stored settings layered over the built-in defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Settings {
    pub retrieval: RetrievalConfig,
    /// Used when building an index; queries follow the persisted policy.
    pub tokenizer: TokenizerPolicy,
    /// Used when building an index; queries follow the persisted
    /// descriptor.
    #[serde(serialize_with = "serialize_display")]
    pub embedder: EmbedderDescriptor,
}

impl Settings {
    /// Defaults overridden by whatever `db` holds.
    pub fn load(db: &ConfigDb) -> Result<Self> {
        let mut settings = Self::default();
        for (key, value) in db.list_settings()? {
            settings.apply(&key, &value)?;
        }
        settings.retrieval.validate()?;
        Ok(settings)
    }

    /// Parse `value` into the field named by `key`.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        let r = &mut self.retrieval;
        match key {
            "dense_top_k" => r.dense_top_k = parse("dense_top_k", value)?,
            "sparse_top_k" => r.sparse_top_k = parse("sparse_top_k", value)?,
            "rrf_k" => r.rrf_k = parse("rrf_k", value)?,
            "final_top_n" => r.final_top_n = parse("final_top_n", value)?,
            "bm25_k1" => r.bm25.k1 = parse("bm25_k1", value)?,
            "bm25_b" => r.bm25.b = parse("bm25_b", value)?,
            "tokenizer" => self.tokenizer = value.parse()?,
            "embedder" => self.embedder = value.parse()?,
            other => {
                return Err(Error::invalid(
                    "key",
                    format!(
                        "unknown setting '{other}' (expected one of: {})",
                        SETTING_KEYS.join(", ")
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Current value of `key` as it would be written to the database.
    pub fn get(&self, key: &str) -> Option<String> {
        let r = &self.retrieval;
        Some(match key {
            "dense_top_k" => r.dense_top_k.to_string(),
            "sparse_top_k" => r.sparse_top_k.to_string(),
            "rrf_k" => r.rrf_k.to_string(),
            "final_top_n" => r.final_top_n.to_string(),
            "bm25_k1" => r.bm25.k1.to_string(),
            "bm25_b" => r.bm25.b.to_string(),
            "tokenizer" => self.tokenizer.to_string(),
            "embedder" => self.embedder.to_string(),
            _ => return None,
        })
    }
}

/// Validate and persist one setting. Nothing is written if the value is
/// rejected.
pub fn set_setting(db: &ConfigDb, key: &str, value: &str) -> Result<()> {
    let mut settings = Settings::load(db)?;
    settings.apply(key, value)?;
    settings.retrieval.validate()?;
    db.set_setting(key, value.trim())
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::invalid(key, format!("cannot parse '{value}'")))
}

fn serialize_display<S: serde::Serializer>(
    value: &EmbedderDescriptor,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
