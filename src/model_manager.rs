use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;
use tracing::info;

use crate::error::{Error, Result};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";
pub const MODEL_ENV_VAR: &str = "HYBRAG_MODEL";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

fn model_error(e: impl std::fmt::Display) -> Error {
    Error::Embedding(e.to_string())
}

/// Owns the ColBERT model, loading it on first use.
pub struct ModelManager {
    model: Option<ColBERT>,
    model_id: String,
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelManager {
    /// The model id comes from `HYBRAG_MODEL` when set, otherwise
    /// [`DEFAULT_MODEL_ID`].
    pub fn new() -> Self {
        let model_id = std::env::var(MODEL_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_MODEL_ID.to_string());
        Self::with_model_id(model_id)
    }

    pub fn with_model_id(model_id: String) -> Self {
        Self {
            model: None,
            model_id,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Loads the model, downloading from HuggingFace Hub if needed.
    fn ensure_loaded(&mut self) -> Result<&mut ColBERT> {
        match &mut self.model {
            Some(model) => Ok(model),
            slot @ None => {
                info!(model = %self.model_id, "loading embedding model");
                let colbert: ColBERT = ColBERT::from(&self.model_id)
                    .with_device(default_device())
                    .try_into()
                    .map_err(model_error)?;
                Ok(slot.insert(colbert))
            }
        }
    }

    /// Token embeddings of one document, shape `[T, D]`.
    pub fn encode_document(&mut self, text: &str) -> Result<Tensor> {
        self.encode(text, false)
    }

    /// Token embeddings of one query, shape `[Q, D]`.
    pub fn encode_query(&mut self, query: &str) -> Result<Tensor> {
        self.encode(query, true)
    }

    fn encode(&mut self, text: &str, is_query: bool) -> Result<Tensor> {
        let model = self.ensure_loaded()?;
        let embeddings = model
            .encode(&[text.to_string()], is_query)
            .map_err(model_error)?;
        // [1, T, D] -> [T, D]
        embeddings.squeeze(0).map_err(model_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_model_id() {
        let manager = ModelManager::with_model_id("custom/model".to_string());
        assert_eq!(manager.model_id(), "custom/model");
        assert!(!manager.is_loaded());
    }

    #[test]
    fn model_errors_are_embedding_errors() {
        assert!(matches!(model_error("boom"), Error::Embedding(m) if m == "boom"));
    }
}
