//! Sentence-transformer embeddings through ONNX Runtime.
//!
//! A model directory holds `model.onnx` and `tokenizer.json`. Token outputs
//! are mean-pooled over the attention mask and L2-normalized, matching how
//! summary chunks are embedded for cosine search.

use std::path::Path;
use std::sync::{Arc, Mutex};

use ort::session::Session;
use ort::value::TensorRef;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use chunkdex_core::error::{ChunkdexError, Result};

use crate::embedding::EmbeddingService;

/// Dimension assumed when the model does not declare a static hidden size.
const FALLBACK_DIMENSIONS: usize = 384;

struct OnnxModel {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    dimensions: usize,
}

/// ONNX Runtime embedding backend. Cheap to clone.
#[derive(Clone)]
pub struct OnnxEmbeddingService {
    model: Arc<OnnxModel>,
}

impl std::fmt::Debug for OnnxEmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxEmbeddingService")
            .field("dimensions", &self.model.dimensions)
            .finish()
    }
}

impl OnnxEmbeddingService {
    pub fn from_directory(model_dir: &Path) -> Result<Self> {
        Self::from_files(
            &model_dir.join("model.onnx"),
            &model_dir.join("tokenizer.json"),
        )
    }

    pub fn from_files(model_path: &Path, tokenizer_path: &Path) -> Result<Self> {
        for (what, path) in [("ONNX model", model_path), ("Tokenizer", tokenizer_path)] {
            if !path.exists() {
                return Err(ChunkdexError::Config(format!(
                    "{} not found at {}",
                    what,
                    path.display()
                )));
            }
        }

        let session = Session::builder()
            .map_err(|e| ChunkdexError::Config(format!("ONNX session builder: {}", e)))?
            .with_intra_threads(1)
            .map_err(|e| ChunkdexError::Config(format!("ONNX thread setup: {}", e)))?
            .commit_from_file(model_path)
            .map_err(|e| ChunkdexError::Config(format!("ONNX model load: {}", e)))?;

        // Output is [batch, seq_len, hidden]; a dynamic hidden size is reported as -1.
        let dimensions = session
            .outputs()
            .first()
            .and_then(|out| out.dtype().tensor_shape())
            .and_then(|shape| shape.last().copied())
            .filter(|d| *d > 0)
            .map(|d| d as usize)
            .unwrap_or(FALLBACK_DIMENSIONS);

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| ChunkdexError::Config(format!("Tokenizer load: {}", e)))?;

        info!(model = %model_path.display(), dimensions, "Loaded ONNX embedding model");

        Ok(Self {
            model: Arc::new(OnnxModel {
                session: Mutex::new(session),
                tokenizer,
                dimensions,
            }),
        })
    }
}

impl OnnxModel {
    fn embed_blocking(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(ChunkdexError::Encoding("Cannot embed empty text".into()));
        }

        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| encoding_error("tokenize", e))?;

        let widen = |xs: &[u32]| xs.iter().map(|&x| x as i64).collect::<Vec<i64>>();
        let mask = widen(encoding.get_attention_mask());
        let seq_len = mask.len();

        let ids = ndarray::Array2::from_shape_vec((1, seq_len), widen(encoding.get_ids()))
            .map_err(|e| encoding_error("input_ids", e))?;
        let mask_arr = ndarray::Array2::from_shape_vec((1, seq_len), mask.clone())
            .map_err(|e| encoding_error("attention_mask", e))?;
        let types = ndarray::Array2::from_shape_vec((1, seq_len), widen(encoding.get_type_ids()))
            .map_err(|e| encoding_error("token_type_ids", e))?;

        let ids_ref =
            TensorRef::from_array_view(&ids).map_err(|e| encoding_error("input_ids", e))?;
        let mask_ref = TensorRef::from_array_view(&mask_arr)
            .map_err(|e| encoding_error("attention_mask", e))?;
        let types_ref =
            TensorRef::from_array_view(&types).map_err(|e| encoding_error("token_type_ids", e))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| ChunkdexError::Encoding(format!("Session lock poisoned: {}", e)))?;
        let outputs = session
            .run(ort::inputs![ids_ref, mask_ref, types_ref])
            .map_err(|e| encoding_error("inference", e))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| encoding_error("extract output", e))?;
        let hidden = match shape.iter().copied().collect::<Vec<i64>>().as_slice() {
            [.., _, h] if *h > 0 => *h as usize,
            other => {
                return Err(ChunkdexError::Encoding(format!(
                    "Unexpected output shape {:?}",
                    other
                )))
            }
        };

        let pooled = mean_pool(data, &mask, hidden);
        debug!(tokens = seq_len, hidden, "Embedded text");
        Ok(pooled)
    }
}

fn encoding_error(stage: &str, err: impl std::fmt::Display) -> ChunkdexError {
    ChunkdexError::Encoding(format!("{}: {}", stage, err))
}

/// Average the token rows whose mask is set, then L2-normalize.
fn mean_pool(tokens: &[f32], mask: &[i64], hidden: usize) -> Vec<f32> {
    let mut pooled = vec![0.0f32; hidden];
    let mut count = 0.0f32;

    for (row, _) in tokens
        .chunks_exact(hidden)
        .zip(mask)
        .filter(|(_, m)| **m > 0)
    {
        for (acc, v) in pooled.iter_mut().zip(row) {
            *acc += v;
        }
        count += 1.0;
    }

    if count > 0.0 {
        pooled.iter_mut().for_each(|v| *v /= count);
    }

    let norm = pooled.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        pooled.iter_mut().for_each(|v| *v /= norm);
    }
    pooled
}

impl EmbeddingService for OnnxEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        // Inference is CPU-bound.
        let model = Arc::clone(&self.model);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || model.embed_blocking(&text))
            .await
            .map_err(|e| ChunkdexError::Encoding(format!("Embedding task failed: {}", e)))?
    }

    fn dimensions(&self) -> usize {
        self.model.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_config_error() {
        let err = OnnxEmbeddingService::from_directory(Path::new("/nonexistent")).unwrap_err();
        assert!(matches!(err, ChunkdexError::Config(_)));
    }

    #[test]
    fn test_mean_pool_skips_masked_tokens() {
        // Two tokens of width 2; the second is padding.
        let tokens = [3.0, 4.0, 100.0, 100.0];
        let pooled = mean_pool(&tokens, &[1, 0], 2);
        assert!((pooled[0] - 0.6).abs() < 1e-6);
        assert!((pooled[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_mean_pool_all_masked() {
        let pooled = mean_pool(&[1.0, 1.0], &[0], 2);
        assert_eq!(pooled, vec![0.0, 0.0]);
    }
}
