//! Text embedding providers.
//!
//! Collections only see [`DynEmbeddingService`]. Production code plugs in
//! [`crate::onnx::OnnxEmbeddingService`]; tests and benchmarks use
//! [`MockEmbedding`], which hashes words into a fixed number of buckets so
//! texts that share words land close to each other.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;

use chunkdex_core::error::{ChunkdexError, Result};

/// Converts text into a fixed-length vector.
///
/// Implementations must be deterministic for identical input and must fail
/// with `Encoding` on empty input.
pub trait EmbeddingService: Send + Sync {
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>>> + Send;

    /// Length of every vector returned by [`EmbeddingService::embed`].
    fn dimensions(&self) -> usize;
}

/// Object-safe form of [`EmbeddingService`], so a collection can hold
/// `Arc<dyn DynEmbeddingService>` without a type parameter.
pub trait DynEmbeddingService: Send + Sync {
    fn embed_boxed<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<f32>>> + Send + 'a>>;

    fn dimensions(&self) -> usize;
}

impl<T: EmbeddingService> DynEmbeddingService for T {
    fn embed_boxed<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<f32>>> + Send + 'a>> {
        Box::pin(self.embed(text))
    }

    fn dimensions(&self) -> usize {
        EmbeddingService::dimensions(self)
    }
}

/// Deterministic bag-of-words embedding for tests.
///
/// Each lowercase alphanumeric word is hashed to a bucket and a sign; the
/// bucket sums are L2-normalized. Identical texts give identical vectors and
/// overlapping vocabularies give small cosine distances.
#[derive(Debug, Clone)]
pub struct MockEmbedding {
    dimensions: usize,
}

impl MockEmbedding {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(&self, word: &str) -> (usize, f32) {
        let mut hasher = DefaultHasher::new();
        word.hash(&mut hasher);
        let h = hasher.finish();
        let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
        ((h % self.dimensions as u64) as usize, sign)
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut out = vec![0.0f32; self.dimensions];

        let lowered = text.to_lowercase();
        let mut words = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .peekable();

        if words.peek().is_none() {
            // Punctuation-only input still needs a stable, non-zero vector.
            let (idx, sign) = self.bucket(lowered.trim());
            out[idx] += sign;
        } else {
            for word in words {
                let (idx, sign) = self.bucket(word);
                out[idx] += sign;
            }
        }

        let norm: f32 = out.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut out {
                *v /= norm;
            }
        } else {
            // Opposite-signed words cancelled out.
            out[0] = 1.0;
        }
        out
    }
}

impl Default for MockEmbedding {
    fn default() -> Self {
        Self::new(384)
    }
}

impl EmbeddingService for MockEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(ChunkdexError::Encoding("Cannot embed empty text".into()));
        }
        Ok(self.vectorize(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
