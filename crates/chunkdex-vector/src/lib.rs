//! chunkdex vector - similarity search over time-coded text chunks.
//!
//! A [`Collection`] pairs a nearest-neighbor [`VectorIndex`] (flat or HNSW)
//! with a schema-checked [`MetadataStore`], persists both through
//! `chunkdex-storage`, and serves similarity search and attribute queries
//! while writers add records concurrently.

pub mod collection;
pub mod distance;
pub mod embedding;
pub mod index;
pub mod maintenance;
pub mod metadata;
pub mod onnx;
pub mod pipeline;
pub mod retry;
pub mod search;

pub use collection::Collection;
pub use embedding::{DynEmbeddingService, EmbeddingService, MockEmbedding};
pub use index::{AnnBackend, Neighbor, VectorIndex};
pub use metadata::MetadataStore;
pub use onnx::OnnxEmbeddingService;
pub use retry::RetryPolicy;
pub use search::{CorruptionSignal, SearchHit, SearchResults};
