//! Embedding and vector index infrastructure.
//!
//! # Architecture
//!
//! - `embeddings`: the [`EmbeddingClient`] seam and the local fastembed model
//! - `http`: OpenAI-compatible embeddings endpoint
//! - `index`: in-memory vector index with squared-L2 nearest neighbors
//! - `storage`: binary file I/O for vectors.bin persistence
//! - `preprocess`: text preparation for embedding input

mod embeddings;
mod http;
mod index;
mod preprocess;
mod storage;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EmbeddingConfig, EmbeddingProvider};

pub use embeddings::{embed_texts, model_id_hash, EmbeddingClient, EmbeddingError, EmbeddingModel};
pub use http::HttpEmbeddingClient;
pub use index::{squared_l2, IndexError, Neighbor, VectorIndex};
pub use preprocess::{prepare_text, DEFAULT_MAX_INPUT_CHARS};
pub use storage::{VectorStorage, VectorStorageError};

/// Default local embedding model
pub const DEFAULT_MODEL: &str = "bge-base-en-v1.5";

pub fn create_client(
    config: &EmbeddingConfig,
    base_path: &Path,
) -> Result<Arc<dyn EmbeddingClient>, EmbeddingError> {
    match config.provider {
        EmbeddingProvider::Fastembed => Ok(Arc::new(EmbeddingModel::new(
            &config.model,
            base_path.to_path_buf(),
        )?)),
        EmbeddingProvider::Openai => {
            let api_key = std::env::var(&config.api_key_env).ok();
            if api_key.is_none() {
                log::warn!("{} is not set, embedding requests are unauthenticated", config.api_key_env);
            }
            let dimensions = config.dimensions.ok_or_else(|| {
                EmbeddingError::InitFailed("embedding.dimensions is required for openai".to_string())
            })?;
            Ok(Arc::new(HttpEmbeddingClient::new(
                &config.endpoint,
                api_key,
                &config.model,
                dimensions,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
    }
}
