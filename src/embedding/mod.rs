//! Text embedding functions.
//!
//! Every embedder produces L2-normalised vectors, so cosine similarity is a
//! plain dot product. The embedder's identity is persisted with the index:
//! vectors from different embedders are never compared.

pub mod hashing;
pub mod onnx;

pub use hashing::HashingEmbedder;
pub use onnx::OnnxEmbedder;

use crate::config::{Config, EmbedderBackend};
use crate::error::Result;
use ndarray::{Array1, Array2};
use std::sync::Arc;

pub trait Embedder: Send + Sync {
    /// Stable identifier of the embedding function (backend, model, dimension).
    fn identity(&self) -> &str;

    fn dimension(&self) -> usize;

    /// How many `embed_batch` calls may run at once without failing for
    /// lack of resources.
    fn max_concurrency(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    /// Encode a batch of texts into an `(n, dimension)` matrix of unit rows.
    fn embed_batch(&self, texts: &[String]) -> Result<Array2<f32>>;

    fn embed(&self, text: &str) -> Result<Array1<f32>> {
        let embeddings = self.embed_batch(&[text.to_string()])?;
        Ok(embeddings.row(0).to_owned())
    }
}

/// Build the embedder selected by `config`.
pub fn load_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    match config.embedder {
        EmbedderBackend::Hashing => {
            let embedder = HashingEmbedder::new();
            tracing::info!(identity = embedder.identity(), "Hashing embedder ready");
            Ok(Arc::new(embedder))
        }
        EmbedderBackend::Onnx => {
            let pool_size = config.pool_size.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
            });
            let embedder = OnnxEmbedder::load_pool(
                &config.bi_encoder_model_path,
                &config.bi_encoder_tokenizer_path,
                config.max_sequence_length,
                pool_size,
                config.intra_threads,
            )?;
            Ok(Arc::new(embedder))
        }
    }
}

/// Cosine similarity between a query embedding and every row of `embeddings`.
///
/// Both sides are L2-normalised, so this is the dot product.
pub fn cosine_similarity(query: &Array1<f32>, embeddings: &Array2<f32>) -> Vec<f32> {
    if embeddings.ncols() != query.len() {
        return vec![0.0; embeddings.nrows()];
    }
    embeddings.outer_iter().map(|row| query.dot(&row)).collect()
}

/// Scale `vector` to unit length in place. Zero vectors are left as-is.
pub(crate) fn l2_normalize(mut vector: ndarray::ArrayViewMut1<f32>) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.mapv_inplace(|v| v / norm);
    }
}
