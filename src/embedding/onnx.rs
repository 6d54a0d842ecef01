//! Bi-encoder sentence embeddings served through ONNX Runtime.
//!
//! Query and catalogue descriptions are encoded independently, so descriptor
//! embeddings can be computed once per index build and only the prompt is
//! encoded per request.

use super::{l2_normalize, Embedder};
use crate::error::{AppError, Result};
use crossbeam::queue::ArrayQueue;
use ndarray::Array2;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use sha2::{Digest, Sha256};
use std::cell::UnsafeCell;
use std::path::Path;
use tokenizers::Tokenizer;

/// A pool of bi-encoder sessions behind a lock-free index queue.
///
/// `Session::run` needs `&mut self`. Rather than serialising every encode
/// behind a Mutex, each concurrent caller pops an exclusive session index from
/// the queue and pushes it back when done.
pub struct OnnxEmbedder {
    sessions: Vec<UnsafeCell<Session>>,
    available: ArrayQueue<usize>,
    tokenizer: Tokenizer,
    max_length: usize,
    embedding_dim: usize,
    identity: String,
}

impl OnnxEmbedder {
    /// Load the tokenizer and `pool_size` sessions of the model.
    pub fn load_pool(
        model_path: &Path,
        tokenizer_path: &Path,
        max_length: usize,
        pool_size: usize,
        intra_threads: usize,
    ) -> Result<Self> {
        let pool_size = pool_size.max(1);

        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| {
            AppError::ModelError(format!("Failed to load bi-encoder tokenizer: {}", e))
        })?;

        // Read model file once, share the bytes across sessions
        let model_bytes = std::fs::read(model_path)
            .map_err(|e| AppError::ModelError(format!("Failed to read model file: {}", e)))?;

        let mut sessions = Vec::with_capacity(pool_size);
        let available = ArrayQueue::new(pool_size);

        for i in 0..pool_size {
            let session = Session::builder()
                .map_err(|e| AppError::ModelError(e.to_string()))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|e| AppError::ModelError(e.to_string()))?
                .with_intra_threads(intra_threads.max(1))
                .map_err(|e| AppError::ModelError(e.to_string()))?
                .commit_from_memory(&model_bytes)
                .map_err(|e: ort::Error| AppError::ModelError(e.to_string()))?;

            sessions.push(UnsafeCell::new(session));
            available
                .push(i)
                .map_err(|_| AppError::ModelError("Failed to initialize session pool".into()))?;
        }

        // Model bytes go into the identity so a swapped model invalidates the index
        let digest = Sha256::digest(&model_bytes);
        let short: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
        let identity = format!(
            "onnx/{}/{}/{}",
            model_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            short,
            max_length
        );

        tracing::info!(
            model = %model_path.display(),
            tokenizer = %tokenizer_path.display(),
            max_length,
            pool_size,
            intra_threads,
            "Bi-encoder session pool loaded"
        );

        let mut embedder = Self {
            sessions,
            available,
            tokenizer,
            max_length,
            embedding_dim: 0,
            identity,
        };

        // Hidden size is whatever the model emits
        let session_idx = embedder.acquire_session()?;
        let sample = embedder.encode_on_session(session_idx, &["width check".to_string()]);
        embedder.release_session(session_idx);
        embedder.embedding_dim = sample?.ncols();
        embedder.identity = format!("{}/{}", embedder.identity, embedder.embedding_dim);

        tracing::info!(
            identity = %embedder.identity,
            dimension = embedder.embedding_dim,
            "Bi-encoder output width detected"
        );

        Ok(embedder)
    }

    fn acquire_session(&self) -> Result<usize> {
        self.available
            .pop()
            .ok_or_else(|| AppError::ResourceError("No available embedding sessions".into()))
    }

    fn release_session(&self, index: usize) {
        // Only indices we popped come back, so the queue never overflows
        let _ = self.available.push(index);
    }

    fn encode_on_session(&self, session_idx: usize, texts: &[String]) -> Result<Array2<f32>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| AppError::ModelError(format!("Tokenization failed: {}", e)))?;

        let batch_size = encodings.len();

        // Pad to the longest sequence in the batch, capped at max_length
        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len().min(self.max_length))
            .max()
            .unwrap_or(1)
            .max(1);

        let mut input_ids = vec![0i64; batch_size * max_len];
        let mut attention_mask = vec![0i64; batch_size * max_len];
        let token_type_ids = vec![0i64; batch_size * max_len];

        for (i, encoding) in encodings.iter().enumerate() {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();
            let len = ids.len().min(max_len);

            for j in 0..len {
                input_ids[i * max_len + j] = ids[j] as i64;
                attention_mask[i * max_len + j] = mask[j] as i64;
            }
        }

        let shape = [batch_size, max_len];
        let input_ids_tensor = Tensor::from_array((shape, input_ids))
            .map_err(|e| AppError::ModelError(e.to_string()))?;
        let attention_mask_tensor = Tensor::from_array((shape, attention_mask.clone()))
            .map_err(|e| AppError::ModelError(e.to_string()))?;
        let token_type_ids_tensor = Tensor::from_array((shape, token_type_ids))
            .map_err(|e| AppError::ModelError(e.to_string()))?;

        // SAFETY: session_idx was popped from `available` and is not pushed back
        // until this call returns, so no other thread can reach this session.
        let session = unsafe { &mut *self.sessions[session_idx].get() };

        let outputs = session
            .run(ort::inputs![
                "input_ids" => input_ids_tensor,
                "attention_mask" => attention_mask_tensor,
                "token_type_ids" => token_type_ids_tensor,
            ])
            .map_err(|e| AppError::ModelError(format!("Bi-encoder inference failed: {}", e)))?;

        // last_hidden_state: (batch, seq_len, hidden_size)
        let hidden_state = outputs.get("last_hidden_state").ok_or_else(|| {
            AppError::ModelError("No 'last_hidden_state' output found".to_string())
        })?;

        let (shape_info, data) = hidden_state
            .try_extract_tensor::<f32>()
            .map_err(|e| AppError::ModelError(e.to_string()))?;
        let hidden_size = shape_info[2] as usize;

        // Mean pooling over unmasked tokens
        let mut embeddings = Array2::zeros((batch_size, hidden_size));

        for i in 0..batch_size {
            let mut sum = vec![0.0f32; hidden_size];
            let mut count = 0.0f32;

            for j in 0..max_len {
                if attention_mask[i * max_len + j] == 1 {
                    let base_idx = i * max_len * hidden_size + j * hidden_size;
                    for (k, sum_val) in sum.iter_mut().enumerate() {
                        *sum_val += data[base_idx + k];
                    }
                    count += 1.0;
                }
            }

            if count > 0.0 {
                for (k, sum_val) in sum.iter().enumerate() {
                    embeddings[[i, k]] = sum_val / count;
                }
            }

            l2_normalize(embeddings.row_mut(i));
        }

        Ok(embeddings)
    }
}

impl Embedder for OnnxEmbedder {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn dimension(&self) -> usize {
        self.embedding_dim
    }

    fn max_concurrency(&self) -> usize {
        self.sessions.len()
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Array2<f32>> {
        if texts.is_empty() {
            return Ok(Array2::zeros((0, self.embedding_dim)));
        }

        let session_idx = self.acquire_session()?;
        let result = self.encode_on_session(session_idx, texts);
        // Always hand the session back, even on error
        self.release_session(session_idx);

        result
    }
}

// SAFETY: every access to a `Session` goes through an index popped from the
// ArrayQueue, which hands each index to at most one thread at a time. That is
// the same exclusion a Mutex per session would give, without blocking.
unsafe impl Send for OnnxEmbedder {}
unsafe impl Sync for OnnxEmbedder {}
