//! Deterministic feature-hashing embedder.
//!
//! Lower-cased word tokens (stop-words dropped) are hashed with SHA-256 into a
//! fixed number of buckets, with a hash-derived sign to keep collisions
//! unbiased. The result is L2-normalised. Identical text always yields the
//! identical vector on every platform, and no model files are needed.

use super::{l2_normalize, Embedder};
use crate::error::Result;
use ndarray::Array2;
use sha2::{Digest, Sha256};

/// Number of hash buckets.
pub const HASHING_DIMENSION: usize = 4096;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "of", "to", "in", "on", "for", "with", "about", "if", "is",
    "are", "be", "my", "me", "i", "it", "this", "that", "please", "can", "you", "from", "by",
    "at", "as",
];

pub struct HashingEmbedder {
    dimension: usize,
    identity: String,
}

impl HashingEmbedder {
    pub fn new() -> Self {
        Self::with_dimension(HASHING_DIMENSION)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            identity: format!("hashing-sha256-v1/{}", dimension),
        }
    }

    /// Bucket index and sign for one token.
    fn feature(&self, token: &str) -> (usize, f32) {
        let digest = Sha256::digest(token.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(head) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (bucket, sign)
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

/// Split into lower-cased alphanumeric words, dropping stop-words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty() && !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

impl Embedder for HashingEmbedder {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Array2<f32>> {
        let mut embeddings = Array2::zeros((texts.len(), self.dimension));

        for (i, text) in texts.iter().enumerate() {
            let mut row = embeddings.row_mut(i);
            for token in tokenize(text) {
                let (bucket, sign) = self.feature(&token);
                row[bucket] += sign;
            }
            l2_normalize(row);
        }

        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_drops_stop_words_and_punctuation() {
        assert_eq!(
            tokenize("Open the Calculator, please!"),
            vec!["open", "calculator"]
        );
        assert!(tokenize("  ... ").is_empty());
    }

    #[test]
    fn test_embedding_is_deterministic_and_unit_length() {
        let embedder = HashingEmbedder::new();
        let a = embedder.embed("check system resources").unwrap();
        let b = embedder.embed("check system resources").unwrap();

        assert_eq!(a, b);
        assert_eq!(a.len(), HASHING_DIMENSION);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new();
        let v = embedder.embed("the of and").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_shared_words_score_higher() {
        let embedder = HashingEmbedder::new();
        let query = embedder.embed("disk space").unwrap();
        let docs = embedder
            .embed_batch(&[
                "Returns information about disk space usage".to_string(),
                "Opens Google Chrome web browser".to_string(),
            ])
            .unwrap();

        let scores = super::super::cosine_similarity(&query, &docs);
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn test_identity_includes_dimension() {
        assert_eq!(
            HashingEmbedder::with_dimension(64).identity(),
            "hashing-sha256-v1/64"
        );
    }
}
