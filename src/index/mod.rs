//! Embedding index over the catalogue.
//!
//! One row per descriptor, in catalogue order, so a row number doubles as the
//! descriptor's insertion position. The live index is swapped as a whole
//! through [`IndexHandle`]: readers clone an `Arc` snapshot and never observe a
//! half-built index.

pub mod persistence;

pub use persistence::IndexCache;

use crate::catalogue::{fingerprint_hex, Catalogue};
use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{AppError, Result};
use ndarray::{Array1, Array2};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// One scored index row.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub name: String,
    /// Row number, equal to the descriptor's catalogue position.
    pub position: usize,
    pub score: f32,
}

pub struct EmbeddingIndex {
    embedder: Arc<dyn Embedder>,
    names: Vec<String>,
    embeddings: Array2<f32>,
    fingerprint: [u8; 32],
}

impl EmbeddingIndex {
    /// Embed every descriptor of `catalogue`.
    pub fn build(catalogue: &Catalogue, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let start = Instant::now();
        let names: Vec<String> = catalogue.descriptors().map(|d| d.name.clone()).collect();
        let texts: Vec<String> = catalogue.descriptors().map(|d| d.embedding_text()).collect();

        let embeddings = if texts.is_empty() {
            Array2::zeros((0, embedder.dimension()))
        } else {
            embedder.embed_batch(&texts)?
        };

        if embeddings.nrows() != names.len() {
            return Err(AppError::IndexUnavailable(format!(
                "embedder returned {} rows for {} descriptors",
                embeddings.nrows(),
                names.len()
            )));
        }

        tracing::info!(
            functions = names.len(),
            dimension = embeddings.ncols(),
            embedder = embedder.identity(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Embedding index built"
        );

        Ok(Self {
            embedder,
            names,
            embeddings,
            fingerprint: catalogue.fingerprint(),
        })
    }

    /// Reuse the index persisted at `cache_path` when it matches `catalogue`
    /// and `embedder`, otherwise build and persist a fresh one.
    ///
    /// Cache problems are logged and never fatal; only a failed build is.
    pub fn load_or_build(
        catalogue: &Catalogue,
        embedder: Arc<dyn Embedder>,
        cache_path: &Path,
    ) -> Result<Self> {
        let fingerprint = catalogue.fingerprint();
        let names: Vec<String> = catalogue.descriptors().map(|d| d.name.clone()).collect();

        match IndexCache::load(cache_path) {
            Ok(Some(cache)) if cache.is_valid_for(&fingerprint, embedder.identity(), &names) => {
                tracing::info!(
                    path = %cache_path.display(),
                    fingerprint = %fingerprint_hex(&fingerprint),
                    "Reusing persisted embedding index"
                );
                return Ok(Self {
                    embedder,
                    names,
                    embeddings: cache.embeddings,
                    fingerprint,
                });
            }
            Ok(Some(_)) => {
                tracing::info!(
                    path = %cache_path.display(),
                    "Persisted index is stale, rebuilding"
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read persisted index, rebuilding");
            }
        }

        let index = Self::build(catalogue, embedder)
            .map_err(|e| AppError::IndexUnavailable(e.to_string()))?;

        if let Err(e) = index.to_cache().save(cache_path) {
            tracing::warn!(error = %e, "Failed to persist embedding index");
        }

        Ok(index)
    }

    pub fn to_cache(&self) -> IndexCache {
        IndexCache::new(
            self.fingerprint,
            self.embedder.identity(),
            self.names.clone(),
            self.embeddings.clone(),
        )
    }

    /// Top `k` rows for `text`, best first. Ties keep catalogue order.
    pub fn query(&self, text: &str, k: usize) -> Result<Vec<IndexHit>> {
        if k == 0 || self.names.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed(text)?;
        Ok(self.query_embedding(&query, k))
    }

    pub fn query_embedding(&self, query: &Array1<f32>, k: usize) -> Vec<IndexHit> {
        let scores = cosine_similarity(query, &self.embeddings);

        let mut ranked: Vec<(usize, f32)> = scores.into_iter().enumerate().collect();
        // Stable sort: equal scores stay in row order
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        ranked.truncate(k);

        ranked
            .into_iter()
            .map(|(position, score)| IndexHit {
                name: self.names[position].clone(),
                position,
                score,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.embeddings.ncols()
    }

    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    pub fn embedder_identity(&self) -> &str {
        self.embedder.identity()
    }
}

/// A catalogue together with the index built from it.
pub struct CatalogueSnapshot {
    pub catalogue: Arc<Catalogue>,
    pub index: EmbeddingIndex,
}

/// Shared, atomically replaceable pointer to the live snapshot.
pub struct IndexHandle {
    current: RwLock<Arc<CatalogueSnapshot>>,
}

impl IndexHandle {
    pub fn new(snapshot: CatalogueSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn snapshot(&self) -> Arc<CatalogueSnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Install `snapshot`, returning the one it replaced.
    pub fn replace(&self, snapshot: CatalogueSnapshot) -> Arc<CatalogueSnapshot> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{Arguments, FunctionDescriptor, FunctionFault, InvocationContext};
    use crate::embedding::HashingEmbedder;
    use serde_json::Value;
    use tempfile::tempdir;

    fn noop(_: &Arguments, _: &InvocationContext) -> std::result::Result<Value, FunctionFault> {
        Ok(Value::Null)
    }

    fn catalogue(entries: &[(&str, &str)]) -> Catalogue {
        let mut catalogue = Catalogue::new();
        for (name, description) in entries {
            catalogue
                .register_fn(
                    FunctionDescriptor::new(*name, *description, &[], "test", &[]),
                    noop,
                )
                .unwrap();
        }
        catalogue
    }

    fn embedder() -> Arc<dyn Embedder> {
        Arc::new(HashingEmbedder::new())
    }

    #[test]
    fn test_each_description_retrieves_itself_first() {
        let catalogue = catalogue(&[
            ("disk", "Reports free disk space"),
            ("browser", "Opens the web browser"),
            ("clock", "Tells the current time"),
        ]);
        let index = EmbeddingIndex::build(&catalogue, embedder()).unwrap();

        for descriptor in catalogue.descriptors() {
            let hits = index.query(&descriptor.description, 1).unwrap();
            assert_eq!(hits[0].name, descriptor.name);
            assert!((hits[0].score - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_ties_keep_catalogue_order() {
        let catalogue = catalogue(&[("first", "same words"), ("second", "same words")]);
        let index = EmbeddingIndex::build(&catalogue, embedder()).unwrap();

        let hits = index.query("same words", 2).unwrap();
        assert_eq!(hits[0].name, "first");
        assert_eq!(hits[1].name, "second");
        assert_eq!(hits[1].position, 1);
    }

    #[test]
    fn test_empty_catalogue_queries_empty() {
        let index = EmbeddingIndex::build(&Catalogue::new(), embedder()).unwrap();
        assert!(index.is_empty());
        assert!(index.query("anything", 3).unwrap().is_empty());
    }

    #[test]
    fn test_load_or_build_reuses_matching_cache() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.bin");
        let catalogue = catalogue(&[("disk", "Reports free disk space")]);

        let built = EmbeddingIndex::load_or_build(&catalogue, embedder(), &path).unwrap();
        assert!(path.exists());

        let reused = EmbeddingIndex::load_or_build(&catalogue, embedder(), &path).unwrap();
        assert_eq!(reused.to_cache(), built.to_cache());
    }

    #[test]
    fn test_load_or_build_rebuilds_when_catalogue_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.bin");

        let old = catalogue(&[("disk", "Reports free disk space")]);
        EmbeddingIndex::load_or_build(&old, embedder(), &path).unwrap();

        let new = catalogue(&[("disk", "Reports free disk space"), ("clock", "Tells time")]);
        let index = EmbeddingIndex::load_or_build(&new, embedder(), &path).unwrap();

        assert_eq!(index.len(), 2);
        let persisted = IndexCache::load(&path).unwrap().unwrap();
        assert_eq!(&persisted.fingerprint, index.fingerprint());
    }

    #[test]
    fn test_load_or_build_recovers_from_corrupt_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.bin");
        let catalogue = catalogue(&[("disk", "Reports free disk space")]);
        let built = EmbeddingIndex::load_or_build(&catalogue, embedder(), &path).unwrap();

        // Overwrite the dimension field with an absurd width
        let mut bytes = std::fs::read(&path).unwrap();
        let dimension_at = 8 + 4 + 32 + 4 + built.embedder_identity().len() + 8;
        bytes[dimension_at..dimension_at + 8].copy_from_slice(&(1u64 << 62).to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let rebuilt = EmbeddingIndex::load_or_build(&catalogue, embedder(), &path).unwrap();
        assert_eq!(rebuilt.to_cache(), built.to_cache());
        assert_eq!(IndexCache::load(&path).unwrap().unwrap(), built.to_cache());
    }

    #[test]
    fn test_handle_replace_swaps_snapshot() {
        let first = catalogue(&[("one", "first thing")]);
        let second = catalogue(&[("one", "first thing"), ("two", "second thing")]);

        let handle = IndexHandle::new(CatalogueSnapshot {
            index: EmbeddingIndex::build(&first, embedder()).unwrap(),
            catalogue: Arc::new(first),
        });
        let held = handle.snapshot();

        handle.replace(CatalogueSnapshot {
            index: EmbeddingIndex::build(&second, embedder()).unwrap(),
            catalogue: Arc::new(second),
        });

        assert_eq!(held.catalogue.len(), 1);
        assert_eq!(handle.snapshot().catalogue.len(), 2);
    }
}
