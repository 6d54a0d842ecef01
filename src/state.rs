use crate::catalogue::{fingerprint_hex, load_catalogue, Catalogue};
use crate::config::Config;
use crate::embedding::{load_embedder, Embedder};
use crate::error::{AppError, Result};
use crate::index::{CatalogueSnapshot, EmbeddingIndex, IndexHandle};
use crate::retrieval::RetrievalSettings;
use crate::session::SessionStore;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Produces the catalogue the index is built from, on start-up and on refresh.
type CatalogueLoader = Box<dyn Fn() -> Result<Catalogue> + Send + Sync>;

/// Application state shared across all request handlers.
pub struct AppState {
    /// Live catalogue and index, swapped atomically on refresh.
    pub index: IndexHandle,
    pub sessions: SessionStore,
    pub embedder: Arc<dyn Embedder>,
    /// One permit per concurrent encode the embedder can serve.
    pub embed_permits: Arc<Semaphore>,
    /// Flag indicating the service is ready (index loaded and embedder warmed up)
    pub ready: AtomicBool,
    pub config: Arc<Config>,
    loader: CatalogueLoader,
    /// Serialises index refreshes.
    refresh_lock: tokio::sync::Mutex<()>,
}

/// Result of an index refresh.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RefreshOutcome {
    pub rebuilt: bool,
    pub fingerprint: String,
    pub functions: usize,
}

impl AppState {
    /// Initialize application state from configuration.
    ///
    /// Loads the embedder, reads the catalogue (built-ins, optionally
    /// re-described by `CATALOGUE_PATH`) and loads or builds the index. Any
    /// failure here is fatal to start-up.
    pub fn new(config: Config) -> Result<Self> {
        let embedder = load_embedder(&config)?;
        let path = config.catalogue_path.clone();
        let loader: CatalogueLoader = Box::new(move || load_catalogue(path.as_deref()));
        Self::with_loader(config, embedder, loader)
    }

    /// Initialize with a fixed catalogue and embedder.
    pub fn with_catalogue(
        config: Config,
        embedder: Arc<dyn Embedder>,
        catalogue: Catalogue,
    ) -> Result<Self> {
        Self::with_loader(config, embedder, Box::new(move || Ok(catalogue.clone())))
    }

    fn with_loader(
        config: Config,
        embedder: Arc<dyn Embedder>,
        loader: CatalogueLoader,
    ) -> Result<Self> {
        Self::warmup(embedder.as_ref())?;

        let catalogue = loader()?;
        let index =
            EmbeddingIndex::load_or_build(&catalogue, Arc::clone(&embedder), &config.index_cache_path)
                .map_err(|e| AppError::IndexUnavailable(e.to_string()))?;

        tracing::info!(
            functions = catalogue.len(),
            fingerprint = %fingerprint_hex(index.fingerprint()),
            embedder = embedder.identity(),
            "Catalogue index ready"
        );

        let state = Self {
            index: IndexHandle::new(CatalogueSnapshot {
                catalogue: Arc::new(catalogue),
                index,
            }),
            sessions: SessionStore::new(),
            embed_permits: Arc::new(Semaphore::new(embedder.max_concurrency().max(1))),
            embedder,
            ready: AtomicBool::new(false),
            config: Arc::new(config),
            loader,
            refresh_lock: tokio::sync::Mutex::new(()),
        };

        state.ready.store(true, Ordering::SeqCst);

        Ok(state)
    }

    /// Run a warmup encode to trigger lazy initialization in the embedder.
    /// This ensures the first real request doesn't suffer cold-start latency.
    fn warmup(embedder: &dyn Embedder) -> Result<()> {
        tracing::info!(embedder = embedder.identity(), "Running embedder warmup...");
        let _ = embedder.embed("warmup query")?;
        tracing::info!("Embedder warmup completed successfully");
        Ok(())
    }

    /// Check if the service is ready to handle requests.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn retrieval_settings(&self) -> RetrievalSettings {
        RetrievalSettings::from(self.config.as_ref())
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.config.execution_timeout_ms)
    }

    /// Wait for an embedding slot (503 if none frees up in time).
    ///
    /// Requests queue here instead of failing when every embedder session
    /// is busy.
    pub async fn acquire_embed_permit(&self) -> Result<OwnedSemaphorePermit> {
        let wait = Duration::from_millis(self.config.embed_queue_timeout_ms);
        tokio::time::timeout(wait, Arc::clone(&self.embed_permits).acquire_owned())
            .await
            .map_err(|_| {
                AppError::ResourceError("Service temporarily overloaded, please retry".to_string())
            })?
            .map_err(|_| AppError::ResourceError("Semaphore closed".to_string()))
    }

    /// Re-read the catalogue and rebuild the index if its fingerprint changed.
    ///
    /// The rebuild runs on the blocking pool; in-flight requests keep using
    /// the snapshot they already hold.
    pub async fn refresh_index(self: Arc<Self>) -> Result<RefreshOutcome> {
        let _guard = self.refresh_lock.lock().await;
        let permit = self.acquire_embed_permit().await?;

        let state = Arc::clone(&self);
        let rebuilt = tokio::task::spawn_blocking(move || -> Result<Option<CatalogueSnapshot>> {
            let _permit = permit;
            let catalogue = (state.loader)()?;
            if &catalogue.fingerprint() == state.index.snapshot().index.fingerprint() {
                return Ok(None);
            }

            let index = EmbeddingIndex::build(&catalogue, Arc::clone(&state.embedder))?;
            if let Err(e) = index.to_cache().save(&state.config.index_cache_path) {
                tracing::warn!(error = %e, "Failed to persist rebuilt index");
            }
            Ok(Some(CatalogueSnapshot {
                catalogue: Arc::new(catalogue),
                index,
            }))
        })
        .await
        .map_err(|e| AppError::IndexUnavailable(format!("Index rebuild task failed: {}", e)))??;

        let rebuilt = match rebuilt {
            Some(snapshot) => {
                self.index.replace(snapshot);
                metrics::counter!("index_rebuilds_total").increment(1);
                true
            }
            None => false,
        };

        let current = self.index.snapshot();
        let outcome = RefreshOutcome {
            rebuilt,
            fingerprint: fingerprint_hex(current.index.fingerprint()),
            functions: current.catalogue.len(),
        };

        tracing::info!(
            rebuilt = outcome.rebuilt,
            fingerprint = %outcome.fingerprint,
            functions = outcome.functions,
            "Index refresh complete"
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn write_manifest(path: &std::path::Path, description: &str) {
        std::fs::write(
            path,
            json!({
                "functions": [
                    { "name": "get_disk_usage", "description": description, "keywords": ["disk"], "category": "system_monitoring" },
                    { "name": "get_memory_usage", "description": "RAM in use", "category": "system_monitoring" }
                ]
            })
            .to_string(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_refresh_rebuilds_only_on_change() {
        let dir = tempdir().unwrap();
        let manifest = dir.path().join("catalogue.json");
        write_manifest(&manifest, "Disk space left");

        let config = Config {
            catalogue_path: Some(manifest.clone()),
            index_cache_path: dir.path().join("index.bin"),
            ..Config::default()
        };
        let state = Arc::new(AppState::new(config).unwrap());
        assert!(state.is_ready());
        assert_eq!(state.index.snapshot().catalogue.len(), 2);

        let unchanged = Arc::clone(&state).refresh_index().await.unwrap();
        assert!(!unchanged.rebuilt);

        let held = state.index.snapshot();
        write_manifest(&manifest, "Free storage on the main drive");
        let changed = Arc::clone(&state).refresh_index().await.unwrap();

        assert!(changed.rebuilt);
        assert_ne!(changed.fingerprint, unchanged.fingerprint);
        assert_eq!(
            state
                .index
                .snapshot()
                .catalogue
                .descriptor("get_disk_usage")
                .unwrap()
                .description,
            "Free storage on the main drive"
        );
        // Snapshots taken before the swap are unaffected
        assert_eq!(
            held.catalogue.descriptor("get_disk_usage").unwrap().description,
            "Disk space left"
        );
    }

    #[test]
    fn test_bad_manifest_fails_startup() {
        let dir = tempdir().unwrap();
        let manifest = dir.path().join("catalogue.json");
        std::fs::write(&manifest, "{ not json").unwrap();

        let config = Config {
            catalogue_path: Some(manifest),
            index_cache_path: dir.path().join("index.bin"),
            ..Config::default()
        };
        assert!(matches!(
            AppState::new(config),
            Err(AppError::CatalogueError(_))
        ));
    }
}
