use crate::catalogue::{fingerprint_hex, FunctionDescriptor};
use crate::error::Result;
use crate::state::{AppState, RefreshOutcome};
use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct IndexStatus {
    pub fingerprint: String,
    pub functions: usize,
    pub embedder: String,
    pub dimension: usize,
    pub catalogue: Vec<FunctionDescriptor>,
}

/// GET /api/index - Describe the live catalogue and its index.
pub async fn index_status_handler(State(state): State<Arc<AppState>>) -> Json<IndexStatus> {
    let snapshot = state.index.snapshot();
    Json(IndexStatus {
        fingerprint: fingerprint_hex(snapshot.index.fingerprint()),
        functions: snapshot.catalogue.len(),
        embedder: snapshot.index.embedder_identity().to_string(),
        dimension: snapshot.index.dimension(),
        catalogue: snapshot.catalogue.descriptors().cloned().collect(),
    })
}

/// POST /api/index/refresh - Rebuild the index if the catalogue changed.
pub async fn refresh_index_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RefreshOutcome>> {
    let outcome = state.refresh_index().await?;
    Ok(Json(outcome))
}
