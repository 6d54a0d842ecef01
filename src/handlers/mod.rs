pub mod execute;
pub mod health;
pub mod history;
pub mod index;

pub use execute::{execute_handler, multi_execute_handler};
pub use health::{health_handler, ready_handler, root_handler};
pub use history::{clear_history_handler, history_handler};
pub use index::{index_status_handler, refresh_index_handler};

use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Routes under `/api`.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/execute", post(execute_handler))
        .route("/multi-execute", post(multi_execute_handler))
        .route(
            "/chat-history/:session_id",
            get(history_handler).delete(clear_history_handler),
        )
        .route("/index", get(index_status_handler))
        .route("/index/refresh", post(refresh_index_handler))
}

/// Full application router without the metrics endpoint and middleware.
pub fn app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .nest("/api", api_routes())
        .with_state(state)
}
