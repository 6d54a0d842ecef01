//! Prompt execution handlers.

use crate::catalogue::Arguments;
use crate::dispatch::{execute_multi, execute_single, ExecutionReport};
use crate::error::{AppError, Result};
use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Deserialize;
use std::sync::Arc;

fn default_session_id() -> String {
    "default".to_string()
}

/// Default number of functions for a multi execution
fn default_num_functions() -> usize {
    3
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_session_id")]
    pub session_id: String,
    #[serde(default)]
    pub params: Arguments,
}

#[derive(Debug, Deserialize)]
pub struct MultiExecuteRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_session_id")]
    pub session_id: String,
    #[serde(default = "default_num_functions")]
    pub num_functions: usize,
    /// Parameters per ranked function; missing entries mean no parameters.
    #[serde(default)]
    pub params_list: Vec<Arguments>,
}

fn validate_prompt(prompt: &str) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(AppError::ValidationError("Prompt is required".to_string()));
    }
    Ok(())
}

/// POST /api/execute - Run the single best-matching function for a prompt.
pub async fn execute_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecutionReport>> {
    validate_prompt(&request.prompt)?;
    metrics::counter!("execute_requests_total").increment(1);

    tracing::info!(
        session_id = %request.session_id,
        prompt = %request.prompt,
        "Received prompt"
    );

    let report = execute_single(
        &state,
        &request.prompt,
        &request.session_id,
        request.params,
    )
    .await?;

    Ok(Json(report))
}

/// POST /api/multi-execute - Run the top `num_functions` matches for a prompt.
pub async fn multi_execute_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MultiExecuteRequest>,
) -> Result<Json<Vec<ExecutionReport>>> {
    validate_prompt(&request.prompt)?;

    if request.num_functions == 0 {
        return Err(AppError::ValidationError(
            "num_functions must be at least 1".to_string(),
        ));
    }

    let max_functions = state.config.max_functions;
    if request.num_functions > max_functions {
        return Err(AppError::ValidationError(format!(
            "num_functions exceeds maximum of {}",
            max_functions
        )));
    }

    metrics::counter!("multi_execute_requests_total").increment(1);

    tracing::info!(
        session_id = %request.session_id,
        prompt = %request.prompt,
        num_functions = request.num_functions,
        "Received multi-execute prompt"
    );

    let reports = execute_multi(
        &state,
        &request.prompt,
        &request.session_id,
        request.num_functions,
        request.params_list,
    )
    .await?;

    Ok(Json(reports))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: MultiExecuteRequest =
            serde_json::from_str(r#"{ "prompt": "check system resources" }"#).unwrap();

        assert_eq!(request.session_id, "default");
        assert_eq!(request.num_functions, 3);
        assert!(request.params_list.is_empty());
    }

    #[test]
    fn test_blank_prompt_rejected() {
        assert!(validate_prompt("   ").is_err());
        assert!(validate_prompt("open calculator").is_ok());
    }
}
