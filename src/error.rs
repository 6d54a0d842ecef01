use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum AppError {
    #[error("Embedding model failed: {0}")]
    ModelError(String),

    #[error("Invalid input: {0}")]
    ValidationError(String),

    #[error("Service temporarily unavailable: {0}")]
    ResourceError(String),

    #[error("Embedding index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Catalogue error: {0}")]
    CatalogueError(String),

    #[error("Index persistence failed: {0}")]
    PersistenceError(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::ModelError(e) => {
                tracing::error!(error = %e, "Embedding model error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::ValidationError(msg) => {
                tracing::warn!(error = %msg, "Validation error");
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            AppError::ResourceError(msg) => {
                tracing::warn!(error = %msg, "Resource error");
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
            AppError::IndexUnavailable(msg) => {
                tracing::error!(error = %msg, "Index unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            AppError::CatalogueError(msg) => {
                tracing::error!(error = %msg, "Catalogue error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::PersistenceError(msg) => {
                tracing::error!(error = %msg, "Persistence error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}

impl From<ort::Error> for AppError {
    fn from(err: ort::Error) -> Self {
        AppError::ModelError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Per-function failures. These never become HTTP errors: they are rendered
/// into the `error` field of the function's result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    #[error("NoMatch")]
    NoMatch,

    #[error("ParameterMismatch: unknown parameter(s) {} for `{function}`", quoted(.unknown))]
    ParameterMismatch {
        function: String,
        unknown: Vec<String>,
    },

    #[error("{0}")]
    ExecutionFault(String),

    #[error("timeout")]
    Timeout,
}

impl InvocationError {
    /// Stable kind label, used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InvocationError::NoMatch => "no_match",
            InvocationError::ParameterMismatch { .. } => "parameter_mismatch",
            InvocationError::ExecutionFault(_) => "execution_fault",
            InvocationError::Timeout => "timeout",
        }
    }
}

fn quoted(names: &[String]) -> String {
    names
        .iter()
        .map(|n| format!("`{}`", n))
        .collect::<Vec<_>>()
        .join(", ")
}
