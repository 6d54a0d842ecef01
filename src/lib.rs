//! Actuator - prompt-to-function automation service
//!
//! This library exposes the retrieval, synthesis and execution pipeline,
//! enabling integration tests and embedding in other applications.

pub mod catalogue;
pub mod codegen;
pub mod config;
pub mod dispatch;
pub mod embedding;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod index;
pub mod retrieval;
pub mod session;
pub mod state;

// Re-export key types for convenience
pub use catalogue::{Arguments, Catalogue, FunctionDescriptor, FunctionFault, InvocationContext};
pub use codegen::{generate, GeneratedArtifact};
pub use config::Config;
pub use dispatch::{execute_multi, execute_single, ExecutionReport};
pub use embedding::{Embedder, HashingEmbedder, OnnxEmbedder};
pub use error::{AppError, InvocationError, Result};
pub use executor::{ExecutionOutcome, Executor};
pub use handlers::app_router;
pub use index::{EmbeddingIndex, IndexHandle};
pub use retrieval::{RetrievalResult, Retriever};
pub use session::{SessionStore, Turn};
pub use state::AppState;
