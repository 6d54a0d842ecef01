//! Request orchestration: retrieve, bind, generate, execute, record.
//!
//! Per-function failures (`NoMatch`, `ParameterMismatch`, faults, timeouts)
//! are reported in the `error` field of that function's report and never
//! abort the request or its siblings.

use crate::catalogue::Arguments;
use crate::codegen::generate;
use crate::error::{AppError, InvocationError, Result};
use crate::executor::{ExecutionOutcome, Executor};
use crate::index::CatalogueSnapshot;
use crate::retrieval::{RetrievalResult, Retriever, ScoredFunction};
use crate::session::Turn;
use crate::state::AppState;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Wire shape of one function's result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub function: Option<String>,
    pub code: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Seconds spent in the invocation.
    pub execution_time: f64,
}

impl ExecutionReport {
    fn no_match() -> Self {
        Self {
            function: None,
            code: None,
            result: None,
            error: Some(InvocationError::NoMatch.to_string()),
            execution_time: 0.0,
        }
    }
}

/// Select the single best function for `prompt` and run it with `params`.
pub async fn execute_single(
    state: &Arc<AppState>,
    prompt: &str,
    session_id: &str,
    params: Arguments,
) -> Result<ExecutionReport> {
    let snapshot = state.index.snapshot();
    let retrieval = retrieve(state, &snapshot, prompt, session_id, 1).await?;

    let Some(best) = retrieval.best() else {
        return Ok(record_no_match(state, prompt, session_id, params));
    };

    Ok(run_one(state, &snapshot, best, params, prompt, session_id).await)
}

/// Select up to `num_functions` functions and run them in rank order.
///
/// `params_list[i]` binds the `i`-th ranked function; missing entries are
/// empty. When nothing matches the result is a single `NoMatch` report.
pub async fn execute_multi(
    state: &Arc<AppState>,
    prompt: &str,
    session_id: &str,
    num_functions: usize,
    params_list: Vec<Arguments>,
) -> Result<Vec<ExecutionReport>> {
    let snapshot = state.index.snapshot();
    let retrieval = retrieve(state, &snapshot, prompt, session_id, num_functions).await?;

    if retrieval.is_empty() {
        let params = params_list.into_iter().next().unwrap_or_default();
        return Ok(vec![record_no_match(state, prompt, session_id, params)]);
    }

    tracing::info!(
        session_id,
        functions = ?retrieval.names(),
        "Matched functions"
    );

    let mut params_list = params_list.into_iter();
    let mut reports = Vec::with_capacity(retrieval.len());
    for scored in &retrieval.matches {
        let params = params_list.next().unwrap_or_default();
        reports.push(run_one(state, &snapshot, scored, params, prompt, session_id).await);
    }

    Ok(reports)
}

async fn retrieve(
    state: &Arc<AppState>,
    snapshot: &Arc<CatalogueSnapshot>,
    prompt: &str,
    session_id: &str,
    k: usize,
) -> Result<RetrievalResult> {
    let state = Arc::clone(state);
    let snapshot = Arc::clone(snapshot);
    let prompt = prompt.to_string();
    let session_id = session_id.to_string();

    let permit = state.acquire_embed_permit().await?;

    // Encoding the prompt may run a model; keep it off the async workers
    tokio::task::spawn_blocking(move || {
        let _permit = permit;
        Retriever::new(&snapshot, &state.sessions, state.retrieval_settings())
            .retrieve(&prompt, &session_id, k)
    })
    .await
    .map_err(|e| AppError::ModelError(format!("Retrieval task join error: {}", e)))?
}

fn record_no_match(
    state: &AppState,
    prompt: &str,
    session_id: &str,
    params: Arguments,
) -> ExecutionReport {
    metrics::counter!("retrieval_no_match_total").increment(1);
    tracing::warn!(session_id, prompt, "No matching function found");

    let report = ExecutionReport::no_match();
    state.sessions.append(
        session_id,
        Turn::new(prompt, None, params, InvocationError::NoMatch.to_string()),
    );
    report
}

async fn run_one(
    state: &AppState,
    snapshot: &CatalogueSnapshot,
    scored: &ScoredFunction,
    params: Arguments,
    prompt: &str,
    session_id: &str,
) -> ExecutionReport {
    let name = scored.descriptor.name.clone();

    let (report, summary) = match generate(&scored.descriptor, &params) {
        Err(mismatch) => {
            tracing::warn!(function = %name, error = %mismatch, "Rejected parameters");
            let report = ExecutionReport {
                function: Some(name.clone()),
                code: None,
                result: None,
                error: Some(mismatch.to_string()),
                execution_time: 0.0,
            };
            (report, mismatch.to_string())
        }
        Ok(artifact) => {
            tracing::info!(
                function = %name,
                score = scored.score,
                similarity = scored.similarity,
                "Matched function"
            );
            let outcome: ExecutionOutcome = Executor::new(Arc::clone(&snapshot.catalogue))
                .execute(&artifact, state.execution_timeout())
                .await;
            let summary = outcome.summary();
            let report = ExecutionReport {
                function: Some(name.clone()),
                code: Some(artifact.source_text().to_string()),
                result: outcome.result,
                error: outcome.error,
                execution_time: outcome.elapsed.as_secs_f64(),
            };
            (report, summary)
        }
    };

    state
        .sessions
        .append(session_id, Turn::new(prompt, Some(name), params, summary));

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{Catalogue, FunctionDescriptor, FunctionFault, InvocationContext};
    use crate::config::Config;
    use crate::embedding::{Embedder, HashingEmbedder};
    use ndarray::Array2;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Hashing embedder that can serve one encode at a time and records
    /// the most encodes it ever saw in flight.
    struct SingleSlotEmbedder {
        inner: HashingEmbedder,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Embedder for SingleSlotEmbedder {
        fn identity(&self) -> &str {
            self.inner.identity()
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn max_concurrency(&self) -> usize {
            1
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Array2<f32>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            let result = self.inner.embed_batch(texts);
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn read_file_catalogue() -> Catalogue {
        let mut catalogue = Catalogue::new();
        catalogue
            .register_fn(
                FunctionDescriptor::new(
                    "read_file",
                    "Reads the contents of a file",
                    &["read", "file"],
                    "command_execution",
                    &["filename"],
                ),
                |args: &Arguments, _: &InvocationContext| {
                    let filename = args
                        .get("filename")
                        .and_then(Value::as_str)
                        .ok_or_else(|| FunctionFault::MissingParameter("filename".into()))?;
                    Ok(json!({ "content": format!("contents of {}", filename) }))
                },
            )
            .unwrap();
        catalogue
    }

    fn state() -> (Arc<AppState>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            index_cache_path: dir.path().join("index.bin"),
            ..Config::default()
        };
        let state = AppState::with_catalogue(
            config,
            Arc::new(HashingEmbedder::new()),
            read_file_catalogue(),
        )
        .unwrap();
        (Arc::new(state), dir)
    }

    fn args(value: Value) -> Arguments {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_single_execution_records_turn() {
        let (state, _dir) = state();

        let report = execute_single(&state, "read a file", "s", args(json!({ "filename": "a.txt" })))
            .await
            .unwrap();

        assert_eq!(report.function.as_deref(), Some("read_file"));
        assert_eq!(report.result, Some(json!({ "content": "contents of a.txt" })));
        assert!(report.code.unwrap().contains("\"read_file\""));

        let turns = state.sessions.get("s");
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].selected_function_name.as_deref(), Some("read_file"));
    }

    #[tokio::test]
    async fn test_no_match_is_data_and_recorded() {
        let (state, _dir) = state();

        let report = execute_single(&state, "asdkjasd", "s", Arguments::new())
            .await
            .unwrap();

        assert_eq!(report, ExecutionReport::no_match());
        let turns = state.sessions.get("s");
        assert_eq!(turns[0].selected_function_name, None);
        assert_eq!(turns[0].result_summary, "NoMatch");
    }

    #[tokio::test]
    async fn test_parameter_mismatch_skips_execution() {
        let (state, _dir) = state();

        let report = execute_single(&state, "read a file", "s", args(json!({ "path": "a.txt" })))
            .await
            .unwrap();

        assert_eq!(report.function.as_deref(), Some("read_file"));
        assert!(report.code.is_none());
        assert!(report.result.is_none());
        assert!(report.error.unwrap().starts_with("ParameterMismatch"));
    }

    #[tokio::test]
    async fn test_fault_reported_in_error_field() {
        let (state, _dir) = state();

        let report = execute_single(&state, "read a file", "s", Arguments::new())
            .await
            .unwrap();

        assert_eq!(
            report.error.as_deref(),
            Some("missing required parameter `filename`")
        );
        assert!(report.result.is_none());
    }

    #[tokio::test]
    async fn test_multi_no_match_is_single_report() {
        let (state, _dir) = state();

        let reports = execute_multi(&state, "asdkjasd", "s", 3, Vec::new())
            .await
            .unwrap();
        assert_eq!(reports, vec![ExecutionReport::no_match()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_queue_for_embedder() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = Arc::new(SingleSlotEmbedder {
            inner: HashingEmbedder::new(),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let config = Config {
            index_cache_path: dir.path().join("index.bin"),
            ..Config::default()
        };
        let state = Arc::new(
            AppState::with_catalogue(config, embedder.clone(), read_file_catalogue()).unwrap(),
        );

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let filename = format!("{}.txt", i);
                    execute_single(
                        &state,
                        "read a file",
                        &format!("s{}", i),
                        args(json!({ "filename": filename })),
                    )
                    .await
                })
            })
            .collect();

        for handle in handles {
            let report = handle.await.unwrap().unwrap();
            assert_eq!(report.function.as_deref(), Some("read_file"));
            assert!(report.error.is_none());
        }
        assert_eq!(embedder.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_embedder_queue_timeout_is_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            index_cache_path: dir.path().join("index.bin"),
            embed_queue_timeout_ms: 20,
            ..Config::default()
        };
        let state = Arc::new(
            AppState::with_catalogue(
                config,
                Arc::new(HashingEmbedder::new()),
                read_file_catalogue(),
            )
            .unwrap(),
        );

        let permits = state.embed_permits.available_permits() as u32;
        let _held = Arc::clone(&state.embed_permits)
            .acquire_many_owned(permits)
            .await
            .unwrap();

        let result = execute_single(&state, "read a file", "s", Arguments::new()).await;
        assert!(matches!(result, Err(AppError::ResourceError(_))));
        assert!(state.sessions.get("s").is_empty());
    }
}
