//! Sandboxed execution of generated artifacts.
//!
//! Each invocation runs on its own OS thread under `catch_unwind`, so a
//! panicking callable becomes an error value and a hung one cannot stall the
//! async runtime. The caller waits at most `timeout`; on expiry the
//! invocation's cancellation flag is raised and the thread is abandoned.

use crate::catalogue::{Catalogue, InvocationContext};
use crate::codegen::GeneratedArtifact;
use crate::error::InvocationError;
use serde_json::Value;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Maximum characters kept by [`ExecutionOutcome::summary`].
pub const SUMMARY_MAX_CHARS: usize = 200;

/// What one invocation produced. `result` and `error` are never both set.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub result: Option<Value>,
    pub error: Option<String>,
    /// `"success"`, or the failing error's kind label.
    pub status: &'static str,
    pub elapsed: Duration,
}

impl ExecutionOutcome {
    pub fn success(result: Value, elapsed: Duration) -> Self {
        Self {
            result: Some(result),
            error: None,
            status: "success",
            elapsed,
        }
    }

    pub fn failure(error: &InvocationError, elapsed: Duration) -> Self {
        Self {
            result: None,
            error: Some(error.to_string()),
            status: error.kind(),
            elapsed,
        }
    }

    /// Short rendering for session history: the error, or the result JSON
    /// truncated to [`SUMMARY_MAX_CHARS`].
    pub fn summary(&self) -> String {
        match (&self.error, &self.result) {
            (Some(error), _) => truncate(error, SUMMARY_MAX_CHARS),
            (None, Some(result)) => truncate(&result.to_string(), SUMMARY_MAX_CHARS),
            (None, None) => String::new(),
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

pub struct Executor {
    catalogue: Arc<Catalogue>,
}

impl Executor {
    pub fn new(catalogue: Arc<Catalogue>) -> Self {
        Self { catalogue }
    }

    /// Run `artifact` against the catalogue, waiting at most `timeout`.
    pub async fn execute(&self, artifact: &GeneratedArtifact, timeout: Duration) -> ExecutionOutcome {
        let execution_id = Uuid::new_v4();
        let function_name = artifact.function_name().to_string();
        let start = Instant::now();

        let outcome = match self.catalogue.function(&function_name) {
            Some(function) => {
                let arguments = artifact.arguments();
                let ctx = InvocationContext::default();
                let worker_ctx = ctx.clone();
                let (tx, rx) = tokio::sync::oneshot::channel();

                let spawned = std::thread::Builder::new()
                    .name(format!("exec-{}", function_name))
                    .spawn(move || {
                        let result = catch_unwind(AssertUnwindSafe(|| {
                            function.invoke(&arguments, &worker_ctx)
                        }));
                        // The receiver is gone if the caller timed out
                        let _ = tx.send(result);
                    });

                match spawned {
                    Err(e) => ExecutionOutcome::failure(
                        &InvocationError::ExecutionFault(format!(
                            "Failed to start execution thread: {}",
                            e
                        )),
                        start.elapsed(),
                    ),
                    Ok(_) => match tokio::time::timeout(timeout, rx).await {
                        Ok(Ok(Ok(Ok(value)))) => ExecutionOutcome::success(value, start.elapsed()),
                        Ok(Ok(Ok(Err(fault)))) => ExecutionOutcome::failure(
                            &InvocationError::ExecutionFault(fault.to_string()),
                            start.elapsed(),
                        ),
                        Ok(Ok(Err(panic))) => ExecutionOutcome::failure(
                            &InvocationError::ExecutionFault(panic_message(panic.as_ref())),
                            start.elapsed(),
                        ),
                        Ok(Err(_)) => ExecutionOutcome::failure(
                            &InvocationError::ExecutionFault(
                                "Execution thread exited without a result".into(),
                            ),
                            start.elapsed(),
                        ),
                        Err(_) => {
                            ctx.cancel();
                            ExecutionOutcome::failure(&InvocationError::Timeout, start.elapsed())
                        }
                    },
                }
            }
            None => ExecutionOutcome::failure(
                &InvocationError::ExecutionFault(format!(
                    "Function `{}` not found in registry",
                    function_name
                )),
                start.elapsed(),
            ),
        };

        let status = outcome.status;
        metrics::counter!(
            "function_executions_total",
            "function" => function_name.clone(),
            "status" => status
        )
        .increment(1);
        metrics::histogram!("function_execution_seconds", "function" => function_name.clone())
            .record(outcome.elapsed.as_secs_f64());

        tracing::info!(
            %execution_id,
            function = %function_name,
            params = %serde_json::Value::Object(artifact.arguments()),
            status,
            error = outcome.error.as_deref(),
            result = %outcome.summary(),
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Function executed"
        );

        outcome
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{Arguments, FunctionDescriptor, FunctionFault};
    use crate::codegen::generate;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn descriptor(name: &str, parameters: &[&str]) -> FunctionDescriptor {
        FunctionDescriptor::new(name, "test function", &[], "test", parameters)
    }

    fn run(catalogue: Catalogue, name: &str, params: Value, timeout: Duration) -> ExecutionOutcome {
        let catalogue = Arc::new(catalogue);
        let artifact = generate(
            catalogue.descriptor(name).unwrap(),
            params.as_object().unwrap(),
        )
        .unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(Executor::new(catalogue).execute(&artifact, timeout))
    }

    #[test]
    fn test_invokes_exactly_once_with_bound_arguments() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));

        let mut catalogue = Catalogue::new();
        let (calls_in, seen_in) = (Arc::clone(&calls), Arc::clone(&seen));
        catalogue
            .register_fn(
                descriptor("echo", &["text"]),
                move |args: &Arguments, _: &InvocationContext| {
                    calls_in.fetch_add(1, Ordering::SeqCst);
                    *seen_in.lock().unwrap() = Some(args.clone());
                    Ok(json!({ "echo": args.get("text").cloned() }))
                },
            )
            .unwrap();

        let outcome = run(catalogue, "echo", json!({ "text": "hi" }), Duration::from_secs(5));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.result, Some(json!({ "echo": "hi" })));
        assert!(outcome.error.is_none());
        assert_eq!(outcome.status, "success");
        let seen = seen.lock().unwrap().clone().unwrap();
        assert_eq!(Value::Object(seen), json!({ "text": "hi" }));
    }

    #[test]
    fn test_fault_becomes_error() {
        let mut catalogue = Catalogue::new();
        catalogue
            .register_fn(descriptor("broken", &[]), |_: &Arguments, _: &InvocationContext| {
                Err(FunctionFault::Failed("disk on fire".into()))
            })
            .unwrap();

        let outcome = run(catalogue, "broken", json!({}), Duration::from_secs(5));
        assert_eq!(outcome.error.as_deref(), Some("disk on fire"));
        assert_eq!(outcome.status, "execution_fault");
        assert!(outcome.result.is_none());
    }

    #[test]
    fn test_panic_becomes_error() {
        let mut catalogue = Catalogue::new();
        catalogue
            .register_fn(
                descriptor("explodes", &[]),
                |_: &Arguments, _: &InvocationContext| -> Result<Value, FunctionFault> {
                    panic!("kaboom")
                },
            )
            .unwrap();

        let outcome = run(catalogue, "explodes", json!({}), Duration::from_secs(5));
        assert_eq!(outcome.error.as_deref(), Some("panicked: kaboom"));
    }

    #[test]
    fn test_timeout_returns_promptly_and_cancels() {
        let observed_cancel = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&observed_cancel);

        let mut catalogue = Catalogue::new();
        catalogue
            .register_fn(
                descriptor("slow", &[]),
                move |_: &Arguments, ctx: &InvocationContext| {
                    let deadline = Instant::now() + Duration::from_secs(5);
                    while Instant::now() < deadline {
                        if ctx.is_cancelled() {
                            observed.store(true, Ordering::SeqCst);
                            return Err(FunctionFault::Cancelled);
                        }
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Ok(json!("finished"))
                },
            )
            .unwrap();

        let outcome = run(catalogue, "slow", json!({}), Duration::from_millis(100));

        assert_eq!(outcome.error.as_deref(), Some("timeout"));
        assert_eq!(outcome.status, "timeout");
        assert!(outcome.result.is_none());
        assert!(outcome.elapsed >= Duration::from_millis(100));
        assert!(
            outcome.elapsed <= Duration::from_millis(150),
            "timeout took {:?}",
            outcome.elapsed
        );

        let wait_until = Instant::now() + Duration::from_secs(2);
        while !observed_cancel.load(Ordering::SeqCst) && Instant::now() < wait_until {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(observed_cancel.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unknown_function_is_an_error() {
        let mut registered = Catalogue::new();
        registered
            .register_fn(descriptor("gone", &[]), |_: &Arguments, _: &InvocationContext| {
                Ok(Value::Null)
            })
            .unwrap();
        let artifact = generate(registered.descriptor("gone").unwrap(), &Arguments::new()).unwrap();

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let outcome = runtime.block_on(
            Executor::new(Arc::new(Catalogue::new())).execute(&artifact, Duration::from_secs(1)),
        );

        assert_eq!(
            outcome.error.as_deref(),
            Some("Function `gone` not found in registry")
        );
    }

    #[test]
    fn test_summary_truncates_long_results() {
        let outcome = ExecutionOutcome::success(json!("x".repeat(500)), Duration::ZERO);
        let summary = outcome.summary();
        assert!(summary.ends_with("..."));
        assert_eq!(summary.chars().count(), SUMMARY_MAX_CHARS + 3);

        let failed = ExecutionOutcome::failure(&InvocationError::Timeout, Duration::ZERO);
        assert_eq!(failed.summary(), "timeout");
    }
}
