use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tracing::{error, field, info, info_span, warn, Instrument, Span};

use crate::config::types::SandboxConfig;
use crate::error::{LearnboxError, Result};
use crate::sandbox::factory::{EnvironmentSelector, SelectBackend};
use crate::sandbox::gate::ConcurrencyGate;
use crate::sandbox::result::ExecutionResult;
use crate::sandbox::traits::{BackendKind, BackendOutcome, ExecutionBackend, ExecutionRequest};
use crate::sandbox::validator::CodeValidator;
use crate::sandbox::workspace::Workspace;

/// Runs untrusted programs, one disposable sandbox per call.
///
/// Each `execute()` validates the source, waits for a gate slot, selects a
/// backend, compiles and runs inside a fresh workspace and tears it all down
/// again. Only the concurrency gate outlives a call.
pub struct DisposableExecutor {
    config: Arc<SandboxConfig>,
    validator: CodeValidator,
    gate: ConcurrencyGate,
    selector: Arc<dyn SelectBackend>,
}

/// Output of a graded run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub success: bool,
    /// Trimmed program output
    pub output: String,
    pub expected: String,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub compilation_error: bool,
    pub timed_out: bool,
    pub security_violation: bool,
    pub sandbox_id: String,
}

impl DisposableExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        let config = Arc::new(config);
        let selector = Arc::new(EnvironmentSelector::new(config.clone()));
        Self::with_selector(config, selector)
    }

    /// Build an executor around a custom backend selector.
    pub fn with_selector(config: Arc<SandboxConfig>, selector: Arc<dyn SelectBackend>) -> Self {
        Self {
            validator: CodeValidator::new(&config.limits),
            gate: ConcurrencyGate::new(config.max_concurrent),
            config,
            selector,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Validate, compile and run `code`. Never fails; every outcome,
    /// including internal errors, is reported in the returned result.
    pub async fn execute(&self, code: &str, exercise_id: Option<&str>) -> ExecutionResult {
        let sandbox_id = new_sandbox_id();
        let span = info_span!(
            "execute",
            sandbox_id = %sandbox_id,
            exercise = exercise_id.unwrap_or("-"),
            backend = field::Empty,
        );
        self.execute_in_span(code, exercise_id, &sandbox_id)
            .instrument(span)
            .await
    }

    async fn execute_in_span(
        &self,
        code: &str,
        exercise_id: Option<&str>,
        sandbox_id: &str,
    ) -> ExecutionResult {
        if let Err(rejection) = self.validator.validate(code) {
            if rejection.is_security_violation() {
                warn!(reason = %rejection, "Submission rejected");
            } else {
                info!(reason = %rejection, "Submission rejected");
            }
            return ExecutionResult::rejected(sandbox_id, &rejection);
        }

        let _permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(e) => return internal_failure(sandbox_id, None, &e),
        };

        let backend = match AssertUnwindSafe(self.selector.select()).catch_unwind().await {
            Ok(Ok(backend)) => backend,
            Ok(Err(e)) => return internal_failure(sandbox_id, None, &e),
            Err(panic) => return panicked(sandbox_id, None, panic),
        };
        let backend_name = backend.name().to_string();
        Span::current().record("backend", backend_name.as_str());

        let attempt = AssertUnwindSafe(self.run_in_workspace(
            backend.as_ref(),
            code,
            exercise_id,
            sandbox_id,
        ))
        .catch_unwind()
        .await;

        let result = match attempt {
            Ok(Ok(outcome)) => ExecutionResult::from_outcome(
                sandbox_id,
                &backend_name,
                outcome,
                self.config.limits.max_output_bytes,
            ),
            Ok(Err(e)) => internal_failure(sandbox_id, Some(&backend_name), &e),
            Err(panic) => panicked(sandbox_id, Some(&backend_name), panic),
        };

        info!(
            success = result.success,
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            compile_time_ms = result.compile_time_ms,
            run_time_ms = result.run_time_ms,
            "Execution finished"
        );
        result
    }

    /// The workspace lives exactly as long as this future.
    async fn run_in_workspace(
        &self,
        backend: &dyn ExecutionBackend,
        code: &str,
        exercise_id: Option<&str>,
        sandbox_id: &str,
    ) -> Result<BackendOutcome> {
        let workspace = Workspace::create(&self.workspace_root(backend.kind()), sandbox_id).await?;
        let request = ExecutionRequest {
            source: code,
            sandbox_id,
            exercise_id,
            workspace: workspace.path(),
            limits: &self.config.limits,
        };
        backend.compile_and_run(&request).await
    }

    fn workspace_root(&self, kind: BackendKind) -> PathBuf {
        // The fallback runs on dev machines without the tmpfs mount.
        if kind == BackendKind::Subprocess && !self.config.sandbox_root.is_dir() {
            return std::env::temp_dir();
        }
        self.config.sandbox_root.clone()
    }

    /// Run `code` and compare its trimmed stdout with `expected`.
    pub async fn verify_solution(
        &self,
        code: &str,
        expected: &str,
        exercise_id: Option<&str>,
    ) -> Verification {
        let result = self.execute(code, exercise_id).await;
        let output = result.stdout.trim().to_string();
        Verification {
            success: result.success && output == expected.trim(),
            output,
            expected: expected.to_string(),
            error: result.error,
            execution_time_ms: result.execution_time_ms,
            compilation_error: result.compilation_error,
            timed_out: result.timed_out,
            security_violation: result.security_violation,
            sandbox_id: result.sandbox_id,
        }
    }
}

/// One-shot helper: build an executor from `config` and run `code` once.
pub async fn run_code(
    config: SandboxConfig,
    code: &str,
    exercise_id: Option<&str>,
) -> ExecutionResult {
    DisposableExecutor::new(config)
        .execute(code, exercise_id)
        .await
}

/// Short correlation id; never used as a path on its own.
fn new_sandbox_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn internal_failure(sandbox_id: &str, backend: Option<&str>, err: &LearnboxError) -> ExecutionResult {
    if err.is_environmental() {
        warn!(error = %err, "Sandbox unavailable");
    } else {
        error!(error = %err, "Sandbox execution failed");
    }
    ExecutionResult::internal_error(sandbox_id, backend)
}

fn panicked(sandbox_id: &str, backend: Option<&str>, panic: Box<dyn Any + Send>) -> ExecutionResult {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!(panic = %message, "Sandbox panicked");
    ExecutionResult::internal_error(sandbox_id, backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::BackendType;
    use crate::sandbox::result::{FAILURE_EXIT_CODE, INTERNAL_ERROR_MESSAGE};
    use crate::sandbox::traits::BackendCapabilities;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Clone)]
    enum Behavior {
        Return(BackendOutcome),
        Fail,
        Panic,
        Sleep(Duration),
    }

    struct FakeBackend {
        behavior: Behavior,
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        workspaces: Mutex<Vec<PathBuf>>,
    }

    impl FakeBackend {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                workspaces: Mutex::new(Vec::new()),
            })
        }

        fn workspaces(&self) -> Vec<PathBuf> {
            self.workspaces.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExecutionBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Nsjail
        }

        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities::default()
        }

        async fn compile_and_run(&self, request: &ExecutionRequest<'_>) -> Result<BackendOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(request.workspace.is_dir());
            self.workspaces
                .lock()
                .unwrap()
                .push(request.workspace.to_path_buf());

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);

            let outcome = match &self.behavior {
                Behavior::Return(outcome) => Ok(outcome.clone()),
                Behavior::Fail => Err(LearnboxError::SandboxExecution("jail crashed".to_string())),
                Behavior::Panic => panic!("backend bug"),
                Behavior::Sleep(d) => {
                    tokio::time::sleep(*d).await;
                    Ok(hello())
                }
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    struct FakeSelector {
        backend: Option<Arc<FakeBackend>>,
        selections: AtomicUsize,
    }

    #[async_trait]
    impl SelectBackend for FakeSelector {
        async fn select(&self) -> Result<Arc<dyn ExecutionBackend>> {
            self.selections.fetch_add(1, Ordering::SeqCst);
            match &self.backend {
                Some(backend) => Ok(backend.clone()),
                None => Err(LearnboxError::BackendNotAvailable {
                    backend: "nsjail".to_string(),
                    reason: "missing".to_string(),
                }),
            }
        }
    }

    fn hello() -> BackendOutcome {
        BackendOutcome::Completed {
            stdout: "hello\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
            compile_time_ms: 40,
            run_time_ms: 2,
            memory_exceeded: false,
        }
    }

    const HELLO: &str = "fn main() { println!(\"hello\"); }";

    struct Harness {
        root: TempDir,
        selector: Arc<FakeSelector>,
        executor: DisposableExecutor,
    }

    impl Harness {
        fn new(backend: Option<Arc<FakeBackend>>, capacity: usize) -> Self {
            let root = tempfile::tempdir().unwrap();
            let config = SandboxConfig {
                sandbox_root: root.path().to_path_buf(),
                max_concurrent: capacity,
                ..SandboxConfig::default()
            };
            let selector = Arc::new(FakeSelector {
                backend,
                selections: AtomicUsize::new(0),
            });
            let executor = DisposableExecutor::with_selector(Arc::new(config), selector.clone());
            Self {
                root,
                selector,
                executor,
            }
        }

        fn root_is_empty(&self) -> bool {
            is_empty(self.root.path())
        }
    }

    fn is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_rejection_never_selects_or_spawns() {
        let backend = FakeBackend::new(Behavior::Return(hello()));
        let harness = Harness::new(Some(backend.clone()), 2);

        let result = harness
            .executor
            .execute("fn main() { std::process::Command::new(\"ls\"); }", None)
            .await;
        assert!(!result.success);
        assert!(result.security_violation);
        assert!(result.stderr.contains("process execution"));
        assert_eq!(result.exit_code, FAILURE_EXIT_CODE);

        let result = harness.executor.execute("", None).await;
        assert!(!result.success);
        assert!(result.compilation_error);
        assert!(!result.security_violation);

        assert_eq!(harness.selector.selections.load(Ordering::SeqCst), 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert!(harness.root_is_empty());
    }

    #[tokio::test]
    async fn test_oversized_input_never_selects_or_spawns() {
        let backend = FakeBackend::new(Behavior::Return(hello()));
        let harness = Harness::new(Some(backend.clone()), 2);

        let code = format!("fn main() {{}}\n//{}", "a".repeat(70_000));
        let result = harness.executor.execute(&code, None).await;
        assert!(!result.success);
        assert!(result.security_violation);
        assert_eq!(result.exit_code, FAILURE_EXIT_CODE);

        assert_eq!(harness.selector.selections.load(Ordering::SeqCst), 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert!(harness.root_is_empty());
    }

    #[tokio::test]
    async fn test_success_and_workspace_removed() {
        let backend = FakeBackend::new(Behavior::Return(hello()));
        let harness = Harness::new(Some(backend.clone()), 2);

        let result = harness.executor.execute(HELLO, Some("ex-1")).await;
        assert!(result.success);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.backend.as_deref(), Some("nsjail"));
        assert_eq!(result.sandbox_id.len(), 8);

        let workspaces = backend.workspaces();
        assert_eq!(workspaces.len(), 1);
        assert!(workspaces[0].ends_with(&result.sandbox_id));
        assert!(!workspaces[0].exists());
        assert!(harness.root_is_empty());
        assert_eq!(harness.executor.gate().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_fresh_sandbox_per_call() {
        let backend = FakeBackend::new(Behavior::Return(hello()));
        let harness = Harness::new(Some(backend.clone()), 2);

        let first = harness.executor.execute(HELLO, None).await;
        let second = harness.executor.execute(HELLO, None).await;
        assert_ne!(first.sandbox_id, second.sandbox_id);
        assert_eq!(first.success, second.success);
        assert_eq!(first.stdout, second.stdout);
        assert_eq!(harness.selector.selections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_gate() {
        let backend = FakeBackend::new(Behavior::Sleep(Duration::from_millis(50)));
        let harness = Arc::new(Harness::new(Some(backend.clone()), 2));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let harness = harness.clone();
            handles.push(tokio::spawn(async move {
                harness.executor.execute(HELLO, None).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().success);
        }

        assert_eq!(backend.calls.load(Ordering::SeqCst), 6);
        assert!(backend.max_running.load(Ordering::SeqCst) <= 2);
        assert!(harness.root_is_empty());
    }

    #[tokio::test]
    async fn test_backend_panic_becomes_internal_error() {
        let backend = FakeBackend::new(Behavior::Panic);
        let harness = Harness::new(Some(backend.clone()), 1);

        let result = harness.executor.execute(HELLO, None).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some(INTERNAL_ERROR_MESSAGE));
        assert_eq!(result.exit_code, FAILURE_EXIT_CODE);
        assert!(harness.root_is_empty());
        assert_eq!(harness.executor.gate().in_flight(), 0);

        // The gate slot was released, so the next call is admitted.
        let again = tokio::time::timeout(
            Duration::from_secs(1),
            harness.executor.execute(HELLO, None),
        )
        .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_backend_error_is_generic() {
        let backend = FakeBackend::new(Behavior::Fail);
        let harness = Harness::new(Some(backend), 1);

        let result = harness.executor.execute(HELLO, None).await;
        assert_eq!(result.error.as_deref(), Some(INTERNAL_ERROR_MESSAGE));
        assert!(!result.stderr.contains("jail crashed"));
        assert_eq!(result.backend.as_deref(), Some("nsjail"));
        assert!(harness.root_is_empty());
    }

    #[tokio::test]
    async fn test_selection_failure_is_internal_error() {
        let harness = Harness::new(None, 1);
        let result = harness.executor.execute(HELLO, None).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some(INTERNAL_ERROR_MESSAGE));
        assert!(result.backend.is_none());
        assert!(harness.root_is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_execution_cleans_up() {
        let backend = FakeBackend::new(Behavior::Sleep(Duration::from_secs(30)));
        let harness = Harness::new(Some(backend.clone()), 1);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(100),
            harness.executor.execute(HELLO, None),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(harness.root_is_empty());
        assert_eq!(harness.executor.gate().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_output_truncated_then_sanitized() {
        let backend = FakeBackend::new(Behavior::Return(BackendOutcome::Completed {
            stdout: "a".repeat(200_000),
            stderr: format!(
                "thread 'main' panicked at /home/alice/tmpx81/main.rs:3:5\n{}",
                "e".repeat(200_000)
            ),
            exit_code: 101,
            compile_time_ms: 10,
            run_time_ms: 10,
            memory_exceeded: false,
        }));
        let harness = Harness::new(Some(backend), 1);

        let result = harness.executor.execute(HELLO, None).await;
        assert!(!result.success);
        assert_eq!(result.stdout.len(), 65_536);
        // Placeholders may add a few bytes after the cap.
        assert!(result.stderr.len() < 65_600);
        assert!(!result.stderr.contains("alice"));
        assert!(!result.error.unwrap().contains("alice"));
    }

    #[tokio::test]
    async fn test_verify_solution_compares_trimmed_output() {
        let backend = FakeBackend::new(Behavior::Return(hello()));
        let harness = Harness::new(Some(backend), 1);

        let verification = harness
            .executor
            .verify_solution(HELLO, "  hello  ", Some("ex-1"))
            .await;
        assert!(verification.success);
        assert_eq!(verification.output, "hello");
        assert_eq!(verification.expected, "  hello  ");

        let verification = harness.executor.verify_solution(HELLO, "bye", None).await;
        assert!(!verification.success);
    }

    #[tokio::test]
    async fn test_production_refuses_fallback() {
        let root = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            backend: BackendType::Subprocess,
            sandbox_root: root.path().to_path_buf(),
            environment: "production".to_string(),
            debug: true,
            ..SandboxConfig::default()
        };

        let result = run_code(config, HELLO, None).await;
        assert!(!result.success);
        assert!(result.security_violation);
        assert_eq!(
            result.error.as_deref(),
            Some(crate::sandbox::REFUSED_MESSAGE)
        );
        assert!(is_empty(root.path()));
    }

    #[tokio::test]
    async fn test_fallback_uses_temp_dir_without_sandbox_root() {
        let config = SandboxConfig {
            backend: BackendType::Subprocess,
            sandbox_root: PathBuf::from("/nonexistent/learnbox-root"),
            environment: "staging".to_string(),
            ..SandboxConfig::default()
        };

        // Workspace creation succeeds under the temp dir; the backend then
        // refuses because staging without debug is not allowed.
        let result = run_code(config, HELLO, None).await;
        assert!(result.security_violation);
        assert_ne!(result.error.as_deref(), Some(INTERNAL_ERROR_MESSAGE));
    }

    #[tokio::test]
    async fn test_hello_world_with_host_rustc() {
        let rustc = std::process::Command::new("rustc").arg("--version").output();
        if !matches!(rustc, Ok(ref o) if o.status.success()) {
            return;
        }

        let root = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            backend: BackendType::Subprocess,
            sandbox_root: root.path().to_path_buf(),
            environment: "development".to_string(),
            ..SandboxConfig::default()
        };

        let result = run_code(config, HELLO, Some("1")).await;
        assert!(result.success, "{:?}", result.error);
        assert!(result.stdout.contains("hello\n"));
        assert!(!result.compilation_error);
        assert!(!result.timed_out);
        assert_eq!(result.backend.as_deref(), Some("subprocess"));
        assert!(is_empty(root.path()));
    }
}
