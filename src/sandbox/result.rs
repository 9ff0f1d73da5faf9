use serde::{Deserialize, Serialize};

use crate::sandbox::sanitize::{sanitize, truncate_utf8};
use crate::sandbox::traits::{BackendOutcome, Phase};
use crate::sandbox::validator::Rejection;

/// Exit code reported for any phase that hit its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported for validation and internal failures.
pub const FAILURE_EXIT_CODE: i32 = 1;

/// Message returned for unexpected sandbox failures; details only go to logs.
pub const INTERNAL_ERROR_MESSAGE: &str = "Sandbox execution failed";

/// Result of one `execute()` call. This is the only value that crosses the
/// engine boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub compile_time_ms: u64,
    pub run_time_ms: u64,
    pub exit_code: i32,
    pub sandbox_id: String,
    /// Backend that ran the program; `None` when rejected before selection
    pub backend: Option<String>,

    // Compatibility projection
    pub output: String,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub compilation_error: bool,
    pub timed_out: bool,
    pub memory_exceeded: bool,
    pub security_violation: bool,
}

impl ExecutionResult {
    fn failure(sandbox_id: &str, message: String, exit_code: i32) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: message.clone(),
            compile_time_ms: 0,
            run_time_ms: 0,
            exit_code,
            sandbox_id: sandbox_id.to_string(),
            backend: None,
            output: String::new(),
            error: Some(message),
            execution_time_ms: 0,
            compilation_error: false,
            timed_out: false,
            memory_exceeded: false,
            security_violation: false,
        }
    }

    /// Submission turned away by the validator.
    pub fn rejected(sandbox_id: &str, rejection: &Rejection) -> Self {
        let mut result = Self::failure(sandbox_id, rejection.to_string(), FAILURE_EXIT_CODE);
        result.security_violation = rejection.is_security_violation();
        result.compilation_error = !rejection.is_security_violation();
        result
    }

    /// Any unexpected failure inside the sandbox machinery.
    pub fn internal_error(sandbox_id: &str, backend: Option<&str>) -> Self {
        let mut result = Self::failure(
            sandbox_id,
            INTERNAL_ERROR_MESSAGE.to_string(),
            FAILURE_EXIT_CODE,
        );
        result.backend = backend.map(str::to_string);
        result
    }

    /// Build the public result from a backend outcome.
    ///
    /// Output is truncated to `output_cap` first, then diagnostics are
    /// sanitized. stdout is never sanitized.
    pub fn from_outcome(
        sandbox_id: &str,
        backend: &str,
        outcome: BackendOutcome,
        output_cap: usize,
    ) -> Self {
        let clean = |mut text: String| {
            truncate_utf8(&mut text, output_cap);
            sanitize(&text)
        };
        let capped = |mut text: String| {
            truncate_utf8(&mut text, output_cap);
            text
        };

        let mut result = match outcome {
            BackendOutcome::Refused { reason } => {
                let mut result = Self::failure(sandbox_id, reason, FAILURE_EXIT_CODE);
                result.security_violation = true;
                result
            }

            BackendOutcome::CompileFailed {
                stderr,
                exit_code,
                compile_time_ms,
            } => {
                let stderr = clean(stderr);
                Self {
                    success: false,
                    stdout: String::new(),
                    error: Some(format!("Compilation error:\n{}", stderr)),
                    stderr,
                    compile_time_ms,
                    run_time_ms: 0,
                    exit_code,
                    sandbox_id: sandbox_id.to_string(),
                    backend: None,
                    output: String::new(),
                    execution_time_ms: compile_time_ms,
                    compilation_error: true,
                    timed_out: false,
                    memory_exceeded: false,
                    security_violation: false,
                }
            }

            BackendOutcome::TimedOut {
                phase,
                limit_secs,
                stdout,
                compile_time_ms,
                run_time_ms,
            } => {
                let message = match phase {
                    Phase::Compile => format!("Compilation timed out after {}s", limit_secs),
                    Phase::Run => format!("Execution timed out after {}s", limit_secs),
                    Phase::Combined => "Execution timed out (sandbox)".to_string(),
                };
                let stdout = capped(stdout);
                Self {
                    success: false,
                    output: stdout.clone(),
                    stdout,
                    stderr: message.clone(),
                    compile_time_ms,
                    run_time_ms,
                    exit_code: TIMEOUT_EXIT_CODE,
                    sandbox_id: sandbox_id.to_string(),
                    backend: None,
                    error: Some(message),
                    execution_time_ms: compile_time_ms + run_time_ms,
                    compilation_error: phase == Phase::Compile,
                    timed_out: true,
                    memory_exceeded: false,
                    security_violation: false,
                }
            }

            BackendOutcome::Completed {
                stdout,
                stderr,
                exit_code,
                compile_time_ms,
                run_time_ms,
                memory_exceeded,
            } => {
                let stdout = capped(stdout);
                let stderr = clean(stderr);
                let error = if exit_code != 0 {
                    Some(format!(
                        "Runtime error (exit code {}):\n{}",
                        exit_code, stderr
                    ))
                } else if stderr.is_empty() {
                    None
                } else {
                    Some(stderr.clone())
                };
                Self {
                    success: exit_code == 0,
                    output: stdout.clone(),
                    stdout,
                    stderr,
                    compile_time_ms,
                    run_time_ms,
                    exit_code,
                    sandbox_id: sandbox_id.to_string(),
                    backend: None,
                    error,
                    execution_time_ms: compile_time_ms + run_time_ms,
                    compilation_error: false,
                    timed_out: false,
                    memory_exceeded,
                    security_violation: false,
                }
            }
        };

        result.backend = Some(backend.to_string());
        result
    }
}
