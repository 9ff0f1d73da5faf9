use std::io;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error};

use crate::config::types::SubprocessConfig;
use crate::error::{LearnboxError, Result};
use crate::sandbox::process::run_captured;
use crate::sandbox::result::FAILURE_EXIT_CODE;
use crate::sandbox::traits::{
    BackendCapabilities, BackendKind, BackendOutcome, ExecutionBackend, ExecutionRequest, Phase,
};

/// Returned instead of running anything when unsandboxed execution is off.
pub const REFUSED_MESSAGE: &str = "Sandbox not available. Code execution disabled in production.";

const RUSTC_NOT_FOUND: &str = "Rust compiler (rustc) not found";

/// Bare subprocess backend.
///
/// Provides no isolation beyond a scratch directory and process-group
/// kills. Only usable outside production.
pub struct SubprocessBackend {
    config: SubprocessConfig,
    allowed: bool,
}

impl SubprocessBackend {
    /// `allowed` comes from [`SandboxConfig::allows_unsandboxed`].
    ///
    /// [`SandboxConfig::allows_unsandboxed`]: crate::config::types::SandboxConfig::allows_unsandboxed
    pub fn new(config: SubprocessConfig, allowed: bool) -> Self {
        Self { config, allowed }
    }
}

#[async_trait]
impl ExecutionBackend for SubprocessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Subprocess
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    async fn compile_and_run(&self, request: &ExecutionRequest<'_>) -> Result<BackendOutcome> {
        if !self.allowed {
            error!(
                sandbox_id = %request.sandbox_id,
                "No sandbox available and unsandboxed execution is disabled"
            );
            return Ok(BackendOutcome::Refused {
                reason: REFUSED_MESSAGE.to_string(),
            });
        }

        let scratch = tempfile::Builder::new()
            .prefix("tmp")
            .tempdir_in(request.workspace)
            .map_err(|source| LearnboxError::Workspace {
                path: request.workspace.display().to_string(),
                source,
            })?;
        let source_path = scratch.path().join("main.rs");
        let binary_path = scratch.path().join("main");
        tokio::fs::write(&source_path, request.source).await?;

        let cap = request.limits.max_output_bytes;

        let mut rustc = Command::new(&self.config.rustc_path);
        rustc
            .arg(&source_path)
            .arg("-o")
            .arg(&binary_path)
            .args(["--edition", &self.config.edition])
            .current_dir(scratch.path());

        debug!(sandbox_id = %request.sandbox_id, "Compiling with host rustc");
        let compile = match run_captured(rustc, request.limits.compile_timeout(), cap).await {
            Ok(output) => output,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(BackendOutcome::CompileFailed {
                    stderr: RUSTC_NOT_FOUND.to_string(),
                    exit_code: FAILURE_EXIT_CODE,
                    compile_time_ms: 0,
                });
            }
            Err(e) => {
                return Err(LearnboxError::SandboxExecution(format!(
                    "Failed to spawn rustc: {}",
                    e
                )))
            }
        };
        let compile_time_ms = compile.elapsed_ms();

        if compile.timed_out {
            return Ok(BackendOutcome::TimedOut {
                phase: Phase::Compile,
                limit_secs: request.limits.compile_timeout_secs,
                stdout: String::new(),
                compile_time_ms,
                run_time_ms: 0,
            });
        }
        if compile.exit_code != 0 {
            return Ok(BackendOutcome::CompileFailed {
                stderr: compile.stderr,
                exit_code: compile.exit_code,
                compile_time_ms,
            });
        }

        let mut program = Command::new(&binary_path);
        program.current_dir(scratch.path()).env_clear();

        debug!(sandbox_id = %request.sandbox_id, "Running compiled program");
        let run = run_captured(program, request.limits.run_timeout(), cap)
            .await
            .map_err(|e| LearnboxError::SandboxExecution(format!("Failed to spawn program: {}", e)))?;

        if run.timed_out {
            return Ok(BackendOutcome::TimedOut {
                phase: Phase::Run,
                limit_secs: request.limits.run_timeout_secs,
                run_time_ms: run.elapsed_ms(),
                stdout: run.stdout,
                compile_time_ms,
            });
        }

        Ok(BackendOutcome::Completed {
            run_time_ms: run.elapsed_ms(),
            stdout: run.stdout,
            stderr: run.stderr,
            exit_code: run.exit_code,
            compile_time_ms,
            memory_exceeded: false,
        })
    }
}
