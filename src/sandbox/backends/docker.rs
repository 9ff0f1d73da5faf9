use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::types::{DockerConfig, ExecutionLimits};
use crate::error::{LearnboxError, Result};
use crate::sandbox::process::{run_captured, ProcessOutput};
use crate::sandbox::traits::{
    BackendCapabilities, BackendKind, BackendOutcome, ExecutionBackend, ExecutionRequest, Phase,
};

/// Printed to stderr by the image entrypoint when rustc fails
pub const COMPILATION_FAILED_MARKER: &str = "COMPILATION_FAILED";

/// Printed to stderr by the image entrypoint when the program hits its timeout
pub const EXECUTION_TIMEOUT_MARKER: &str = "EXECUTION_TIMEOUT";

/// Exit code docker reports for containers killed by the OOM killer
const OOM_EXIT_CODE: i32 = 137;

/// Docker sandbox backend.
///
/// Every execution runs in a fresh `docker run --rm` container with no
/// network, a read-only root, memory/CPU/pid caps and all capabilities
/// dropped. The image's entrypoint compiles `/sandbox/main.rs` and runs it,
/// reporting compile failures and timeouts through marker lines on stderr.
pub struct DockerBackend {
    config: DockerConfig,
}

impl DockerBackend {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    /// Check whether a Docker daemon is installed and responsive.
    ///
    /// The probe is bounded by `probe_timeout`; a hung daemon counts as
    /// unavailable.
    pub async fn is_available(probe_timeout: Duration) -> bool {
        let mut cmd = Command::new("docker");
        cmd.arg("info")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(probe_timeout, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(_)) => false,
            Err(_) => {
                debug!("docker info probe timed out");
                false
            }
        }
    }

    /// Check if a Docker image exists locally.
    async fn image_exists(image: &str) -> bool {
        match Command::new("docker")
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    /// Build the sandbox image from the configured Dockerfile.
    async fn build_image(&self) -> Result<()> {
        let dockerfile = &self.config.dockerfile;
        if !dockerfile.is_file() {
            return Err(LearnboxError::SandboxInit(format!(
                "Dockerfile not found at {}. Build the image manually with: docker build -t {} -f {} .",
                dockerfile.display(),
                self.config.image,
                dockerfile.display()
            )));
        }

        // Build context is the directory holding the Dockerfile
        let context = dockerfile.parent().unwrap_or_else(|| Path::new("."));

        info!(image = %self.config.image, "Building Docker sandbox image...");
        let output = Command::new("docker")
            .arg("build")
            .args(["-t", &self.config.image])
            .arg("-f")
            .arg(dockerfile)
            .arg(context)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LearnboxError::SandboxInit(format!("Failed to run docker build: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LearnboxError::SandboxInit(format!(
                "Failed to build Docker image: {}",
                stderr
            )));
        }

        info!(image = %self.config.image, "Docker sandbox image built successfully");
        Ok(())
    }

    /// Make sure the image is present, building it when allowed.
    async fn ensure_image(&self) -> Result<()> {
        if Self::image_exists(&self.config.image).await {
            return Ok(());
        }
        if self.config.build_image {
            return self.build_image().await;
        }
        Err(LearnboxError::BackendNotAvailable {
            backend: "docker".to_string(),
            reason: format!(
                "Docker image '{}' not found. Set docker.build_image = true to auto-build",
                self.config.image
            ),
        })
    }

    /// Arguments for `docker run`.
    fn run_args(
        &self,
        container_name: &str,
        request: &ExecutionRequest<'_>,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            container_name.into(),
            "--label".into(),
            format!("learnbox.sandbox={}", request.sandbox_id).into(),
        ];

        if let Some(exercise) = request.exercise_id {
            args.push("--label".into());
            args.push(format!("learnbox.exercise={}", exercise).into());
        }

        args.extend(
            [
                "--network=none".to_string(),
                "--read-only".to_string(),
                "--tmpfs".to_string(),
                format!("/tmp:rw,exec,nosuid,size={}m", self.config.tmpfs_mb),
                format!("--memory={}m", self.config.memory_mb),
                format!("--memory-swap={}m", self.config.memory_mb),
                format!("--cpus={}", self.config.cpus),
                format!("--pids-limit={}", self.config.pids_limit),
                "--security-opt=no-new-privileges:true".to_string(),
                "--cap-drop=ALL".to_string(),
                "-e".to_string(),
                format!("RUN_TIMEOUT={}", request.limits.run_timeout_secs),
                "-v".to_string(),
            ]
            .into_iter()
            .map(OsString::from),
        );

        let mut volume = request.workspace.as_os_str().to_os_string();
        volume.push(":/sandbox:ro");
        args.push(volume);
        args.push(self.config.image.clone().into());
        args
    }

    /// Deadline spanning image preparation, compile and run.
    fn combined_deadline(&self, limits: &ExecutionLimits) -> Duration {
        limits.compile_timeout() + limits.run_timeout() + Duration::from_secs(self.config.grace_secs)
    }

    /// Remove the container (and optionally the image). Failures are only logged.
    async fn cleanup(&self, container_name: &str) {
        match Command::new("docker")
            .args(["rm", "-f", container_name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) if !status.success() => {
                debug!(container = %container_name, "Container already gone");
            }
            Err(e) => debug!(container = %container_name, error = %e, "docker rm failed"),
            Ok(_) => {}
        }

        if self.config.remove_image {
            if let Err(e) = Command::new("docker")
                .args(["rmi", &self.config.image])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
            {
                debug!(image = %self.config.image, error = %e, "docker rmi failed");
            }
        }
    }

    async fn ensure_and_run(
        &self,
        container_name: &str,
        request: &ExecutionRequest<'_>,
        deadline: Duration,
    ) -> Result<ProcessOutput> {
        self.ensure_image().await?;

        let mut cmd = Command::new("docker");
        cmd.args(self.run_args(container_name, request));
        run_captured(cmd, deadline, request.limits.max_output_bytes)
            .await
            .map_err(|e| LearnboxError::SandboxExecution(format!("Failed to execute docker run: {}", e)))
    }
}

fn strip_marker(stderr: &str, marker: &str) -> String {
    stderr
        .lines()
        .filter(|line| line.trim() != marker)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Turn a finished `docker run` into an outcome using the entrypoint markers.
fn classify(output: ProcessOutput, run_timeout_secs: u64) -> BackendOutcome {
    let elapsed_ms = output.elapsed_ms();

    if output.stderr.contains(COMPILATION_FAILED_MARKER) {
        return BackendOutcome::CompileFailed {
            stderr: strip_marker(&output.stderr, COMPILATION_FAILED_MARKER),
            exit_code: output.exit_code,
            compile_time_ms: elapsed_ms,
        };
    }

    if output.stderr.contains(EXECUTION_TIMEOUT_MARKER) {
        return BackendOutcome::TimedOut {
            phase: Phase::Run,
            limit_secs: run_timeout_secs,
            stdout: output.stdout.trim().to_string(),
            compile_time_ms: 0,
            run_time_ms: elapsed_ms,
        };
    }

    BackendOutcome::Completed {
        memory_exceeded: output.exit_code == OOM_EXIT_CODE,
        stdout: output.stdout.trim().to_string(),
        stderr: output.stderr.trim().to_string(),
        exit_code: output.exit_code,
        compile_time_ms: 0,
        run_time_ms: elapsed_ms,
    }
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            namespaces: true,
            network_isolated: true,
            resource_limits: true,
            split_phases: false,
        }
    }

    async fn compile_and_run(&self, request: &ExecutionRequest<'_>) -> Result<BackendOutcome> {
        tokio::fs::write(request.workspace.join("main.rs"), request.source).await?;

        let container_name = format!("learnbox-{}", request.sandbox_id);
        let deadline = self.combined_deadline(request.limits);
        let started = Instant::now();
        debug!(container = %container_name, deadline_secs = deadline.as_secs(), "Starting container");

        let outcome = match tokio::time::timeout(
            deadline,
            self.ensure_and_run(&container_name, request, deadline),
        )
        .await
        {
            Ok(Ok(output)) if output.timed_out => {
                warn!(container = %container_name, "Container run timed out");
                Ok(BackendOutcome::TimedOut {
                    phase: Phase::Combined,
                    limit_secs: deadline.as_secs(),
                    stdout: String::new(),
                    compile_time_ms: 0,
                    run_time_ms: output.elapsed_ms(),
                })
            }
            Ok(Ok(output)) => Ok(classify(output, request.limits.run_timeout_secs)),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(container = %container_name, "Image preparation exhausted the deadline");
                Ok(BackendOutcome::TimedOut {
                    phase: Phase::Combined,
                    limit_secs: deadline.as_secs(),
                    stdout: String::new(),
                    compile_time_ms: 0,
                    run_time_ms: started.elapsed().as_millis() as u64,
                })
            }
        };

        // Killing the docker client does not stop the container.
        self.cleanup(&container_name).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn output(stdout: &str, stderr: &str, exit_code: i32) -> ProcessOutput {
        ProcessOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
            signal: None,
            timed_out: false,
            elapsed: Duration::from_millis(900),
        }
    }

    #[test]
    fn test_run_args_harden_container() {
        let backend = DockerBackend::new(DockerConfig::default());
        let limits = ExecutionLimits::default();
        let workspace = PathBuf::from("/var/sandboxes/ab12cd34");
        let request = ExecutionRequest {
            source: "fn main() {}",
            sandbox_id: "ab12cd34",
            exercise_id: Some("ex-7"),
            workspace: &workspace,
            limits: &limits,
        };

        let args: Vec<String> = backend
            .run_args("learnbox-ab12cd34", &request)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        for expected in [
            "--rm",
            "--network=none",
            "--read-only",
            "--memory=64m",
            "--memory-swap=64m",
            "--cpus=0.5",
            "--pids-limit=10",
            "--security-opt=no-new-privileges:true",
            "--cap-drop=ALL",
            "learnbox.exercise=ex-7",
            "RUN_TIMEOUT=5",
            "/var/sandboxes/ab12cd34:/sandbox:ro",
        ] {
            assert!(args.contains(&expected.to_string()), "missing {expected}");
        }
        assert_eq!(args.last().unwrap(), "rust-sandbox:latest");
    }

    #[test]
    fn test_combined_deadline() {
        let backend = DockerBackend::new(DockerConfig::default());
        assert_eq!(
            backend.combined_deadline(&ExecutionLimits::default()),
            Duration::from_secs(12 + 5 + 5)
        );
    }

    #[test]
    fn test_classify_compile_failure() {
        let outcome = classify(
            output("", "error[E0308]: mismatched types\nCOMPILATION_FAILED\n", 1),
            5,
        );
        match outcome {
            BackendOutcome::CompileFailed { stderr, exit_code, .. } => {
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "error[E0308]: mismatched types");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_timeout_marker() {
        let outcome = classify(output("partial", "EXECUTION_TIMEOUT\n", 124), 5);
        match outcome {
            BackendOutcome::TimedOut {
                phase, limit_secs, ..
            } => {
                assert_eq!(phase, Phase::Run);
                assert_eq!(limit_secs, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_success_trims_output() {
        let outcome = classify(output("hello\n", "", 0), 5);
        assert_eq!(
            outcome,
            BackendOutcome::Completed {
                stdout: "hello".to_string(),
                stderr: String::new(),
                exit_code: 0,
                compile_time_ms: 0,
                run_time_ms: 900,
                memory_exceeded: false,
            }
        );
    }

    #[test]
    fn test_classify_oom() {
        let outcome = classify(output("", "", 137), 5);
        assert!(matches!(
            outcome,
            BackendOutcome::Completed {
                memory_exceeded: true,
                ..
            }
        ));
    }
}
