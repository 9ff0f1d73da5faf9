use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::types::{JailLimits, NsjailConfig};
use crate::error::{LearnboxError, Result};
use crate::sandbox::process::{run_captured, ProcessOutput};
use crate::sandbox::traits::{
    BackendCapabilities, BackendKind, BackendOutcome, ExecutionBackend, ExecutionRequest, Phase,
};

/// Where the jail sees its inputs and outputs
const JAIL_HOME: &str = "/home/user";

const SIGKILL: i32 = 9;
const SIGXCPU: i32 = 24;

/// nsjail namespace-jail backend.
///
/// Compiles in one fresh jail and runs the binary in a second, independent
/// jail, so a compromised compiler cannot reach the run phase. Each phase
/// gets its own timeout and rlimits.
pub struct NsjailBackend {
    config: NsjailConfig,
}

impl NsjailBackend {
    pub fn new(config: NsjailConfig) -> Result<Self> {
        if !Self::is_available(&config) {
            return Err(LearnboxError::BackendNotAvailable {
                backend: "nsjail".to_string(),
                reason: format!(
                    "expected nsjail binary at {} and config at {}",
                    config.binary_path.display(),
                    config.config_path.display()
                ),
            });
        }
        Ok(Self { config })
    }

    /// Both the binary and its config file must exist.
    pub fn is_available(config: &NsjailConfig) -> bool {
        config.binary_path.is_file() && config.config_path.is_file()
    }

    /// Arguments for one jailed invocation.
    fn jail_args(
        &self,
        limits: &JailLimits,
        time_limit: Duration,
        mounts: &[Mount<'_>],
        command: &[OsString],
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--config".into(),
            self.config.config_path.clone().into_os_string(),
            "--quiet".into(),
            "--time_limit".into(),
            time_limit.as_secs().to_string().into(),
            "--rlimit_as".into(),
            limits.address_space_mb.to_string().into(),
            "--rlimit_cpu".into(),
            limits.cpu_secs.to_string().into(),
            "--rlimit_fsize".into(),
            limits.file_size_mb.to_string().into(),
            "--rlimit_nofile".into(),
            limits.open_files.to_string().into(),
            "--rlimit_nproc".into(),
            limits.processes.to_string().into(),
        ];

        for mount in mounts {
            let flag = if mount.writable {
                "--bindmount"
            } else {
                "--bindmount_ro"
            };
            let mut spec = mount.host.as_os_str().to_os_string();
            spec.push(":");
            spec.push(mount.jail);
            args.push(flag.into());
            args.push(spec);
        }

        args.push("--".into());
        args.extend(command.iter().cloned());
        args
    }

    fn compile_command(&self) -> Vec<OsString> {
        vec![
            self.config.rustc_path.clone().into(),
            format!("{}/main.rs", JAIL_HOME).into(),
            "-o".into(),
            format!("{}/out/main", JAIL_HOME).into(),
            "--edition".into(),
            self.config.edition.clone().into(),
            "-C".into(),
            "opt-level=0".into(),
        ]
    }

    /// Run one fresh jail, killing it `grace_secs` past `timeout`.
    async fn jailed(
        &self,
        limits: &JailLimits,
        timeout: Duration,
        mounts: &[Mount<'_>],
        command: &[OsString],
        capture_cap: usize,
    ) -> Result<ProcessOutput> {
        let mut cmd = Command::new(&self.config.binary_path);
        cmd.args(self.jail_args(limits, timeout, mounts, command));

        let deadline = timeout + Duration::from_secs(self.config.grace_secs);
        let mut output = run_captured(cmd, deadline, capture_cap)
            .await
            .map_err(|e| LearnboxError::SandboxExecution(format!("Failed to spawn nsjail: {}", e)))?;

        // nsjail enforces the time limit itself and reports the kill
        // through the exit status.
        if !output.timed_out && killed_by_limit(&output, timeout) {
            output.timed_out = true;
            output.exit_code = crate::sandbox::result::TIMEOUT_EXIT_CODE;
        }
        Ok(output)
    }
}

/// A bind mount into the jail.
struct Mount<'a> {
    host: &'a Path,
    jail: &'a str,
    writable: bool,
}

/// nsjail exits with 128+N when the jailed child dies by signal N.
fn died_by(output: &ProcessOutput, signal: i32) -> bool {
    output.exit_code == 128 + signal || output.signal == Some(signal)
}

/// `--time_limit` and the hard `--rlimit_cpu` both end in SIGKILL/SIGXCPU.
fn killed_by_limit(output: &ProcessOutput, timeout: Duration) -> bool {
    (died_by(output, SIGKILL) && output.elapsed >= timeout) || died_by(output, SIGXCPU)
}

/// A SIGKILL before the time limit, or a failed allocation under `--rlimit_as`.
fn hit_memory_limit(output: &ProcessOutput, timeout: Duration) -> bool {
    (died_by(output, SIGKILL) && output.elapsed < timeout)
        || output.stderr.contains("memory allocation of")
}

#[async_trait]
impl ExecutionBackend for NsjailBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Nsjail
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            namespaces: true,
            network_isolated: true,
            resource_limits: true,
            split_phases: true,
        }
    }

    async fn compile_and_run(&self, request: &ExecutionRequest<'_>) -> Result<BackendOutcome> {
        let source_path = request.workspace.join("main.rs");
        let out_dir = request.workspace.join("out");
        let binary_path = out_dir.join("main");
        tokio::fs::write(&source_path, request.source).await?;
        tokio::fs::create_dir_all(&out_dir).await?;

        let cap = request.limits.max_output_bytes;
        let compile_timeout = request.limits.compile_timeout();
        let run_timeout = request.limits.run_timeout();

        // Phase 1: compile inside a fresh jail
        debug!(sandbox_id = %request.sandbox_id, "Compiling in nsjail");
        let jail_source = format!("{}/main.rs", JAIL_HOME);
        let jail_out = format!("{}/out", JAIL_HOME);
        let compile = self
            .jailed(
                &self.config.compile_limits,
                compile_timeout,
                &[
                    Mount {
                        host: &source_path,
                        jail: &jail_source,
                        writable: false,
                    },
                    Mount {
                        host: &out_dir,
                        jail: &jail_out,
                        writable: true,
                    },
                ],
                &self.compile_command(),
                cap,
            )
            .await?;
        let compile_time_ms = compile.elapsed_ms();

        if compile.timed_out {
            warn!(sandbox_id = %request.sandbox_id, "Compile jail timed out");
            return Ok(BackendOutcome::TimedOut {
                phase: Phase::Compile,
                limit_secs: compile_timeout.as_secs(),
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

        if !binary_path.is_file() {
            return Err(LearnboxError::SandboxExecution(
                "compile jail exited cleanly but produced no binary".to_string(),
            ));
        }

        // Phase 2: run the binary inside a second, independent jail
        debug!(sandbox_id = %request.sandbox_id, "Running in nsjail");
        let jail_binary = format!("{}/main", JAIL_HOME);
        let run = self
            .jailed(
                &self.config.run_limits,
                run_timeout,
                &[Mount {
                    host: &binary_path,
                    jail: &jail_binary,
                    writable: false,
                }],
                &[jail_binary.clone().into()],
                cap,
            )
            .await?;
        let run_time_ms = run.elapsed_ms();

        if run.timed_out {
            info!(sandbox_id = %request.sandbox_id, "Run jail timed out");
            return Ok(BackendOutcome::TimedOut {
                phase: Phase::Run,
                limit_secs: run_timeout.as_secs(),
                stdout: run.stdout,
                compile_time_ms,
                run_time_ms,
            });
        }

        let memory_exceeded = hit_memory_limit(&run, run_timeout);
        Ok(BackendOutcome::Completed {
            stdout: run.stdout,
            stderr: run.stderr,
            exit_code: run.exit_code,
            compile_time_ms,
            run_time_ms,
            memory_exceeded,
        })
    }
}
