use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnboxConfig {
    pub sandbox: SandboxConfig,
}

/// The isolation backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// nsjail namespace jail (strongest isolation)
    Nsjail,
    /// Docker container sandbox
    Docker,
    /// Plain subprocess in a temp directory (development only)
    Subprocess,
    /// Pick the strongest backend available at call time
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Which backend to use
    pub backend: BackendType,
    /// Root directory holding per-execution workspaces (tmpfs in production)
    pub sandbox_root: PathBuf,
    /// Maximum number of executions running at once
    pub max_concurrent: usize,
    /// Deployment environment name ("production", "development", ...)
    pub environment: String,
    /// Debug flag; allows the subprocess fallback outside "development"
    pub debug: bool,
    /// Size and time limits shared by all backends
    pub limits: ExecutionLimits,
    /// nsjail-specific configuration
    pub nsjail: NsjailConfig,
    /// Docker-specific configuration
    pub docker: DockerConfig,
    /// Subprocess fallback configuration
    pub subprocess: SubprocessConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            sandbox_root: PathBuf::from("/var/sandboxes"),
            max_concurrent: 8,
            environment: "production".to_string(),
            debug: false,
            limits: ExecutionLimits::default(),
            nsjail: NsjailConfig::default(),
            docker: DockerConfig::default(),
            subprocess: SubprocessConfig::default(),
        }
    }
}

impl SandboxConfig {
    /// Whether unsandboxed execution is permitted in this environment.
    ///
    /// Production always refuses. Any other environment needs to be
    /// "development" explicitly or have the debug flag set.
    pub fn allows_unsandboxed(&self) -> bool {
        let env = self.environment.to_lowercase();
        if env == "production" {
            return false;
        }
        env == "development" || self.debug
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Source size ceiling in UTF-8 bytes
    pub max_code_bytes: usize,
    /// Source size ceiling in characters
    pub max_code_chars: usize,
    /// Cap applied to stdout and stderr independently
    pub max_output_bytes: usize,
    /// Compile phase timeout in seconds
    pub compile_timeout_secs: u64,
    /// Run phase timeout in seconds
    pub run_timeout_secs: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_code_bytes: 65_536,
            max_code_chars: 100_000,
            max_output_bytes: 65_536,
            compile_timeout_secs: 12,
            run_timeout_secs: 5,
        }
    }
}

impl ExecutionLimits {
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

/// Resource limits applied to a single jailed invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JailLimits {
    /// Address space in MB
    pub address_space_mb: u64,
    /// CPU time in seconds
    pub cpu_secs: u64,
    /// Largest file the process may write, in MB
    pub file_size_mb: u64,
    /// Open file descriptors
    pub open_files: u64,
    /// Processes/threads
    pub processes: u64,
}

impl Default for JailLimits {
    fn default() -> Self {
        Self::run()
    }
}

impl JailLimits {
    /// rustc needs a large address space and spawns the linker.
    pub fn compile() -> Self {
        Self {
            address_space_mb: 4096,
            cpu_secs: 12,
            file_size_mb: 64,
            open_files: 256,
            processes: 64,
        }
    }

    pub fn run() -> Self {
        Self {
            address_space_mb: 256,
            cpu_secs: 5,
            file_size_mb: 1,
            open_files: 32,
            processes: 4,
        }
    }
}

/// nsjail-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NsjailConfig {
    /// Path to the nsjail binary
    pub binary_path: PathBuf,
    /// Path to the nsjail protobuf config
    pub config_path: PathBuf,
    /// rustc path as seen from inside the jail
    pub rustc_path: String,
    /// Rust edition passed to rustc
    pub edition: String,
    /// Extra seconds granted past a phase timeout before the jail is killed
    pub grace_secs: u64,
    /// Limits for the compile jail
    pub compile_limits: JailLimits,
    /// Limits for the run jail
    pub run_limits: JailLimits,
}

impl Default for NsjailConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("/usr/sbin/nsjail"),
            config_path: PathBuf::from("/etc/nsjail/rust_exec.cfg"),
            rustc_path: "/rust/bin/rustc".to_string(),
            edition: "2021".to_string(),
            grace_secs: 2,
            compile_limits: JailLimits::compile(),
            run_limits: JailLimits::run(),
        }
    }
}

/// Docker-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Sandbox image (must ship the cooperating entrypoint)
    pub image: String,
    /// Build the image from `dockerfile` when it is missing
    pub build_image: bool,
    /// Dockerfile used when building the image
    pub dockerfile: PathBuf,
    /// Memory ceiling in MB (swap is pinned to the same value)
    pub memory_mb: u64,
    /// CPU share
    pub cpus: f32,
    /// Process-count limit
    pub pids_limit: u32,
    /// Size of the writable /tmp tmpfs in MB
    pub tmpfs_mb: u64,
    /// Timeout for the `docker info` availability probe
    pub probe_timeout_secs: u64,
    /// Extra seconds added to the combined compile+run deadline
    pub grace_secs: u64,
    /// Remove the image after each run
    pub remove_image: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "rust-sandbox:latest".to_string(),
            build_image: false,
            dockerfile: PathBuf::from("docker/Dockerfile.sandbox"),
            memory_mb: 64,
            cpus: 0.5,
            pids_limit: 10,
            tmpfs_mb: 128,
            probe_timeout_secs: 5,
            grace_secs: 5,
            remove_image: false,
        }
    }
}

/// Subprocess fallback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubprocessConfig {
    /// rustc binary (looked up on PATH when not absolute)
    pub rustc_path: PathBuf,
    /// Rust edition passed to rustc
    pub edition: String,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            rustc_path: PathBuf::from("rustc"),
            edition: "2021".to_string(),
        }
    }
}
