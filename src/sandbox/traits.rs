use std::fmt;
use std::path::Path;

use async_trait::async_trait;

use crate::config::types::ExecutionLimits;
use crate::error::Result;

/// Identifies one of the three isolation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Nsjail,
    Docker,
    Subprocess,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nsjail => "nsjail",
            Self::Docker => "docker",
            Self::Subprocess => "subprocess",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability flags describing the isolation a backend provides
#[derive(Debug, Clone, Default)]
pub struct BackendCapabilities {
    /// Runs in fresh kernel namespaces
    pub namespaces: bool,
    /// Network is unreachable from the program
    pub network_isolated: bool,
    /// Memory/CPU/process limits are enforced by the kernel
    pub resource_limits: bool,
    /// Compile and run happen in separate isolation instances
    pub split_phases: bool,
}

/// Execution phase a timeout belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Compile,
    Run,
    /// Backends with one deadline spanning both phases
    Combined,
}

/// What a backend observed while compiling and running one program.
///
/// Unexpected failures of the backend itself are reported through
/// `Err(LearnboxError)` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOutcome {
    /// Compilation finished with a non-zero status
    CompileFailed {
        stderr: String,
        exit_code: i32,
        compile_time_ms: u64,
    },
    /// The program ran to completion (any exit status)
    Completed {
        stdout: String,
        stderr: String,
        exit_code: i32,
        compile_time_ms: u64,
        run_time_ms: u64,
        memory_exceeded: bool,
    },
    /// A phase exceeded its deadline and was killed
    TimedOut {
        phase: Phase,
        limit_secs: u64,
        stdout: String,
        compile_time_ms: u64,
        run_time_ms: u64,
    },
    /// The backend refused to run anything in this environment
    Refused { reason: String },
}

/// Everything a backend needs for one execution.
#[derive(Debug)]
pub struct ExecutionRequest<'a> {
    pub source: &'a str,
    pub sandbox_id: &'a str,
    /// Opaque label; never used for control flow
    pub exercise_id: Option<&'a str>,
    /// Per-call ephemeral directory, removed by the executor afterwards
    pub workspace: &'a Path,
    pub limits: &'a ExecutionLimits,
}

/// Trait for isolation backends.
///
/// A backend compiles and runs one program per call and holds no state
/// between calls.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Which strategy this is
    fn kind(&self) -> BackendKind;

    /// Returns the backend name (e.g., "nsjail", "docker")
    fn name(&self) -> &str {
        self.kind().as_str()
    }

    /// Returns the isolation this backend provides
    fn capabilities(&self) -> BackendCapabilities;

    /// Compile `request.source` and run the resulting binary.
    async fn compile_and_run(&self, request: &ExecutionRequest<'_>) -> Result<BackendOutcome>;
}
