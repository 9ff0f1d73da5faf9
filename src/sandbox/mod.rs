mod backends;
mod executor;
mod factory;
mod gate;
mod process;
mod result;
mod sanitize;
mod traits;
mod validator;
mod workspace;

pub use backends::{DockerBackend, NsjailBackend, SubprocessBackend, REFUSED_MESSAGE};
pub use executor::{run_code, DisposableExecutor, Verification};
pub use factory::{available_backends, BackendInfo, EnvironmentSelector, SelectBackend};
pub use gate::{ConcurrencyGate, GatePermit};
pub use result::{ExecutionResult, FAILURE_EXIT_CODE, INTERNAL_ERROR_MESSAGE, TIMEOUT_EXIT_CODE};
pub use sanitize::sanitize;
pub use traits::{
    BackendCapabilities, BackendKind, BackendOutcome, ExecutionBackend, ExecutionRequest, Phase,
};
pub use validator::{CodeValidator, Rejection, ViolationClass};
pub use workspace::Workspace;
