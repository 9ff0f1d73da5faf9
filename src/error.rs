use thiserror::Error;

#[derive(Error, Debug)]
pub enum LearnboxError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Backend errors
    #[error("Backend '{backend}' is not available: {reason}")]
    BackendNotAvailable { backend: String, reason: String },

    #[error("Sandbox initialization failed: {0}")]
    SandboxInit(String),

    #[error("Command execution failed in sandbox: {0}")]
    SandboxExecution(String),

    #[error("Workspace error at {path}: {source}")]
    Workspace {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Concurrency gate closed")]
    GateClosed,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LearnboxError {
    /// Errors caused by the host environment rather than by the submitted code.
    pub fn is_environmental(&self) -> bool {
        matches!(
            self,
            Self::BackendNotAvailable { .. } | Self::SandboxInit(_) | Self::Workspace { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LearnboxError>;
