use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::types::{BackendType, SandboxConfig};
use crate::error::{LearnboxError, Result};
use crate::sandbox::backends::{DockerBackend, NsjailBackend, SubprocessBackend};
use crate::sandbox::traits::{BackendKind, ExecutionBackend};

/// Picks the backend for one execution.
///
/// Called once per `execute()`; implementations must not cache a choice
/// across calls.
#[async_trait]
pub trait SelectBackend: Send + Sync {
    async fn select(&self) -> Result<Arc<dyn ExecutionBackend>>;
}

/// Selects the strongest backend the host offers right now.
pub struct EnvironmentSelector {
    config: Arc<SandboxConfig>,
}

impl EnvironmentSelector {
    pub fn new(config: Arc<SandboxConfig>) -> Self {
        Self { config }
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.config.docker.probe_timeout_secs)
    }

    /// Resolve the configured backend type, handling Auto selection.
    pub async fn resolve_backend_type(&self) -> Result<BackendKind> {
        match self.config.backend {
            BackendType::Auto => {
                // Priority: nsjail > Docker > bare subprocess
                if NsjailBackend::is_available(&self.config.nsjail) {
                    debug!("nsjail available");
                    return Ok(BackendKind::Nsjail);
                }

                if DockerBackend::is_available(self.probe_timeout()).await {
                    warn!("nsjail not available, falling back to Docker sandbox");
                    return Ok(BackendKind::Docker);
                }

                warn!(
                    environment = %self.config.environment,
                    "NO SANDBOX AVAILABLE: neither nsjail nor Docker found, falling back to an unsandboxed subprocess"
                );
                Ok(BackendKind::Subprocess)
            }
            BackendType::Nsjail => {
                if !NsjailBackend::is_available(&self.config.nsjail) {
                    return Err(LearnboxError::BackendNotAvailable {
                        backend: "nsjail".to_string(),
                        reason: format!(
                            "expected nsjail binary at {} and config at {}",
                            self.config.nsjail.binary_path.display(),
                            self.config.nsjail.config_path.display()
                        ),
                    });
                }
                Ok(BackendKind::Nsjail)
            }
            BackendType::Docker => {
                if !DockerBackend::is_available(self.probe_timeout()).await {
                    return Err(LearnboxError::BackendNotAvailable {
                        backend: "docker".to_string(),
                        reason: "Docker daemon is not accessible. Ensure Docker is installed and running."
                            .to_string(),
                    });
                }
                Ok(BackendKind::Docker)
            }
            BackendType::Subprocess => Ok(BackendKind::Subprocess),
        }
    }

    /// Instantiate a backend of the given kind.
    pub fn create_backend(&self, kind: BackendKind) -> Result<Arc<dyn ExecutionBackend>> {
        let backend: Arc<dyn ExecutionBackend> = match kind {
            BackendKind::Nsjail => Arc::new(NsjailBackend::new(self.config.nsjail.clone())?),
            BackendKind::Docker => Arc::new(DockerBackend::new(self.config.docker.clone())),
            BackendKind::Subprocess => Arc::new(SubprocessBackend::new(
                self.config.subprocess.clone(),
                self.config.allows_unsandboxed(),
            )),
        };
        Ok(backend)
    }
}

#[async_trait]
impl SelectBackend for EnvironmentSelector {
    async fn select(&self) -> Result<Arc<dyn ExecutionBackend>> {
        let kind = self.resolve_backend_type().await?;
        self.create_backend(kind)
    }
}

/// Information about a sandbox backend.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    pub name: &'static str,
    pub available: bool,
    pub description: &'static str,
    pub unavailable_reason: Option<String>,
}

/// Get information about available backends on this system.
pub async fn available_backends(config: &SandboxConfig) -> Vec<BackendInfo> {
    let nsjail = NsjailBackend::is_available(&config.nsjail);
    let docker =
        DockerBackend::is_available(Duration::from_secs(config.docker.probe_timeout_secs)).await;
    let subprocess = config.allows_unsandboxed();

    vec![
        BackendInfo {
            name: "nsjail",
            available: nsjail,
            description: "Namespace jail, separate compile and run jails (Linux only)",
            unavailable_reason: (!nsjail).then(|| {
                format!(
                    "Requires {} and {}",
                    config.nsjail.binary_path.display(),
                    config.nsjail.config_path.display()
                )
            }),
        },
        BackendInfo {
            name: "docker",
            available: docker,
            description: "Docker container sandbox",
            unavailable_reason: (!docker).then(|| "Docker daemon not accessible".to_string()),
        },
        BackendInfo {
            name: "subprocess",
            available: subprocess,
            description: "Unsandboxed host subprocess (development only)",
            unavailable_reason: (!subprocess).then(|| {
                format!(
                    "Disabled in environment '{}' (needs development or debug)",
                    config.environment
                )
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config_with(backend: BackendType) -> SandboxConfig {
        let mut config = SandboxConfig {
            backend,
            ..SandboxConfig::default()
        };
        config.nsjail.binary_path = PathBuf::from("/nonexistent/nsjail");
        config.docker.probe_timeout_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_forced_nsjail_unavailable_is_error() {
        let selector = EnvironmentSelector::new(Arc::new(config_with(BackendType::Nsjail)));
        let err = selector.select().await.err().unwrap();
        assert!(matches!(err, LearnboxError::BackendNotAvailable { .. }));
        assert!(err.is_environmental());
    }

    #[tokio::test]
    async fn test_auto_prefers_nsjail() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with(BackendType::Auto);
        config.nsjail.binary_path = dir.path().join("nsjail");
        config.nsjail.config_path = dir.path().join("rust_exec.cfg");
        std::fs::write(&config.nsjail.binary_path, "").unwrap();
        std::fs::write(&config.nsjail.config_path, "").unwrap();

        let selector = EnvironmentSelector::new(Arc::new(config));
        let backend = selector.select().await.unwrap();
        assert_eq!(backend.kind(), BackendKind::Nsjail);
        assert!(backend.capabilities().split_phases);
    }

    #[tokio::test]
    async fn test_forced_subprocess() {
        let selector = EnvironmentSelector::new(Arc::new(config_with(BackendType::Subprocess)));
        let backend = selector.select().await.unwrap();
        assert_eq!(backend.name(), "subprocess");
        assert!(!backend.capabilities().network_isolated);
    }

    #[tokio::test]
    async fn test_available_backends_report() {
        let mut config = config_with(BackendType::Auto);
        let backends = available_backends(&config).await;
        let names: Vec<_> = backends.iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["nsjail", "docker", "subprocess"]);
        assert!(!backends[0].available);
        assert!(backends[0].unavailable_reason.is_some());
        assert!(!backends[2].available);

        config.environment = "development".to_string();
        let backends = available_backends(&config).await;
        assert!(backends[2].available);
        assert!(backends[2].unavailable_reason.is_none());
    }
}
