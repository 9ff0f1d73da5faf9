use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::config::types::LearnboxConfig;
use crate::error::{LearnboxError, Result};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "learnbox", "learnbox") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".learnbox").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values, then
/// apply environment overrides.
pub fn load_config(config_path: Option<&Path>) -> Result<LearnboxConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    let mut config = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).map_err(|e| LearnboxError::TomlParse(e.to_string()))?
    } else {
        // Return defaults if no config file exists
        LearnboxConfig::default()
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

/// Apply the deployment environment variables on top of a loaded config.
///
/// `lookup` is the variable source; `load_config` passes the process
/// environment.
pub fn apply_env_overrides<F>(config: &mut LearnboxConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let sandbox = &mut config.sandbox;

    if let Some(root) = lookup("SANDBOX_BASE") {
        debug!(root = %root, "SANDBOX_BASE override");
        sandbox.sandbox_root = PathBuf::from(root);
    }

    if let Some(image) = lookup("SANDBOX_DOCKER_IMAGE") {
        sandbox.docker.image = image;
    }

    if let Some(environment) = lookup("ENVIRONMENT") {
        sandbox.environment = environment.to_lowercase();
    }

    if let Some(debug_flag) = lookup("DEBUG") {
        sandbox.debug = debug_flag.eq_ignore_ascii_case("true");
    }

    if sandbox.max_concurrent == 0 {
        return Err(LearnboxError::Config(
            "sandbox.max_concurrent must be at least 1".to_string(),
        ));
    }

    Ok(())
}
