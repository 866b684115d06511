//! Configuration file loading.
//!
//! Loads `OrchestratorConfig` from a TOML file. A missing file yields the
//! defaults; a malformed file is an error.

use std::path::Path;

use maestro_types::config::OrchestratorConfig;
use thiserror::Error;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Load the orchestrator configuration from a TOML file.
///
/// Returns `OrchestratorConfig::default()` when the file does not exist.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(?path, "no config file, using defaults");
        return Ok(OrchestratorConfig::default());
    }
    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    tracing::debug!(?path, "loaded orchestrator config");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.retry_base_delay_ms, 1_000);
        assert_eq!(config.retry_max_delay_ms, 60_000);
    }

    #[test]
    fn test_loads_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "retry_base_delay_ms = 500\nlevel_fan_out = 4\ncheckpoint_keep_latest = 2\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.retry_base_delay_ms, 500);
        assert_eq!(config.level_fan_out, Some(4));
        assert_eq!(config.checkpoint_keep_latest, 2);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "retry_base_delay_ms = \"not a number\"").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Parse(_))));
    }
}
