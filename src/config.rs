//! Config file discovery and loading.
//!
//! Lookup order:
//! 1. An explicit `--config` path (must exist)
//! 2. `{config_dir}/graphiti-memory/config.toml` (optional)
//! 3. Compiled defaults
//!
//! `GRAPHITI_MEMORY_ENDPOINT` and `GRAPHITI_MEMORY_HOST_URL` override the
//! file values.

use crate::{MemoryConfig, MemoryError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONFIG_DIR_NAME: &str = "graphiti-memory";
const CONFIG_FILE_NAME: &str = "config.toml";

pub const ENV_ENDPOINT: &str = "GRAPHITI_MEMORY_ENDPOINT";
pub const ENV_HOST_URL: &str = "GRAPHITI_MEMORY_HOST_URL";

/// Default location of the config file, if a config directory exists
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Load config from an explicit path or the default location.
pub fn load_config(explicit: Option<&Path>) -> Result<MemoryConfig> {
    let mut config = match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(MemoryError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            load_config_file(path)?
        }
        None => match default_config_path() {
            Some(path) if path.exists() => load_config_file(&path)?,
            _ => {
                debug!("No config file found, using defaults");
                MemoryConfig::default()
            }
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Parse a TOML config file. Missing keys take their defaults.
pub fn load_config_file(path: &Path) -> Result<MemoryConfig> {
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<MemoryConfig> {
    Ok(toml::from_str(content)?)
}

fn apply_env_overrides(config: &mut MemoryConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(endpoint) = lookup(ENV_ENDPOINT).filter(|v| !v.trim().is_empty()) {
        config.endpoint = endpoint;
    }
    if let Some(host_url) = lookup(ENV_HOST_URL).filter(|v| !v.trim().is_empty()) {
        config.host_url = host_url;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse_config(
            r#"
endpoint = "http://graph:9000/mcp"
drift_threshold = 0.3

[budget]
project_share = 0.6
"#,
        )
        .unwrap();

        assert_eq!(config.endpoint, "http://graph:9000/mcp");
        assert_eq!(config.drift_threshold, 0.3);
        assert_eq!(config.budget.project_share, 0.6);
        assert_eq!(config.budget.decision_share, 0.4);
        assert_eq!(config.idle_flush_min_bytes, 50);
        assert!(config.decision_keywords.contains(&"decided".to_string()));
    }

    #[test]
    fn test_load_from_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "fact_stale_days = 14").unwrap();
        writeln!(file, "include_user_scope = false").unwrap();

        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.fact_stale_days, 14);
        assert!(!config.include_user_scope);
    }

    #[test]
    fn test_missing_explicit_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(Some(&dir.path().join("nope.toml")));
        assert!(matches!(result, Err(MemoryError::Config(_))));
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(matches!(
            parse_config("drift_threshold = \"high\""),
            Err(MemoryError::Toml(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = MemoryConfig::default();
        apply_env_overrides(&mut config, |key| match key {
            ENV_ENDPOINT => Some("http://override/mcp".to_string()),
            ENV_HOST_URL => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.endpoint, "http://override/mcp");
        assert_eq!(config.host_url, "http://localhost:4096");
    }
}
