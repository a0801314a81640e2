//! Configuration loading and config file resolution
//!
//! Config file resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. `METAFED_CONFIG` environment variable
//! 3. Per-user config directory (`<config_dir>/metafed/config.toml`)
//! 4. Compiled defaults (no file)
//!
//! A missing config file never stops startup: a warning is logged and the
//! compiled defaults are used. A file that exists but cannot be parsed is a
//! configuration error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "METAFED_CONFIG";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TomlConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Engine tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Throttled web client used by network-backed sources
    #[serde(default)]
    pub net: NetConfig,

    /// Catalog files loaded as in-memory sources, in rank order
    #[serde(default)]
    pub catalogs: Vec<PathBuf>,

    /// Register the MusicBrainz source
    #[serde(default)]
    pub musicbrainz: bool,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Capacity of the engine event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Chunk size applied to sources that do not declare their own
    /// auto-split threshold. `None` disables splitting for those sources.
    #[serde(default)]
    pub default_auto_split_threshold: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            default_auto_split_threshold: None,
        }
    }
}

/// Web client configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NetConfig {
    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Maximum requests per second (per client)
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Number of responses kept in the GET cache (0 disables caching)
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            requests_per_second: default_requests_per_second(),
            timeout_secs: default_timeout_secs(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_event_capacity() -> usize {
    256
}

fn default_user_agent() -> String {
    format!("metafed/{}", env!("CARGO_PKG_VERSION"))
}

fn default_requests_per_second() -> u32 {
    1
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_cache_capacity() -> usize {
    64
}

/// Resolve which config file to read, if any
///
/// Returns `None` when neither the CLI, the environment, nor the per-user
/// config directory names an existing file.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Per-user config directory
    let user_config = default_config_path()?;
    if user_config.exists() {
        Some(user_config)
    } else {
        None
    }
}

/// Per-user config file location for the current platform
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("metafed").join("config.toml"))
}

/// Parse a TOML config from a string
pub fn parse_config(content: &str) -> Result<TomlConfig> {
    toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
}

/// Load configuration following the resolution priority
///
/// Missing files degrade to defaults with a warning. Parse failures are
/// reported as `Error::Config`.
pub fn load_config(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    let Some(path) = resolve_config_path(cli_arg) else {
        info!("No config file found, using compiled defaults");
        return Ok(TomlConfig::default());
    };

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            warn!(
                "Config file {} not readable ({}), using compiled defaults",
                path.display(),
                e
            );
            return Ok(TomlConfig::default());
        }
    };

    let config = parse_config(&content)?;
    info!("Configuration loaded from {}", path.display());
    Ok(config)
}

/// Write a config file atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config, TomlConfig::default());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.net.requests_per_second, 1);
        assert!(config.catalogs.is_empty());
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config = parse_config(
            r#"
            catalogs = ["a.toml", "b.toml"]

            [engine]
            default_auto_split_threshold = 100
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.default_auto_split_threshold, Some(100));
        assert_eq!(config.engine.event_capacity, 256);
        assert_eq!(config.catalogs.len(), 2);
        assert_eq!(config.net.timeout_secs, 15);
    }

    #[test]
    fn test_malformed_config_is_error() {
        let result = parse_config("[engine\nevent_capacity = ");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_cli_arg_wins() {
        let path = PathBuf::from("/tmp/explicit-metafed.toml");
        assert_eq!(resolve_config_path(Some(&path)), Some(path));
    }
}
