//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration lives in a TOML file. Every section is optional:
//! a missing file or a missing key falls back to compiled defaults, so the
//! tools always start. A file that exists but does not parse is an error.
//!
//! Config file priority:
//! 1. Command-line `--config` argument
//! 2. `BIDSFORGE_CONFIG` environment variable
//! 3. Platform config dir (`~/.config/bidsforge/config.toml` on Linux)

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "BIDSFORGE_CONFIG";

/// Environment variable overriding the root (work) folder
pub const ROOT_FOLDER_ENV_VAR: &str = "BIDSFORGE_ROOT_FOLDER";

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TomlConfig {
    /// Folder holding per-session upload/work directories
    pub root_folder: Option<PathBuf>,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Rule engine tunables
    pub engine: EngineSettings,

    /// External script supervision
    pub supervisor: SupervisorSettings,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Rule engine tunables
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Minimum functional run length in seconds; `floor(this / RepetitionTime)`
    /// is the volume threshold at or below which a func/bold is excluded
    pub min_func_duration_sec: f64,

    /// Upper bound on rule-sequence repetitions while waiting for a fixed point
    pub max_passes: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            min_func_duration_sec: 60.0,
            max_passes: 8,
        }
    }
}

/// External script supervision settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Interval between cancel-marker checks
    pub poll_interval_ms: u64,

    /// File name (inside the work dir) whose presence requests cancellation
    pub cancel_marker: String,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            cancel_marker: ".cancel".to_string(),
        }
    }
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::InvalidInput(format!(
                "Unknown log level '{}' (expected one of {})",
                self.logging.level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }
        if self.engine.min_func_duration_sec <= 0.0 {
            return Err(Error::InvalidInput(
                "engine.min_func_duration_sec must be positive".to_string(),
            ));
        }
        if self.engine.max_passes == 0 {
            return Err(Error::InvalidInput(
                "engine.max_passes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with graceful degradation
///
/// An explicit path (CLI or environment) that does not exist is an error, since
/// the caller asked for it by name. An absent default config file only warns.
pub fn load_config(cli_path: Option<&Path>) -> Result<TomlConfig> {
    if let Some(path) = cli_path {
        info!("Loading config from command line: {}", path.display());
        return TomlConfig::load(path);
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        info!("Loading config from {}: {}", CONFIG_ENV_VAR, path);
        return TomlConfig::load(Path::new(&path));
    }

    match default_config_path() {
        Some(path) if path.exists() => {
            info!("Loading config from {}", path.display());
            TomlConfig::load(&path)
        }
        Some(path) => {
            warn!(
                "No config file at {}, using compiled defaults",
                path.display()
            );
            Ok(TomlConfig::default())
        }
        None => {
            warn!("Could not determine config directory, using compiled defaults");
            Ok(TomlConfig::default())
        }
    }
}

/// Platform config file location
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("bidsforge").join("config.toml"))
}

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default
pub fn resolve_root_folder(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV_VAR) {
        return PathBuf::from(path);
    }

    if let Some(path) = &config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("bidsforge"))
        .unwrap_or_else(|| PathBuf::from("./bidsforge_data"))
}
