//! Configuration loading and management for the forkbus engine.
//!
//! The configuration is stored in TOML format and defines:
//! - Engine settings (name)
//! - The worker to fork (executable, arguments, modules, environment)
//! - Supervisor limits
//! - Log store settings (ring size, optional JSON-lines directory)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the configuration file looked up in the working directory and
/// in the user's config directory.
pub const CONFIG_FILE_NAME: &str = "forkbus.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    ValidationError(String),

    #[error("Path does not exist: {0}")]
    PathNotFound(PathBuf),
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Name of this engine instance, passed to the worker.
    #[serde(default = "default_engine_name")]
    pub name: String,
}

fn default_engine_name() -> String {
    "forkbus".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
        }
    }
}

/// The worker process to fork.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Path to the worker executable.
    #[serde(default = "default_worker_path")]
    pub path: PathBuf,

    /// Arguments placed before the module locators.
    #[serde(default)]
    pub args: Vec<String>,

    /// Module locators the worker should start.
    #[serde(default)]
    pub modules: Vec<String>,

    /// Environment variables to set.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_worker_path() -> PathBuf {
    PathBuf::from("./target/debug/echo_worker")
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            path: default_worker_path(),
            args: Vec::new(),
            modules: Vec::new(),
            env: HashMap::new(),
        }
    }
}

impl WorkerConfig {
    /// Full argument list: configured arguments followed by modules.
    #[must_use]
    pub fn command_args(&self) -> Vec<String> {
        self.args.iter().chain(&self.modules).cloned().collect()
    }
}

/// Supervisor limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Consecutive undecodable frames tolerated before the worker is
    /// considered crashed. `0` tolerates any number.
    #[serde(default = "default_max_decode_failures")]
    pub max_decode_failures: usize,
}

const fn default_max_decode_failures() -> usize {
    16
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_decode_failures: default_max_decode_failures(),
        }
    }
}

/// Log store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Number of non-debug records kept for replay.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Directory for daily JSON-lines log files. Disabled when unset.
    #[serde(default)]
    pub json_log_dir: Option<PathBuf>,
}

const fn default_ring_capacity() -> usize {
    1000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
            json_log_dir: None,
        }
    }
}

/// Complete forkbus configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForkbusConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

impl ForkbusConfig {
    /// Load configuration from a file.
    ///
    /// Only the structure is validated; call [`validate`](Self::validate)
    /// once command-line overrides have been applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ForkbusConfig = toml::from_str(content)?;
        config.validate_structure()?;
        Ok(config)
    }

    /// Validate the configuration structure (pure function).
    pub fn validate_structure(&self) -> Result<(), ConfigError> {
        if self.engine.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "engine.name must not be empty".to_string(),
            ));
        }
        if self.store.ring_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "store.ring_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate that the worker executable exists (impure function).
    pub fn validate_paths(&self) -> Result<(), ConfigError> {
        if !self.worker.path.exists() {
            return Err(ConfigError::PathNotFound(self.worker.path.clone()));
        }
        Ok(())
    }

    /// Validate the configuration (combines structure and path validation).
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_structure()?;
        self.validate_paths()?;
        Ok(())
    }
}

/// Candidate configuration files in lookup order (pure function).
///
/// An explicit path wins outright. Otherwise the working directory is
/// searched before the user's config directory.
#[must_use]
pub fn config_candidates(explicit: Option<&Path>, config_dir: Option<&Path>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path.to_path_buf()];
    }
    let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(dir) = config_dir {
        candidates.push(dir.join("forkbus").join(CONFIG_FILE_NAME));
    }
    candidates
}

/// Locate and load the configuration.
///
/// An explicit path must exist. Without one, the first existing candidate
/// is loaded, falling back to defaults when none exists. Returns the file
/// that was used, if any.
pub fn discover(explicit: Option<&Path>) -> Result<(ForkbusConfig, Option<PathBuf>), ConfigError> {
    if let Some(path) = explicit {
        return Ok((ForkbusConfig::load(path)?, Some(path.to_path_buf())));
    }

    let config_dir = directories::BaseDirs::new().map(|dirs| dirs.config_dir().to_path_buf());
    match config_candidates(None, config_dir.as_deref())
        .into_iter()
        .find(|candidate| candidate.exists())
    {
        Some(path) => Ok((ForkbusConfig::load(&path)?, Some(path))),
        None => Ok((ForkbusConfig::default(), None)),
    }
}
