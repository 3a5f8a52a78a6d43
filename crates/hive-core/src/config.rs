//! Configuration resolution for Hive.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/hive/settings.json)
//! 3. Project config (.hive/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binaries)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Hive configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Supervisor-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Upper bound on concurrently running workers.
    pub max_workers: u32,
    /// Grace period between SIGTERM and SIGKILL when stopping a worker.
    pub terminate_timeout_secs: u64,
    pub log_level: String,
    /// Backlog store location; `None` means [`database_path`].
    pub database_path: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            terminate_timeout_secs: 5,
            log_level: "info".to_string(),
            database_path: None,
        }
    }
}

/// Worker defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub default_model: String,
    /// Maximum number of features a worker processes before exiting.
    pub max_iterations: Option<u32>,
    /// Skip regression sampling for faster iteration.
    pub yolo: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_model: "claude-sonnet-4-5-20250929".to_string(),
            max_iterations: None,
            yolo: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();
    if let Some(global_path) = global_config_path() {
        layers.push(global_path);
    }
    if let Some(dir) = project_dir {
        layers.push(dir.join(".hive").join("settings.json"));
    }

    let mut config = load_layers(&layers)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Merge the settings files that exist, later ones winning key by key, on
/// top of the defaults.
fn load_layers(paths: &[PathBuf]) -> Result<Config> {
    let mut merged = Value::Object(Map::new());
    for path in paths.iter().filter(|p| p.exists()) {
        merge_values(&mut merged, load_config_file(path)?);
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("hive").join("settings.json"))
}

/// Get the default backlog database path.
pub fn database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("hive").join("features.db"))
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must hold a JSON object",
            path.display()
        )));
    }
    Ok(value)
}

/// Deep-merge `overlay` into `base`. Objects merge per key; anything else
/// replaces.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_values(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("HIVE_MAX_WORKERS")
        && let Ok(n) = val.parse()
    {
        config.supervisor.max_workers = n;
    }
    if let Ok(val) = std::env::var("HIVE_TERMINATE_TIMEOUT")
        && let Ok(n) = val.parse()
    {
        config.supervisor.terminate_timeout_secs = n;
    }
    if let Ok(val) = std::env::var("HIVE_LOG_LEVEL") {
        config.supervisor.log_level = val;
    }
    if let Ok(val) = std::env::var("HIVE_DEFAULT_MODEL") {
        config.agent.default_model = val;
    }
}
