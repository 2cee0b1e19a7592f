//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,

    /// Managed controllers by name
    pub controllers: BTreeMap<String, ControllerConfig>,

    /// Operators allowed to connect, by name
    pub operators: BTreeMap<String, OperatorConfig>,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Socket directory
    pub runtime_dir: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            runtime_dir: None,
            log_level: "info".to_string(),
        }
    }
}

/// One managed controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// How to open the upstream session
    pub auth: AuthConfig,

    /// Minimum quiet time before each command, in milliseconds
    #[serde(default = "default_command_delay_ms")]
    pub command_delay_ms: u64,

    #[serde(default)]
    pub scripts: ScriptsConfig,
}

fn default_command_delay_ms() -> u64 {
    1200
}

/// Upstream session parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Program to run, e.g. `ssh`
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// Scripts run against a controller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    /// Commands queued every time the session becomes ready
    pub init: Vec<String>,
}

/// An operator's permissions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// e.g. `controllers.alpha`, or `-controllers.alpha` to record a revocation
    pub permissions: Vec<String>,

    /// Unix uid the operator must connect as. Without it the operator name
    /// is taken on trust from any local user allowed to open the socket.
    pub uid: Option<u32>,
}

impl Config {
    /// Load config from the default location, or return defaults if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, or return defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Config::default())
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("procraft")
            .join("config.toml")
    }

    /// Get the runtime directory for sockets
    pub fn runtime_dir(&self) -> PathBuf {
        self.general
            .runtime_dir
            .clone()
            .or_else(dirs::runtime_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("procraft")
    }

    /// Get the server socket path
    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir().join("procraft.sock")
    }
}
