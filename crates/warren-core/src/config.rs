//! Orchestrator configuration.
//!
//! Parsed from TOML. Only the host program is required; everything else
//! has a usable default so a minimal config is a two-line file.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::worker::WorkerId;

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Workspace identifier; scopes worker filesystem roots.
    #[serde(default = "default_workspace_id")]
    pub workspace_id: String,

    /// Base directory under which worker roots are provisioned.
    #[serde(default = "default_fs_base_dir")]
    pub fs_base_dir: PathBuf,

    /// Host process definition.
    pub host: HostProcessConfig,

    /// How long a service invocation into a worker may run before the
    /// caller gets a timeout error.
    #[serde(default = "default_invoke_timeout", with = "humantime_serde")]
    pub invoke_timeout: Duration,
}

impl OrchestratorConfig {
    /// Build a configuration with defaults around the given host.
    #[must_use]
    pub fn new(host: HostProcessConfig) -> Self {
        Self {
            workspace_id: default_workspace_id(),
            fs_base_dir: default_fs_base_dir(),
            host,
            invoke_timeout: default_invoke_timeout(),
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate the configuration, failing closed on anything suspect.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Validation`] naming the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        WorkerId::parse(&self.workspace_id).map_err(|e| {
            ConfigError::Validation(format!("invalid workspace_id: {e}"))
        })?;
        if self.invoke_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "invoke_timeout must be greater than zero".to_string(),
            ));
        }
        self.host.validate()
    }
}

/// Definition of the single host process the orchestrator supervises.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostProcessConfig {
    /// Program to execute.
    pub program: PathBuf,

    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the host process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// How long to wait for the host's `ready` event after spawn.
    #[serde(default = "default_ready_timeout", with = "humantime_serde")]
    pub ready_timeout: Duration,

    /// Whether the child is killed when the supervisor drops it.
    #[serde(default = "default_kill_on_drop")]
    pub kill_on_drop: bool,
}

impl HostProcessConfig {
    /// Build a host definition with defaults around the given program.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            ready_timeout: default_ready_timeout(),
            kill_on_drop: default_kill_on_drop(),
        }
    }

    /// Append a program argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for the host process.
    #[must_use]
    pub fn with_env_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Override the ready timeout.
    #[must_use]
    pub const fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Validate the host definition.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Validation`] naming the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.program.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "host.program must not be empty".to_string(),
            ));
        }
        if self.ready_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "host.ready_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_workspace_id() -> String {
    "default".to_string()
}

fn default_fs_base_dir() -> PathBuf {
    std::env::temp_dir().join("warren")
}

const fn default_invoke_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_ready_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_kill_on_drop() -> bool {
    true
}

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
