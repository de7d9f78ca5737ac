use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::ConfigError;
use crate::paths::Paths;

/// Overrides the broker socket path.
pub const ENV_SOCKET: &str = "MIST_SOCKET";
/// Overrides the data directory.
pub const ENV_DATA_DIR: &str = "MIST_DATA_DIR";

/// Top-level configuration, normally read from `~/.config/mist/config.toml`.
///
/// Every field has a default, so an empty file (or no file) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MistConfig {
    /// Root for the socket, pid file and agent data.
    pub data_dir: PathBuf,
    /// Socket path; defaults to `<data_dir>/broker/mist.sock`.
    pub socket_path: Option<PathBuf>,
    pub broker: BrokerConfig,
    pub client: ClientConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Pid file; defaults to `<data_dir>/broker/mist.pid`.
    pub pid_file: Option<PathBuf>,
    /// Permission bits applied to the socket file after bind.
    pub socket_mode: u32,
}

/// Per-call deadlines used by `BrokerClient`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Catalog and other broker-local requests.
    pub request_timeout_secs: u64,
    /// Commands forwarded to agents.
    pub command_timeout_secs: u64,
    /// Service calls. LLM chat uses `llm.timeout_secs` instead.
    pub service_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Ollama base URL.
    pub endpoint: String,
    /// Model used when a request names none.
    pub default_model: String,
    pub timeout_secs: u64,
    /// Concurrent backend calls; further requests queue.
    pub max_concurrent: usize,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("mist")
}

impl Default for MistConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            socket_path: None,
            broker: BrokerConfig::default(),
            client: ClientConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            pid_file: None,
            socket_mode: 0o600,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 5,
            command_timeout_secs: 30,
            service_timeout_secs: 10,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            default_model: "gemma3:1b".to_string(),
            timeout_secs: 120,
            max_concurrent: 1,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout_secs)
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl MistConfig {
    /// Default config file location: `$XDG_CONFIG_HOME/mist/config.toml`.
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mist").join("config.toml"))
    }

    /// Load configuration.
    ///
    /// With an explicit `path` the file must exist. Without one, the default
    /// location is used if present and built-in defaults otherwise.
    /// Environment overrides are applied last, then the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.to_path_buf()));
                }
                Self::from_file(path)?
            }
            None => match Self::default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    debug!("no config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Apply `MIST_SOCKET` / `MIST_DATA_DIR` from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(dir) = get(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(socket) = get(ENV_SOCKET) {
            self.socket_path = Some(PathBuf::from(socket));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| ConfigError::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        };
        if self.llm.max_concurrent == 0 {
            return Err(invalid("llm.max_concurrent", "must be at least 1"));
        }
        if self.llm.endpoint.trim().is_empty() {
            return Err(invalid("llm.endpoint", "must not be empty"));
        }
        if self.client.request_timeout_secs == 0
            || self.client.command_timeout_secs == 0
            || self.client.service_timeout_secs == 0
        {
            return Err(invalid("client", "timeouts must be greater than zero"));
        }
        if self.broker.socket_mode > 0o777 {
            return Err(invalid("broker.socket_mode", "not a permission mode"));
        }
        Ok(())
    }

    pub fn paths(&self) -> Paths {
        let mut paths = Paths::new(&self.data_dir);
        if let Some(socket) = &self.socket_path {
            paths = paths.with_socket(socket);
        }
        if let Some(pid) = &self.broker.pid_file {
            paths = paths.with_pid_file(pid);
        }
        paths
    }

    /// Config rooted at `dir`; used by tests and throwaway brokers.
    pub fn for_data_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: dir.into(),
            ..Self::default()
        }
    }
}
