//! Client configuration.
//!
//! Sources, lowest priority first:
//! 1. built-in defaults
//! 2. `volscope.toml` in the working directory (or an explicit file)
//! 3. `VOLSCOPE__*` environment variables (e.g. `VOLSCOPE__BASE_URL`)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Poll interval used by every poller unless configured otherwise.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Service root, without the `/api/v1` suffix.
    pub base_url: String,

    pub poll_interval_ms: u64,

    /// Per-request timeout. Uploads only use it as the connect timeout.
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ClientConfig {
    /// Load from `volscope.toml` (optional) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Like [`ClientConfig::load`], but an explicit file must exist.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name("volscope").required(false),
        };
        let loaded: ClientConfig = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix("VOLSCOPE").separator("__"))
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "base_url must be an http(s) url, got {:?}",
                self.base_url
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
