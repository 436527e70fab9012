//! Server and pipeline settings.
//!
//! Loaded from JSON (every field optional) and then overridden from the
//! environment:
//!
//! | Variable                        | Field                |
//! |---------------------------------|----------------------|
//! | `SWITCHYARD_BIND_ADDR`          | `bind_addr`          |
//! | `SWITCHYARD_MAX_REQUEST_SIZE`   | `max_request_size`   |
//! | `SWITCHYARD_PENDING_TIMEOUT_MS` | `pending_timeout_ms` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const ENV_BIND_ADDR: &str = "SWITCHYARD_BIND_ADDR";
pub const ENV_MAX_REQUEST_SIZE: &str = "SWITCHYARD_MAX_REQUEST_SIZE";
pub const ENV_PENDING_TIMEOUT_MS: &str = "SWITCHYARD_PENDING_TIMEOUT_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid {name} ({value}): {reason}")]
    Env {
        name: &'static str,
        value: String,
        reason: String,
    },
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_owned()
}

fn default_max_request_size() -> usize {
    8 * 1024 * 1024
}

fn default_initial_buffer_size() -> usize {
    4096
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to listen on, e.g. `0.0.0.0:8080`.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Largest request (head plus body) buffered before answering `413`.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,

    /// Read buffer capacity allocated per connection.
    #[serde(default = "default_initial_buffer_size")]
    pub initial_buffer_size: usize,

    /// Upper bound for a suspended filter or handler. Absent means no bound.
    #[serde(default)]
    pub pending_timeout_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_request_size: default_max_request_size(),
            initial_buffer_size: default_initial_buffer_size(),
            pending_timeout_ms: None,
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Applies `SWITCHYARD_*` variables from the process environment.
    pub fn apply_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its
    /// value.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            self.bind_addr = addr;
        }
        if let Some(raw) = lookup(ENV_MAX_REQUEST_SIZE) {
            self.max_request_size = parse_env(ENV_MAX_REQUEST_SIZE, raw)?;
        }
        if let Some(raw) = lookup(ENV_PENDING_TIMEOUT_MS) {
            // An empty value switches the timeout off.
            self.pending_timeout_ms = if raw.trim().is_empty() {
                None
            } else {
                Some(parse_env(ENV_PENDING_TIMEOUT_MS, raw)?)
            };
        }
        Ok(self)
    }

    /// The timeout to hand to
    /// [`PipelineBuilder::pending_timeout`](crate::pipeline::PipelineBuilder::pending_timeout).
    pub fn pending_timeout(&self) -> Option<Duration> {
        self.pending_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_env<T>(name: &'static str, raw: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let parsed = raw.trim().parse::<T>();
    parsed.map_err(|err| ConfigError::Env {
        name,
        reason: err.to_string(),
        value: raw,
    })
}
