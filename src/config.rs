//! Server configuration: TOML file, overridden by `TOLLGATE_*` environment
//! variables, overridden in turn by binary flags.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub sqlite_path: PathBuf,
    /// Used when a request carries no target header; None means the
    /// header is required.
    pub default_target: Option<String>,
    pub upstream_timeout_seconds: u64,
    pub pricing_ttl_seconds: u64,
    /// Cap on buffered request and response bodies.
    pub max_body_bytes: usize,
    /// Bodies larger than this are delivered but never parsed for
    /// accounting.
    pub usage_max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            sqlite_path: PathBuf::from("tollgate.db"),
            default_target: None,
            upstream_timeout_seconds: 300,
            pricing_ttl_seconds: crate::pricing::DEFAULT_TTL_SECONDS,
            max_body_bytes: 64 * 1024 * 1024,
            usage_max_body_bytes: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `TOLLGATE_LISTEN`, `TOLLGATE_SQLITE`, `TOLLGATE_DEFAULT_TARGET`
    /// and `TOLLGATE_PRICING_TTL_SECONDS` on top of the file values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(listen) = std::env::var("TOLLGATE_LISTEN") {
            self.listen = listen;
        }
        if let Ok(path) = std::env::var("TOLLGATE_SQLITE") {
            self.sqlite_path = PathBuf::from(path);
        }
        if let Ok(target) = std::env::var("TOLLGATE_DEFAULT_TARGET") {
            self.default_target = Some(target);
        }
        if let Ok(raw) = std::env::var("TOLLGATE_PRICING_TTL_SECONDS") {
            self.pricing_ttl_seconds =
                raw.parse::<u64>().map_err(|_| ConfigError::InvalidEnv {
                    var: "TOLLGATE_PRICING_TTL_SECONDS",
                    value: raw,
                })?;
        }
        Ok(())
    }
}
