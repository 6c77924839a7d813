//! Harness configuration at `~/.intercom/cli.toml`.
//!
//! Provides the relay address, route paths, and push secret. CLI flags always
//! override config file values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default: DefaultConfig,
}

/// Relay connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultConfig {
    /// Relay `host:port`.
    #[serde(default = "default_server")]
    pub server: String,

    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    #[serde(default = "default_push_path")]
    pub push_path: String,

    /// Bearer secret sent with push requests.
    #[serde(default)]
    pub push_secret: Option<String>,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            ws_path: default_ws_path(),
            push_path: default_push_path(),
            push_secret: None,
        }
    }
}

fn default_server() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_push_path() -> String {
    "/push".to_string()
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Default location, `~/.intercom/cli.toml`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".intercom")
            .join("cli.toml")
    }
}

impl DefaultConfig {
    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.server, self.ws_path)
    }

    pub fn push_url(&self) -> String {
        format!("http://{}{}", self.server, self.push_path)
    }
}
