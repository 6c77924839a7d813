//! Server configuration: TOML file + CLI overrides.

use intercom_core::{IntercomError, IntercomResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds a push waits for the client's answer.
    #[serde(default = "default_push_timeout")]
    pub push_timeout: u64,
    /// Seconds between sweeps of expired commands.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            push_timeout: default_push_timeout(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// `[paths]` section: HTTP routes served by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PathsSection {
    #[serde(default = "default_ws_path")]
    pub ws: String,
    #[serde(default = "default_push_path")]
    pub push: String,
    #[serde(default = "default_lookup_path")]
    pub lookup: String,
    #[serde(default = "default_health_path")]
    pub health: String,
    #[serde(default = "default_metrics_path")]
    pub metrics: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            ws: default_ws_path(),
            push: default_push_path(),
            lookup: default_lookup_path(),
            health: default_health_path(),
            metrics: default_metrics_path(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    /// Registration token -> user id. Empty means the token is the user id.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
    /// Bearer secret required on push requests, if set.
    #[serde(default)]
    pub push_secret: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_push_timeout() -> u64 {
    10
}
fn default_sweep_interval() -> u64 {
    5
}
fn default_ws_path() -> String {
    "/ws".to_string()
}
fn default_push_path() -> String {
    "/push".to_string()
}
fn default_lookup_path() -> String {
    "/lookup".to_string()
}
fn default_health_path() -> String {
    "/health".to_string()
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}

/// Resolved server configuration (CLI overrides applied, validated).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub push_timeout: Duration,
    pub sweep_interval: Duration,
    pub paths: PathsSection,
    pub tokens: HashMap<String, String>,
    pub push_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let server = ServerSection::default();
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], server.port)),
            push_timeout: Duration::from_secs(server.push_timeout),
            sweep_interval: Duration::from_secs(server.sweep_interval),
            paths: PathsSection::default(),
            tokens: HashMap::new(),
            push_secret: None,
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_host: Option<&str>,
        cli_port: Option<u16>,
        cli_push_timeout: Option<u64>,
    ) -> IntercomResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let host = cli_host
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.host);
        let port = cli_port.unwrap_or(file_config.server.port);
        let push_timeout = cli_push_timeout.unwrap_or(file_config.server.push_timeout);

        let bind_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| IntercomError::Config(format!("invalid address {host}:{port}: {e}")))?;

        let config = Self {
            bind_addr,
            push_timeout: Duration::from_secs(push_timeout),
            sweep_interval: Duration::from_secs(file_config.server.sweep_interval),
            paths: file_config.paths,
            tokens: file_config.auth.tokens,
            push_secret: file_config.auth.push_secret,
        };
        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str) -> IntercomResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| IntercomError::Config(format!("config parse error: {e}")))
    }

    /// Reject unusable route tables and zero durations.
    pub fn validate(&self) -> IntercomResult<()> {
        let routes = [
            ("ws", &self.paths.ws),
            ("push", &self.paths.push),
            ("lookup", &self.paths.lookup),
            ("health", &self.paths.health),
            ("metrics", &self.paths.metrics),
        ];

        for (name, path) in routes {
            if !path.starts_with('/') {
                return Err(IntercomError::Config(format!(
                    "{name} path {path:?} must start with '/'"
                )));
            }
        }

        if self.paths.ws == self.paths.push {
            return Err(IntercomError::Config(format!(
                "ws path is equal to push path ({})",
                self.paths.ws
            )));
        }

        for (i, (name, path)) in routes.iter().enumerate() {
            if let Some((other, _)) = routes[i + 1..].iter().find(|(_, p)| p == path) {
                return Err(IntercomError::Config(format!(
                    "{name} and {other} paths collide ({path})"
                )));
            }
        }

        if self.push_timeout.is_zero() {
            return Err(IntercomError::Config("push_timeout must be positive".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(IntercomError::Config("sweep_interval must be positive".into()));
        }

        Ok(())
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.paths.ws, "/ws");
        assert_eq!(config.paths.push, "/push");
        assert_eq!(config.push_timeout, Duration::from_secs(10));
    }

    #[test]
    fn ws_and_push_paths_must_differ() {
        let mut config = ServerConfig::default();
        config.paths.push = "/ws".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ws path is equal to push path"));
    }

    #[test]
    fn any_path_collision_rejected() {
        let mut config = ServerConfig::default();
        config.paths.health = "/lookup".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_path_rejected() {
        let mut config = ServerConfig::default();
        config.paths.lookup = "lookup".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut config = ServerConfig::default();
        config.push_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_partial_file() {
        let file = ServerConfig::parse(
            r#"
            [server]
            port = 9000

            [paths]
            ws = "/socket"

            [auth]
            push_secret = "s3cret"
            tokens = { "tok-a" = "alice" }
            "#,
        )
        .unwrap();
        assert_eq!(file.server.port, 9000);
        assert_eq!(file.server.push_timeout, 10);
        assert_eq!(file.paths.ws, "/socket");
        assert_eq!(file.paths.push, "/push");
        assert_eq!(file.auth.push_secret.as_deref(), Some("s3cret"));
        assert_eq!(file.auth.tokens.get("tok-a").map(String::as_str), Some("alice"));
    }

    #[test]
    fn missing_file_uses_defaults_with_overrides() {
        let config = ServerConfig::load(
            Some(Path::new("/nonexistent/intercom.toml")),
            Some("127.0.0.1"),
            Some(9100),
            Some(3),
        )
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(config.push_timeout, Duration::from_secs(3));
    }

    #[test]
    fn bad_host_is_config_error() {
        let err = ServerConfig::load(None, Some("not a host"), None, None).unwrap_err();
        assert!(matches!(err, IntercomError::Config(_)));
    }
}
