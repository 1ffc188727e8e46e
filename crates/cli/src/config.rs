//! Configuration loading from parley.toml.

use std::path::{Path, PathBuf};
use std::time::Duration;

use routing::RoutingPolicy;
use runtime::{Credentials, ReconnectPolicy};
use serde::Deserialize;

/// Environment variable overriding `credentials.token`.
pub const TOKEN_VAR: &str = "PARLEY_TOKEN";
/// Environment variable overriding `credentials.username`.
pub const USERNAME_VAR: &str = "PARLEY_USERNAME";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    /// Where the snapshot database lives. Defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
}

/// Server connection configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_url")]
    pub url: String,

    /// `broadcast` (one push stream) or `conversation` (one stream per request).
    #[serde(default)]
    pub mode: RoutingPolicy,

    /// Channel shown on first start.
    #[serde(default = "default_channel")]
    pub channel: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            mode: RoutingPolicy::default(),
            channel: default_channel(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CredentialsConfig {
    pub username: Option<String>,
    pub token: Option<String>,
}

/// Reconnect delays, in milliseconds.
#[derive(Debug, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default)]
    pub clean_close_ms: u64,

    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,

    #[serde(default = "default_ensure_interval_ms")]
    pub ensure_interval_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            clean_close_ms: 0,
            retry_ms: default_retry_ms(),
            ensure_interval_ms: default_ensure_interval_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AudioConfig {
    /// Set to false to never start the playback task.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Player command line; the clip path is appended as the last argument.
    #[serde(default = "default_player")]
    pub player: Vec<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            player: default_player(),
        }
    }
}

fn default_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_channel() -> String {
    "#general".to_string()
}

fn default_retry_ms() -> u64 {
    500
}

fn default_ensure_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_player() -> Vec<String> {
    ["ffplay", "-nodisp", "-autoexit", "-loglevel", "quiet"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.url.starts_with("http://") && !self.server.url.starts_with("https://") {
            return Err(ConfigError::InvalidUrl(self.server.url.clone()));
        }
        if self.server.channel.trim().is_empty() {
            return Err(ConfigError::EmptyChannel);
        }
        if self.audio.enabled && self.audio.player.is_empty() {
            return Err(ConfigError::EmptyPlayer);
        }
        Ok(())
    }

    /// Let environment variables override the configured credentials.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup(TOKEN_VAR).filter(|t| !t.is_empty()) {
            self.credentials.token = Some(token);
        }
        if let Some(username) = lookup(USERNAME_VAR).filter(|u| !u.is_empty()) {
            self.credentials.username = Some(username);
        }
    }

    /// Credentials, if both halves are configured.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.credentials.username, &self.credentials.token) {
            (Some(username), Some(token)) => Some(Credentials::new(username, token)),
            _ => None,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            clean_close_delay: Duration::from_millis(self.reconnect.clean_close_ms),
            retry_delay: Duration::from_millis(self.reconnect.retry_ms),
            ensure_interval: Duration::from_millis(self.reconnect.ensure_interval_ms),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("server.url must be an http(s) URL, got '{0}'")]
    InvalidUrl(String),

    #[error("server.channel must not be empty")]
    EmptyChannel,

    #[error("audio.player must name a program when audio is enabled")]
    EmptyPlayer,
}
