use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

use crate::session::SessionConfig;

/// Prefix for environment overrides, e.g. `LIVE_SESSION__ENDPOINT__MODEL`
pub const ENV_PREFIX: &str = "LIVE_SESSION";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct EndpointConfig {
    /// WebSocket URL of the live endpoint
    pub url: String,
    pub model: String,
    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_setup_timeout_secs")]
    pub setup_timeout_secs: u64,
}

fn default_token_env() -> String {
    "LIVE_SESSION_TOKEN".to_string()
}

fn default_setup_timeout_secs() -> u64 {
    15
}

/// File-backed capture devices; an unset path behaves like a denied device
#[derive(Debug, Default, Deserialize)]
pub struct DevicesConfig {
    pub microphone_wav: Option<PathBuf>,
    pub camera_image: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct PersistenceConfig {
    /// Publish finalized messages to NATS when set, otherwise only log them
    pub nats_url: Option<String>,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            nats_url: None,
            subject_prefix: default_subject_prefix(),
        }
    }
}

fn default_subject_prefix() -> String {
    "chat.message".to_string()
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?;

        let config: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.session.validate()?;
        Ok(config)
    }
}
