//! Server configuration: TOML file + CLI overrides.

use crate::error::{BridgeError, BridgeResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub timing: TimingSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret clients must present. Empty disables the check.
    #[serde(default)]
    pub proxy_token: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_device_key")]
    pub device_key: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            proxy_token: String::new(),
            max_sessions: default_max_sessions(),
            device_key: default_device_key(),
        }
    }
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_gateway_url")]
    pub url: String,
    #[serde(default)]
    pub token: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            token: String::new(),
        }
    }
}

/// `[timing]` section. Every value is in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub challenge_grace_ms: u64,
    pub connect_timeout_ms: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub upstream_ping_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub linger_ms: u64,
    pub idle_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub buffer_capacity: usize,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            challenge_grace_ms: 500,
            connect_timeout_ms: 10_000,
            retry_count: 3,
            retry_delay_ms: 1_000,
            request_timeout_ms: 30_000,
            upstream_ping_interval_ms: 30_000,
            heartbeat_interval_ms: 15_000,
            linger_ms: 120_000,
            idle_timeout_ms: 300_000,
            sweep_interval_ms: 60_000,
            buffer_capacity: 200,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3210
}
fn default_max_sessions() -> usize {
    100
}
fn default_device_key() -> String {
    "~/.clawapp/device-key.json".to_string()
}
fn default_gateway_url() -> String {
    "ws://127.0.0.1:18789".to_string()
}

/// Resolved durations and limits used by sessions and the connector.
#[derive(Debug, Clone)]
pub struct Timings {
    pub challenge_grace: Duration,
    pub connect_timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
    pub upstream_ping_interval: Duration,
    pub heartbeat_interval: Duration,
    pub linger: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub buffer_capacity: usize,
}

impl Default for Timings {
    fn default() -> Self {
        Self::from(&TimingSection::default())
    }
}

impl From<&TimingSection> for Timings {
    fn from(t: &TimingSection) -> Self {
        Self {
            challenge_grace: Duration::from_millis(t.challenge_grace_ms),
            connect_timeout: Duration::from_millis(t.connect_timeout_ms),
            retry_count: t.retry_count.max(1),
            retry_delay: Duration::from_millis(t.retry_delay_ms),
            request_timeout: Duration::from_millis(t.request_timeout_ms),
            upstream_ping_interval: Duration::from_millis(t.upstream_ping_interval_ms.max(1)),
            heartbeat_interval: Duration::from_millis(t.heartbeat_interval_ms.max(1)),
            linger: Duration::from_millis(t.linger_ms),
            idle_timeout: Duration::from_millis(t.idle_timeout_ms),
            sweep_interval: Duration::from_millis(t.sweep_interval_ms.max(1)),
            buffer_capacity: t.buffer_capacity.max(1),
        }
    }
}

#[cfg(test)]
impl Timings {
    /// Millisecond-scale timings for loopback tests.
    pub fn fast() -> Self {
        Self {
            challenge_grace: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(500),
            retry_count: 3,
            retry_delay: Duration::from_millis(50),
            request_timeout: Duration::from_millis(300),
            upstream_ping_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_millis(50),
            linger: Duration::from_millis(200),
            idle_timeout: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(50),
            buffer_capacity: 200,
        }
    }
}

/// Values supplied on the command line (or their env fallbacks).
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub proxy_token: Option<String>,
    pub gateway_url: Option<String>,
    pub gateway_token: Option<String>,
    pub device_key: Option<String>,
    pub max_sessions: Option<usize>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub proxy_token: Option<String>,
    pub gateway_url: String,
    pub gateway_token: String,
    pub device_key_path: PathBuf,
    pub max_sessions: usize,
    pub timings: Timings,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> BridgeResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Ok(Self::merge(file_config, cli))
    }

    fn merge(file: ConfigFile, cli: CliOverrides) -> Self {
        let proxy_token = cli.proxy_token.unwrap_or(file.server.proxy_token);
        let device_key = cli.device_key.unwrap_or(file.server.device_key);

        Self {
            host: cli.host.unwrap_or(file.server.host),
            port: cli.port.unwrap_or(file.server.port),
            proxy_token: Some(proxy_token).filter(|t| !t.is_empty()),
            gateway_url: cli.gateway_url.unwrap_or(file.gateway.url),
            gateway_token: cli.gateway_token.unwrap_or(file.gateway.token),
            device_key_path: expand_tilde_str(&device_key),
            max_sessions: cli.max_sessions.unwrap_or(file.server.max_sessions),
            timings: Timings::from(&file.timing),
        }
    }
}

fn parse_config(content: &str) -> BridgeResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content).map_err(|e| BridgeError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
