//! Layered configuration for the realtime connection layer.
//!
//! Settings are read from `.convo/convo.toml`, then overridden by
//! environment variables (after `.env` is loaded with `dotenvy`), then by
//! CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [connection]
//! url = "ws://localhost:8087"
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//! max_attempts = 5
//! ping_interval_ms = 30000
//! pong_timeout_ms = 5000
//! connect_timeout_ms = 10000
//!
//! [logging]
//! format = "pretty"
//! filter = "convo_link=info"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::ReconnectPolicy;
use crate::manager::ManagerConfig;

/// Directory (relative to the working directory) holding `convo.toml`.
pub const CONFIG_DIR: &str = ".convo";

/// File name of the configuration file inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "convo.toml";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, colored when attached to a terminal (default)
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// Realtime connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSection {
    /// Base URL of the conversational engine
    #[serde(default = "default_url")]
    pub url: String,
    /// Backoff delay for the first reconnect attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any backoff delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Reconnect attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Interval between keepalive pings
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// How long to wait for a pong before forcing a reconnect
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
    /// Upper bound on establishing a single connection
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_url() -> String {
    "ws://localhost:8087".to_string()
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_pong_timeout_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            url: default_url(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ConnectionSection {
    /// Backoff policy described by this section.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "convo_link=info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_filter(),
        }
    }
}

/// Root of `convo.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvoToml {
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ConvoToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse convo.toml")
    }

    /// Load from `<config_dir>/convo.toml`, or defaults when the file is absent.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize convo.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// Recognised variables: `CONVO_WS_URL`, `CONVO_MAX_ATTEMPTS`,
    /// `CONVO_LOG_FORMAT`. Unparseable values are skipped and reported.
    pub fn apply_env<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut skipped = Vec::new();

        if let Some(url) = lookup("CONVO_WS_URL") {
            self.connection.url = url;
        }
        if let Some(raw) = lookup("CONVO_MAX_ATTEMPTS") {
            match raw.parse::<u32>() {
                Ok(n) => self.connection.max_attempts = n,
                Err(_) => skipped.push(format!("CONVO_MAX_ATTEMPTS='{}' is not a number", raw)),
            }
        }
        if let Some(raw) = lookup("CONVO_LOG_FORMAT") {
            match raw.parse::<LogFormat>() {
                Ok(format) => self.logging.format = format,
                Err(e) => skipped.push(format!("CONVO_LOG_FORMAT: {}", e)),
            }
        }

        skipped
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let conn = &self.connection;

        if !(conn.url.starts_with("ws://") || conn.url.starts_with("wss://")) {
            warnings.push(format!(
                "connection.url '{}' should start with ws:// or wss://",
                conn.url
            ));
        }
        if conn.base_delay_ms == 0 {
            warnings.push("connection.base_delay_ms is 0; reconnects will spin".to_string());
        }
        if conn.max_delay_ms < conn.base_delay_ms {
            warnings.push(format!(
                "connection.max_delay_ms ({}) is below base_delay_ms ({})",
                conn.max_delay_ms, conn.base_delay_ms
            ));
        }
        if conn.pong_timeout_ms >= conn.ping_interval_ms {
            warnings.push(format!(
                "connection.pong_timeout_ms ({}) should be shorter than ping_interval_ms ({})",
                conn.pong_timeout_ms, conn.ping_interval_ms
            ));
        }
        if conn.max_attempts == 0 {
            warnings.push(
                "connection.max_attempts is 0; the first failure gives up immediately".to_string(),
            );
        }

        warnings
    }
}

/// Resolved runtime configuration: file → environment → CLI.
#[derive(Debug, Clone)]
pub struct ConvoConfig {
    pub config_dir: PathBuf,
    pub toml: ConvoToml,
    /// Environment overrides that were skipped; logged once logging is up.
    pub env_warnings: Vec<String>,
}

impl ConvoConfig {
    /// Load from `<base_dir>/.convo/convo.toml` and apply process environment.
    pub fn load(base_dir: &Path) -> Result<Self> {
        let config_dir = base_dir.join(CONFIG_DIR);
        let mut toml = ConvoToml::load_or_default(&config_dir)?;
        let env_warnings = toml.apply_env(|key| std::env::var(key).ok());
        Ok(Self {
            config_dir,
            toml,
            env_warnings,
        })
    }

    /// Apply CLI overrides on top of file and environment settings.
    pub fn with_cli_args(mut self, url: Option<String>, max_attempts: Option<u32>) -> Self {
        if let Some(url) = url {
            self.toml.connection.url = url;
        }
        if let Some(n) = max_attempts {
            self.toml.connection.max_attempts = n;
        }
        self
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Settings for a [`ConnectionManager`](crate::manager::ConnectionManager).
    pub fn manager_config(&self) -> ManagerConfig {
        let conn = &self.toml.connection;
        ManagerConfig {
            endpoint: conn.url.clone(),
            policy: conn.reconnect_policy(),
            ping_interval: Duration::from_millis(conn.ping_interval_ms),
            pong_timeout: Duration::from_millis(conn.pong_timeout_ms),
            connect_timeout: Duration::from_millis(conn.connect_timeout_ms),
        }
    }
}
