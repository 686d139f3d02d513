//! Broker configuration.
//!
//! Settings are layered: a TOML file (default: `mqrelay.toml`) over built-in
//! defaults, then `MQRELAY__` environment variables on top (double
//! underscore for nesting, e.g. `MQRELAY__SERVER__BIND=0.0.0.0:1884` or
//! `MQRELAY__LOG__LEVEL=debug`). The file itself may reference environment
//! variables as `${VAR}` or `${VAR:-fallback}`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

/// Default CONNECT deadline in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Expand `${VAR}` and `${VAR:-fallback}` references against the process
/// environment before the file content is parsed. An unset variable without
/// a fallback expands to the empty string.
fn expand_env_refs(content: &str) -> String {
    let reference = Regex::new(r"\$\{(?P<body>[^}]*)\}").expect("env reference pattern");
    reference
        .replace_all(content, |caps: &regex::Captures| {
            let body = &caps["body"];
            let (name, fallback) = body.split_once(":-").unwrap_or((body, ""));
            std::env::var(name).unwrap_or_else(|_| fallback.to_string())
        })
        .into_owned()
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,
    /// Server configuration.
    pub server: ServerConfig,
    /// Broker configuration.
    pub broker: BrokerConfig,
    /// Authentication configuration.
    pub auth: AuthConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

fn default_bind() -> SocketAddr {
    "0.0.0.0:1883".parse().expect("static address")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Deadline for the CONNECT packet on a fresh connection.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// user -> password. An empty map allows all connections.
    pub logins: HashMap<String, String>,
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Config(config::ConfigError),
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable
    /// overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("broker.connect_timeout_ms", DEFAULT_CONNECT_TIMEOUT_MS as i64)?;

        // load from file, expanding ${VAR} references first
        let path = path.as_ref();
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => {
                    let expanded = expand_env_refs(&content);
                    builder = builder.add_source(File::from_str(&expanded, FileFormat::Toml));
                }
                Err(e) => return Err(ConfigError::Io(e)),
            }
        }

        // override with environment variables (MQRELAY__SERVER__BIND, etc.)
        let cfg = builder
            .add_source(
                Environment::with_prefix("MQRELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (for testing).
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_refs(content);
        let config: Config = toml::from_str(&expanded)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.connect_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "connect_timeout_ms must be at least 1".into(),
            ));
        }

        for (user, password) in &self.auth.logins {
            if user.is_empty() || password.is_empty() {
                return Err(ConfigError::Validation(
                    "auth.logins entries must have non-empty user and password".into(),
                ));
            }
        }

        Ok(())
    }
}
