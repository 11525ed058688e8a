//! Configuration for the riptide server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::ProtocolType;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// How readiness is reported for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Notify once per readiness transition.
    Edge,
    /// Notify as long as the condition holds.
    Level,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "riptide")]
#[command(version = "0.1.0")]
#[command(about = "A readiness-driven TCP server core", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker threads (0 = number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Idle connection timeout in milliseconds (0 disables eviction)
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

    /// Wire protocol served to clients
    #[arg(long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Wire protocol served to clients
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolType,
    /// Set SO_LINGER on accepted sockets
    #[serde(default)]
    pub linger: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            protocol: default_protocol(),
            linger: false,
        }
    }
}

/// Runtime-related configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    #[serde(default)]
    pub workers: usize,
    /// Idle connection timeout in milliseconds (0 disables eviction)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Trigger mode for the listening socket
    #[serde(default = "default_trigger")]
    pub listener_trigger: TriggerMode,
    /// Trigger mode for connection sockets
    #[serde(default = "default_trigger")]
    pub conn_trigger: TriggerMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            idle_timeout_ms: default_idle_timeout_ms(),
            listener_trigger: default_trigger(),
            conn_trigger: default_trigger(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1316
}

fn default_max_connections() -> usize {
    65536
}

fn default_protocol() -> ProtocolType {
    ProtocolType::Echo
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_trigger() -> TriggerMode {
    TriggerMode::Edge
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub max_connections: usize,
    pub idle_timeout_ms: u64,
    pub listener_trigger: TriggerMode,
    pub conn_trigger: TriggerMode,
    pub protocol: ProtocolType,
    pub linger: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let toml = TomlConfig::default();
        Self {
            host: toml.server.host,
            port: toml.server.port,
            workers: toml.runtime.workers,
            max_connections: toml.server.max_connections,
            idle_timeout_ms: toml.runtime.idle_timeout_ms,
            listener_trigger: toml.runtime.listener_trigger,
            conn_trigger: toml.runtime.conn_trigger,
            protocol: toml.server.protocol,
            linger: toml.server.linger,
            log_level: toml.logging.level,
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::merge(cli)
    }

    fn merge(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            workers: cli.workers.unwrap_or(toml_config.runtime.workers),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            idle_timeout_ms: cli
                .idle_timeout_ms
                .unwrap_or(toml_config.runtime.idle_timeout_ms),
            listener_trigger: toml_config.runtime.listener_trigger,
            conn_trigger: toml_config.runtime.conn_trigger,
            protocol: cli.protocol.unwrap_or(toml_config.server.protocol),
            linger: toml_config.server.linger,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 1316);
        assert_eq!(config.workers, 0);
        assert_eq!(config.max_connections, 65536);
        assert_eq!(config.idle_timeout_ms, 60_000);
        assert_eq!(config.listener_trigger, TriggerMode::Edge);
        assert_eq!(config.conn_trigger, TriggerMode::Edge);
        assert_eq!(config.protocol, ProtocolType::Echo);
        assert!(!config.linger);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 8080
            max_connections = 1024
            protocol = "ping"
            linger = true

            [runtime]
            workers = 4
            idle_timeout_ms = 5000
            listener_trigger = "level"
            conn_trigger = "edge"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.max_connections, 1024);
        assert_eq!(config.server.protocol, ProtocolType::Ping);
        assert!(config.server.linger);
        assert_eq!(config.runtime.workers, 4);
        assert_eq!(config.runtime.idle_timeout_ms, 5000);
        assert_eq!(config.runtime.listener_trigger, TriggerMode::Level);
        assert_eq!(config.runtime.conn_trigger, TriggerMode::Edge);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
            [server]
            port = 9000
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.runtime.idle_timeout_ms, 60_000);
    }
}
