//! Configuration module for the linecap server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use crate::protocol::DEFAULT_MAX_LINE_LENGTH;
use crate::server::ShutdownPolicy;
use crate::transform::{EncodingPolicy, TransformKind};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Well-known service port.
pub const DEFAULT_PORT: u16 = 59898;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "linecap")]
#[command(version)]
#[command(about = "A concurrent line-transformation TCP server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (all interfaces by default)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Do not set SO_REUSEADDR on the listening socket
    #[arg(long)]
    pub no_reuse_address: bool,

    /// Reject connections beyond this many concurrent sessions (0 = unbounded)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Transform applied to every line
    #[arg(long, value_enum)]
    pub transform: Option<TransformKind>,

    /// Handling of lines that are not valid UTF-8
    #[arg(long, value_enum)]
    pub encoding: Option<EncodingPolicy>,

    /// Maximum line length in bytes
    #[arg(long)]
    pub max_line_length: Option<usize>,

    /// Close a session after this many idle seconds waiting to read (0 = never)
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Close a session if a write blocks this many seconds (0 = never)
    #[arg(long)]
    pub write_timeout: Option<u64>,

    /// What happens to in-flight sessions on shutdown
    #[arg(long, value_enum)]
    pub shutdown: Option<ShutdownPolicy>,

    /// Seconds to wait for sessions under the drain and abort policies
    #[arg(long)]
    pub drain_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and lifecycle configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub reuse_address: bool,
    /// 0 means unbounded
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default)]
    pub shutdown: ShutdownPolicy,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            reuse_address: true,
            max_connections: 0,
            shutdown: ShutdownPolicy::default(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

/// Per-session configuration
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub transform: TransformKind,
    #[serde(default)]
    pub encoding: EncodingPolicy,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Seconds, 0 disables
    #[serde(default)]
    pub read_timeout: u64,
    /// Seconds, 0 disables
    #[serde(default)]
    pub write_timeout: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transform: TransformKind::default(),
            encoding: EncodingPolicy::default(),
            max_line_length: default_max_line_length(),
            read_timeout: 0,
            write_timeout: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

fn default_log_level() -> String {
    "info".to_string()
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub reuse_address: bool,
    /// `None` is the unbounded default
    pub max_connections: Option<usize>,
    pub shutdown: ShutdownPolicy,
    pub drain_timeout: Duration,
    pub transform: TransformKind,
    pub encoding: EncodingPolicy,
    pub max_line_length: usize,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from already-parsed CLI args.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref config_path) => {
                let contents =
                    std::fs::read_to_string(config_path).map_err(|e| ConfigError::FileRead {
                        path: config_path.clone(),
                        source: e,
                    })?;
                toml::from_str(&contents).map_err(|e| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source: e,
                })?
            }
            None => TomlConfig::default(),
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    // CLI takes precedence over the file
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            session,
            logging,
        } = toml_config;

        let max_connections = cli.max_connections.unwrap_or(server.max_connections);

        Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            reuse_address: !cli.no_reuse_address && server.reuse_address,
            max_connections: (max_connections > 0).then_some(max_connections),
            shutdown: cli.shutdown.unwrap_or(server.shutdown),
            drain_timeout: Duration::from_secs(cli.drain_timeout.unwrap_or(server.drain_timeout)),
            transform: cli.transform.unwrap_or(session.transform),
            encoding: cli.encoding.unwrap_or(session.encoding),
            max_line_length: cli.max_line_length.unwrap_or(session.max_line_length),
            read_timeout: seconds(cli.read_timeout.unwrap_or(session.read_timeout)),
            write_timeout: seconds(cli.write_timeout.unwrap_or(session.write_timeout)),
            log_level: cli.log_level.unwrap_or(logging.level),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "host",
                reason: "must not be empty".to_string(),
            });
        }
        if self.max_line_length == 0 {
            return Err(ConfigError::Invalid {
                field: "max_line_length",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
