//! Configuration module for the redirect server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// The connection pool occupancy bitmap is a single `u32`, so a worker can
/// never hold more than 32 connections at once.
pub const MAX_POOL_CAPACITY: usize = 32;

/// Command-line arguments for the redirect server
#[derive(Parser, Debug)]
#[command(name = "redirectd")]
#[command(version = "0.1.0")]
#[command(
    about = "An HTTP server that redirects every request to the same URL with the HTTPS scheme",
    long_about = None
)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:80)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Connections held simultaneously per worker (at most 32)
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Milliseconds an incomplete request may linger before its connection
    /// is dropped
    #[arg(short = 'g', long)]
    pub grace_ms: Option<u64>,

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
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
        }
    }
}

/// Per-worker resource limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    /// Connections held simultaneously per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Grace period for an incomplete request, in milliseconds
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// Bytes reserved per connection for the packed path and host
    #[serde(default = "default_field_buffer_size")]
    pub field_buffer_size: usize,
    /// Size of the shared receive/response scratch buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// What to do when a request overflows the field buffer:
    /// "reply" sends a 414 response, "close" drops the connection silently
    #[serde(default = "default_overflow")]
    pub overflow: String,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            grace_ms: default_grace_ms(),
            field_buffer_size: default_field_buffer_size(),
            buffer_size: default_buffer_size(),
            overflow: default_overflow(),
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

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_connections() -> usize {
    28
}

fn default_grace_ms() -> u64 {
    2000
}

fn default_field_buffer_size() -> usize {
    242
}

fn default_buffer_size() -> usize {
    4096
}

fn default_overflow() -> String {
    "reply".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Policy for requests whose path and host do not fit the field buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Respond with 414 URI Too Long, then close.
    Reply,
    /// Close the connection without a response.
    Close,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: usize,
    pub max_connections: usize,
    pub grace_ms: u64,
    pub field_buffer_size: usize,
    pub buffer_size: usize,
    pub overflow: OverflowPolicy,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli
                .workers
                .or(toml_config.server.workers)
                .unwrap_or_else(num_cpus),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.limits.max_connections),
            grace_ms: cli.grace_ms.unwrap_or(toml_config.limits.grace_ms),
            field_buffer_size: toml_config.limits.field_buffer_size,
            buffer_size: toml_config.limits.buffer_size,
            overflow: match toml_config.limits.overflow.as_str() {
                "reply" => OverflowPolicy::Reply,
                "close" => OverflowPolicy::Close,
                other => return Err(ConfigError::InvalidOverflow(other.to_string())),
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 || self.max_connections > MAX_POOL_CAPACITY {
            return Err(ConfigError::InvalidPoolCapacity(self.max_connections));
        }
        // Room for at least a one-byte path, its NUL separator, and one host byte.
        if self.field_buffer_size < 4 {
            return Err(ConfigError::FieldBufferTooSmall(self.field_buffer_size));
        }
        // The scratch buffer stages an entire response: fixed template plus
        // whatever fits in the field buffer.
        if self.buffer_size < self.field_buffer_size + 256 {
            return Err(ConfigError::BufferTooSmall(self.buffer_size));
        }
        Ok(())
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidOverflow(String),
    InvalidPoolCapacity(usize),
    FieldBufferTooSmall(usize),
    BufferTooSmall(usize),
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
            ConfigError::InvalidOverflow(value) => {
                write!(
                    f,
                    "Invalid overflow policy '{}' (expected 'reply' or 'close')",
                    value
                )
            }
            ConfigError::InvalidPoolCapacity(n) => {
                write!(
                    f,
                    "max_connections must be between 1 and {}, got {}",
                    MAX_POOL_CAPACITY, n
                )
            }
            ConfigError::FieldBufferTooSmall(n) => {
                write!(f, "field_buffer_size must be at least 4 bytes, got {}", n)
            }
            ConfigError::BufferTooSmall(n) => {
                write!(
                    f,
                    "buffer_size must leave room for a full response, got {}",
                    n
                )
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
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.limits.max_connections, 28);
        assert_eq!(config.limits.grace_ms, 2000);
        assert_eq!(config.limits.field_buffer_size, 242);
        assert_eq!(config.limits.overflow, "reply");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:80"
            workers = 4

            [limits]
            max_connections = 16
            grace_ms = 500
            field_buffer_size = 128
            overflow = "close"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:80");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.limits.max_connections, 16);
        assert_eq!(config.limits.grace_ms, 500);
        assert_eq!(config.limits.field_buffer_size, 128);
        assert_eq!(config.limits.overflow, "close");
        assert_eq!(config.logging.level, "debug");
    }

    fn base_config() -> Config {
        Config {
            listen: default_listen(),
            workers: 1,
            max_connections: default_max_connections(),
            grace_ms: default_grace_ms(),
            field_buffer_size: default_field_buffer_size(),
            buffer_size: default_buffer_size(),
            overflow: OverflowPolicy::Reply,
            log_level: default_log_level(),
        }
    }

    #[test]
    fn test_pool_capacity_bounds() {
        let mut config = base_config();
        config.max_connections = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPoolCapacity(0))
        ));

        config.max_connections = 33;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPoolCapacity(33))
        ));

        config.max_connections = 32;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scratch_buffer_must_fit_response() {
        let mut config = base_config();
        config.buffer_size = config.field_buffer_size;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BufferTooSmall(_))
        ));
    }
}
