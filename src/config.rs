//! Configuration for the chat server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Reactor backend for the sessions and the acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// mio readiness loop (epoll on Linux, kqueue on macOS)
    #[default]
    Poll,
    /// io_uring completion queue (Linux only)
    Uring,
}

/// Command-line arguments for the chat server
#[derive(Parser, Debug)]
#[command(name = "chatd")]
#[command(version = "0.1.0")]
#[command(about = "A session-based TCP chat server", long_about = None)]
pub struct CliArgs {
    /// Address to bind to (e.g. 127.0.0.1)
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Number of session worker threads (defaults to CPU core count)
    pub threads: Option<usize>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Reactor backend (poll or uring)
    #[arg(long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Size of each pool buffer in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Number of pool buffers per session
    #[arg(long)]
    pub buffer_count: Option<usize>,
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
#[derive(Debug, Deserialize, Default)]
pub struct ServerConfig {
    /// Number of session worker threads (0 = CPU core count)
    #[serde(default)]
    pub threads: usize,
}

/// Reactor and buffer tuning
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Reactor backend
    #[serde(default)]
    pub backend: RuntimeType,
    /// Size of each pool buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Number of pool buffers per session
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,
    /// Events drained per reactor wait
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: RuntimeType::default(),
            buffer_size: default_buffer_size(),
            buffer_count: default_buffer_count(),
            event_capacity: default_event_capacity(),
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

fn default_buffer_size() -> usize {
    1024 // one full frame: 3-byte header + 1021-byte payload
}

fn default_buffer_count() -> usize {
    256
}

fn default_event_capacity() -> usize {
    512
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Session worker threads; 0 means one per hardware thread.
    pub threads: usize,
    pub log_level: String,
    pub runtime: RuntimeType,
    pub buffer_size: usize,
    pub buffer_count: usize,
    pub event_capacity: usize,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let buffer_size = cli.buffer_size.unwrap_or(toml_config.runtime.buffer_size);
        let buffer_count = cli.buffer_count.unwrap_or(toml_config.runtime.buffer_count);
        if buffer_size == 0 || buffer_count == 0 {
            return Err(ConfigError::InvalidBuffers {
                buffer_size,
                buffer_count,
            });
        }

        Ok(Config {
            host: cli.host,
            port: cli.port,
            threads: cli.threads.unwrap_or(toml_config.server.threads),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            runtime: cli.runtime.unwrap_or(toml_config.runtime.backend),
            buffer_size,
            buffer_count,
            event_capacity: toml_config.runtime.event_capacity,
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidBuffers {
        buffer_size: usize,
        buffer_count: usize,
    },
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
            ConfigError::InvalidBuffers {
                buffer_size,
                buffer_count,
            } => {
                write!(
                    f,
                    "Buffer pool must be non-empty (size={buffer_size}, count={buffer_count})"
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}
