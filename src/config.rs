//! Configuration module for compute-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::sync::DEFAULT_STACK_SIZE;
use crate::server::PoolConfig;
use clap::Parser;
use serde::Deserialize;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Smallest worker stack accepted.
const MIN_STACK_SIZE: usize = 16 * 1024;

/// Command-line arguments for the compute server
#[derive(Parser, Debug)]
#[command(name = "compute-server")]
#[command(author = "compute-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A thread-pool server for a line-oriented compute protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on: unix:<path>, a socket path, or host:port
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum connections waiting for a worker (0 = unbounded)
    #[arg(long)]
    pub max_pending: Option<usize>,

    /// Worker thread stack size in bytes
    #[arg(long)]
    pub stack_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Only report errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Report debug messages
    #[arg(short, long)]
    pub verbose: bool,

    /// Report everything, including per-byte tracing
    #[arg(short, long)]
    pub debug: bool,
}

impl CliArgs {
    /// Level forced by an output-mode flag, if any.
    fn output_mode_level(&self) -> Option<&'static str> {
        if self.debug {
            Some("trace")
        } else if self.verbose {
            Some("debug")
        } else if self.quiet {
            Some("error")
        } else {
            None
        }
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum connections waiting for a worker
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Worker thread stack size in bytes
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: default_workers(),
            max_pending: default_max_pending(),
            stack_size: default_stack_size(),
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
    "unix:/tmp/cserver.sock".to_string()
}

fn default_workers() -> usize {
    PoolConfig::default().workers
}

fn default_max_pending() -> usize {
    PoolConfig::default().max_pending
}

fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl FromStr for ListenAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ConfigError::Invalid("empty unix socket path".to_string()));
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        if s.contains('/') {
            return Ok(ListenAddr::Unix(PathBuf::from(s)));
        }

        s.to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(ListenAddr::Tcp)
            .ok_or_else(|| ConfigError::Invalid(format!("cannot resolve listen address '{s}'")))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
            ListenAddr::Tcp(addr) => write!(f, "{addr}"),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: ListenAddr,
    pub workers: usize,
    pub max_pending: usize,
    pub stack_size: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let log_level = match cli.output_mode_level() {
            Some(level) => level.to_string(),
            None if cli.log_level != "info" => cli.log_level.clone(),
            None => toml_config.logging.level,
        };

        let config = Config {
            listen: cli
                .listen
                .as_deref()
                .unwrap_or(&toml_config.server.listen)
                .parse()?,
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            max_pending: cli.max_pending.unwrap_or(toml_config.server.max_pending),
            stack_size: cli.stack_size.unwrap_or(toml_config.server.stack_size),
            log_level,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "stack_size must be at least {MIN_STACK_SIZE} bytes"
            )));
        }
        Ok(())
    }

    /// Worker pool settings.
    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            max_pending: self.max_pending,
            stack_size: self.stack_size,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let argv = std::iter::once("compute-server").chain(args.iter().copied());
        Config::from_args(CliArgs::parse_from(argv))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "unix:/tmp/cserver.sock");
        assert_eq!(config.server.workers, 64);
        assert_eq!(config.server.max_pending, 1024);
        assert_eq!(config.server.stack_size, 128 * 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:7000"
            workers = 4
            max_pending = 16

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:7000");
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.server.max_pending, 16);
        assert_eq!(config.server.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nlisten = \"127.0.0.1:7000\"\nworkers = 4\n[logging]\nlevel = \"warn\""
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = parse(&["-c", &path, "-w", "8"]).unwrap();
        assert_eq!(config.listen, ListenAddr::Tcp("127.0.0.1:7000".parse().unwrap()));
        assert_eq!(config.workers, 8);
        assert_eq!(config.log_level, "warn");

        let config = parse(&["-c", &path, "-d"]).unwrap();
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_output_mode_flags() {
        assert_eq!(parse(&["-q"]).unwrap().log_level, "error");
        assert_eq!(parse(&["-v"]).unwrap().log_level, "debug");
        assert_eq!(parse(&["--log-level", "warn"]).unwrap().log_level, "warn");
        assert_eq!(parse(&[]).unwrap().log_level, "info");
    }

    #[test]
    fn test_listen_addr_parsing() {
        assert_eq!(
            "unix:/tmp/a.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix(PathBuf::from("/tmp/a.sock"))
        );
        assert_eq!(
            "./local.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix(PathBuf::from("./local.sock"))
        );
        assert_eq!(
            "127.0.0.1:9000".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("127.0.0.1:9000".parse().unwrap())
        );
        assert!("unix:".parse::<ListenAddr>().is_err());
        assert!("not an address".parse::<ListenAddr>().is_err());
    }

    #[test]
    fn test_validation() {
        assert!(matches!(parse(&["-w", "0"]), Err(ConfigError::Invalid(_))));
        assert!(matches!(
            parse(&["--stack-size", "1024"]),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            parse(&["-c", "/nonexistent/compute-server.toml"]),
            Err(ConfigError::FileRead(..))
        ));
    }

    #[test]
    fn test_pool_config() {
        let config = parse(&["-w", "3", "--max-pending", "0"]).unwrap();
        assert_eq!(
            config.pool(),
            PoolConfig {
                workers: 3,
                max_pending: 0,
                stack_size: DEFAULT_STACK_SIZE,
            }
        );
    }
}
