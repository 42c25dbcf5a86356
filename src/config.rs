//! Configuration module for the bulletin board server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. The fault mode
//! is read from the environment once, here, and carried as a typed value.

use crate::fault::{FaultMode, InvalidFaultMode};
use crate::render::HUGE_FILE_BYTES;
use crate::worker::{DEFAULT_MAX_REQUEST, MAX_REQUEST_LIMIT};
use clap::{CommandFactory, FromArgMatches, Parser};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Program name used when the invocation name cannot be determined.
pub const DEFAULT_PROGRAM: &str = "bulletin-server";

/// Command-line arguments for the bulletin board server
#[derive(Parser, Debug)]
#[command(name = "bulletin-server")]
#[command(version)]
#[command(about = "Bulletin board posting server", long_about = None)]
pub struct CliArgs {
    /// Port to listen on (1-65535)
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Directory holding the bulletin board web pages
    #[arg(short = 'd', long)]
    pub board_dir: Option<PathBuf>,

    /// Public url of the bulletin board main page
    #[arg(short = 'u', long)]
    pub board_url: Option<String>,

    /// Maximum request size in bytes (at most 16 MiB)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=MAX_REQUEST_LIMIT as u64))]
    pub max_request: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl CliArgs {
    /// Parse the process arguments. Usage errors exit the process.
    pub fn parse_with_fault_help() -> Self {
        let matches = CliArgs::command()
            .after_help(FaultMode::help_text())
            .get_matches();
        CliArgs::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub board: BoardConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub faults: FaultsConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Port to listen on; validated when merged
    pub port: Option<i64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: None,
        }
    }
}

/// Bulletin board configuration
#[derive(Debug, Deserialize)]
pub struct BoardConfig {
    #[serde(default = "default_board_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_board_url")]
    pub url: String,
    #[serde(default = "default_max_request")]
    pub max_request: usize,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            directory: default_board_dir(),
            url: default_board_url(),
            max_request: default_max_request(),
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

/// Fault injection tuning
#[derive(Debug, Deserialize)]
pub struct FaultsConfig {
    /// Size of the filler file sent in huge file mode
    #[serde(default = "default_huge_file_bytes")]
    pub huge_file_bytes: u64,
}

impl Default for FaultsConfig {
    fn default() -> Self {
        Self {
            huge_file_bytes: default_huge_file_bytes(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_board_dir() -> PathBuf {
    PathBuf::from("./public_html")
}

fn default_board_url() -> String {
    "http://localhost/bulletin_board.php".to_string()
}

fn default_max_request() -> usize {
    DEFAULT_MAX_REQUEST
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_huge_file_bytes() -> u64 {
    HUGE_FILE_BYTES
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub port: u16,
    pub board_dir: PathBuf,
    pub board_url: String,
    pub max_request: usize,
    pub log_level: String,
    pub fault: FaultMode,
    pub huge_file_bytes: u64,
    /// Invocation name of the server, used as worker identity
    pub program: String,
}

impl Config {
    /// Load configuration from CLI args, optional TOML file and environment.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse_with_fault_help();
        let toml_config = match cli.config {
            Some(ref path) => read_toml(path)?,
            None => TomlConfig::default(),
        };
        let fault = FaultMode::from_env()?;

        Config::merge(cli, toml_config, fault, program_name())
    }

    /// Merge CLI args over TOML values.
    pub fn merge(
        cli: CliArgs,
        toml_config: TomlConfig,
        fault: FaultMode,
        program: String,
    ) -> Result<Self, ConfigError> {
        let port = match (cli.port, toml_config.server.port) {
            (Some(port), _) => port,
            (None, Some(port)) => u16::try_from(port)
                .ok()
                .filter(|port| *port != 0)
                .ok_or(ConfigError::InvalidPort(port))?,
            (None, None) => return Err(ConfigError::MissingPort),
        };

        let max_request = cli
            .max_request
            .map(|bytes| bytes as usize)
            .unwrap_or(toml_config.board.max_request);
        if !(1..=MAX_REQUEST_LIMIT).contains(&max_request) {
            return Err(ConfigError::InvalidMaxRequest(max_request));
        }

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            port,
            board_dir: cli.board_dir.unwrap_or(toml_config.board.directory),
            board_url: cli.board_url.unwrap_or(toml_config.board.url),
            max_request,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            fault,
            huge_file_bytes: toml_config.faults.huge_file_bytes,
            program,
        })
    }
}

fn read_toml(path: &Path) -> Result<TomlConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
    toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
}

/// Base name of the running executable.
fn program_name() -> String {
    std::env::args_os()
        .next()
        .and_then(|arg| {
            Path::new(&arg)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_PROGRAM.to_string())
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, toml::de::Error),

    #[error("No port given, use --port or set [server] port in the config file")]
    MissingPort,

    #[error("Invalid port {0}, expected a number between 1 and 65535")]
    InvalidPort(i64),

    #[error("Invalid max_request {0}, expected a number between 1 and {MAX_REQUEST_LIMIT}")]
    InvalidMaxRequest(usize),

    #[error(transparent)]
    InvalidFaultMode(#[from] InvalidFaultMode),
}
