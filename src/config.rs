//! Configuration module for file-stress.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::stress::Operation;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "file-stress")]
#[command(author = "file-stress authors")]
#[command(version = "0.1.0")]
#[command(about = "Remote file store server, client and stress harness", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the file server
    Serve(ServeArgs),
    /// Issue a single request against a server
    Client(ClientArgs),
    /// Run the stress harness
    Stress(StressArgs),
    /// One harness session inside a child process
    #[command(hide = true)]
    StressWorker(WorkerArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to bind to (e.g., 0.0.0.0:6666)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads or processes
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Execution model
    #[arg(short = 'm', long, value_enum)]
    pub mode: Option<ExecutionMode>,

    /// Directory holding stored files
    #[arg(short = 'r', long)]
    pub root: Option<PathBuf>,

    /// Per-connection read/write deadline in seconds (0 = none)
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server address
    #[arg(short = 's', long)]
    pub server: Option<String>,

    /// Connect/read timeout in seconds (0 = none)
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub action: ClientAction,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// List stored files
    List,
    /// Download a file
    Get {
        name: String,
        /// Directory to write the file into
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Upload a local file
    Upload { path: PathBuf },
    /// Delete a stored file
    Delete { name: String },
}

#[derive(Args, Debug, Default)]
pub struct StressArgs {
    /// Server address
    #[arg(short = 's', long)]
    pub server: Option<String>,

    /// Test file sizes in MiB
    #[arg(long, value_delimiter = ',')]
    pub file_sizes: Option<Vec<u64>>,

    /// Concurrent client counts
    #[arg(long, value_delimiter = ',')]
    pub client_pools: Option<Vec<usize>>,

    /// Server worker counts (informational; reconfigure the server between values)
    #[arg(long, value_delimiter = ',')]
    pub server_pools: Option<Vec<usize>>,

    /// Client-side executor
    #[arg(short = 'e', long, value_enum)]
    pub executor: Option<ExecutorChoice>,

    /// Operations to run, in order
    #[arg(long, value_delimiter = ',', value_enum)]
    pub operations: Option<Vec<Operation>>,

    /// Directory for generated test files and downloads
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// CSV output path
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Per-request timeout in seconds (0 = none)
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Wait for ENTER before each server pool size
    #[arg(long)]
    pub wait_for_operator: bool,

    /// Compare downloaded bytes against the source file
    #[arg(long)]
    pub verify: bool,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[arg(long)]
    pub server: String,
    #[arg(long, value_enum)]
    pub operation: Operation,
    #[arg(long)]
    pub file: PathBuf,
    #[arg(long)]
    pub worker_id: usize,
    #[arg(long, default_value_t = 0)]
    pub timeout: u64,
    #[arg(long)]
    pub download_dir: PathBuf,
    #[arg(long)]
    pub verify: bool,
}

/// Server execution model
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Fixed pool of threads behind one accept loop
    Thread,
    /// Forked processes, each accepting on the shared socket
    Process,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Thread => write!(f, "thread"),
            ExecutionMode::Process => write!(f, "process"),
        }
    }
}

/// Harness executor selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorChoice {
    Thread,
    Process,
    Both,
}

impl ExecutorChoice {
    /// Executors to run for each configuration, in order
    pub fn modes(&self) -> Vec<ExecutionMode> {
        match self {
            ExecutorChoice::Thread => vec![ExecutionMode::Thread],
            ExecutorChoice::Process => vec![ExecutionMode::Process],
            ExecutorChoice::Both => vec![ExecutionMode::Thread, ExecutionMode::Process],
        }
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub stress: StressConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_mode")]
    pub mode: ExecutionMode,
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Per-connection deadline in seconds
    #[serde(default = "default_server_timeout")]
    pub timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: default_workers(),
            mode: default_mode(),
            root: default_root(),
            timeout: default_server_timeout(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_addr")]
    pub server: String,
    #[serde(default = "default_client_timeout")]
    pub timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_server_addr(),
            timeout: default_client_timeout(),
        }
    }
}

/// Stress harness configuration
#[derive(Debug, Deserialize)]
pub struct StressConfig {
    /// Falls back to `[client] server`
    pub server: Option<String>,
    #[serde(default = "default_file_sizes")]
    pub file_sizes: Vec<u64>,
    #[serde(default = "default_pools")]
    pub client_pools: Vec<usize>,
    #[serde(default = "default_pools")]
    pub server_pools: Vec<usize>,
    #[serde(default = "default_executor")]
    pub executor: ExecutorChoice,
    #[serde(default = "default_operations")]
    pub operations: Vec<Operation>,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    pub output: Option<PathBuf>,
    #[serde(default = "default_stress_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub wait_for_operator: bool,
    #[serde(default)]
    pub verify: bool,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            server: None,
            file_sizes: default_file_sizes(),
            client_pools: default_pools(),
            server_pools: default_pools(),
            executor: default_executor(),
            operations: default_operations(),
            work_dir: default_work_dir(),
            output: None,
            timeout: default_stress_timeout(),
            wait_for_operator: false,
            verify: false,
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

fn default_listen() -> String {
    "0.0.0.0:6666".to_string()
}

fn default_workers() -> usize {
    5
}

fn default_mode() -> ExecutionMode {
    ExecutionMode::Thread
}

fn default_root() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_server_timeout() -> u64 {
    60
}

fn default_server_addr() -> String {
    "127.0.0.1:6666".to_string()
}

fn default_client_timeout() -> u64 {
    60
}

fn default_file_sizes() -> Vec<u64> {
    vec![10]
}

fn default_pools() -> Vec<usize> {
    vec![1]
}

fn default_executor() -> ExecutorChoice {
    ExecutorChoice::Thread
}

fn default_operations() -> Vec<Operation> {
    vec![Operation::Upload, Operation::Download]
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_stress_timeout() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Seconds to an optional deadline, 0 meaning none
pub fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Resolved server settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: String,
    pub workers: usize,
    pub mode: ExecutionMode,
    pub root: PathBuf,
    pub timeout: Option<Duration>,
}

/// Resolved client settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server: String,
    pub timeout: Option<Duration>,
}

/// Resolved harness settings
#[derive(Debug, Clone)]
pub struct StressSettings {
    pub server: String,
    pub file_sizes: Vec<u64>,
    pub client_pools: Vec<usize>,
    pub server_pools: Vec<usize>,
    pub executors: Vec<ExecutionMode>,
    pub operations: Vec<Operation>,
    pub work_dir: PathBuf,
    pub output: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub wait_for_operator: bool,
    pub verify: bool,
}

/// What the binary was asked to do
#[derive(Debug)]
pub enum Mode {
    Serve(ServerSettings),
    Client(ClientSettings, ClientAction),
    Stress(StressSettings),
    StressWorker(WorkerArgs),
}

/// Final resolved configuration
#[derive(Debug)]
pub struct Config {
    pub log_level: String,
    pub mode: Mode,
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

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let log_level = cli.log_level.unwrap_or(file.logging.level);

        let mode = match cli.command {
            CliCommand::Serve(args) => {
                let settings = ServerSettings {
                    listen: args.listen.unwrap_or(file.server.listen),
                    workers: args.workers.unwrap_or(file.server.workers),
                    mode: args.mode.unwrap_or(file.server.mode),
                    root: args.root.unwrap_or(file.server.root),
                    timeout: timeout_from_secs(args.timeout.unwrap_or(file.server.timeout)),
                };
                if settings.workers == 0 {
                    return Err(ConfigError::Invalid("workers must be at least 1".into()));
                }
                Mode::Serve(settings)
            }
            CliCommand::Client(args) => Mode::Client(
                ClientSettings {
                    server: args.server.unwrap_or(file.client.server),
                    timeout: timeout_from_secs(args.timeout.unwrap_or(file.client.timeout)),
                },
                args.action,
            ),
            CliCommand::Stress(args) => {
                let stress = file.stress;
                let settings = StressSettings {
                    server: args
                        .server
                        .or(stress.server)
                        .unwrap_or(file.client.server),
                    file_sizes: args.file_sizes.unwrap_or(stress.file_sizes),
                    client_pools: args.client_pools.unwrap_or(stress.client_pools),
                    server_pools: args.server_pools.unwrap_or(stress.server_pools),
                    executors: args.executor.unwrap_or(stress.executor).modes(),
                    operations: args.operations.unwrap_or(stress.operations),
                    work_dir: args.work_dir.unwrap_or(stress.work_dir),
                    output: args.output.or(stress.output),
                    timeout: timeout_from_secs(args.timeout.unwrap_or(stress.timeout)),
                    wait_for_operator: args.wait_for_operator || stress.wait_for_operator,
                    verify: args.verify || stress.verify,
                };
                settings.validate()?;
                Mode::Stress(settings)
            }
            CliCommand::StressWorker(args) => Mode::StressWorker(args),
        };

        Ok(Config { log_level, mode })
    }
}

impl StressSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.file_sizes.is_empty() || self.file_sizes.contains(&0) {
            return Err(ConfigError::Invalid(
                "file sizes must be a non-empty list of positive MiB values".into(),
            ));
        }
        if self.client_pools.is_empty() || self.client_pools.contains(&0) {
            return Err(ConfigError::Invalid(
                "client pools must be a non-empty list of positive counts".into(),
            ));
        }
        if self.server_pools.is_empty() {
            return Err(ConfigError::Invalid("server pools must not be empty".into()));
        }
        if self.operations.is_empty() {
            return Err(ConfigError::Invalid("no operations selected".into()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
