//! file-stress: remote file storage over a framed TCP protocol
//!
//! Subcommands:
//! - `serve`: file server with a thread-pool or forked-process execution model
//! - `client`: one-shot list/get/upload/delete requests
//! - `stress`: concurrent upload/download benchmark with CSV output
//!
//! Configuration via CLI arguments or TOML file.

mod client;
mod codec;
mod config;
mod connection;
mod dispatch;
mod protocol;
mod server;
mod storage;
mod stress;

use client::Client;
use config::{ClientAction, ClientSettings, Config, Mode, ServerSettings, StressSettings};
use server::Server;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout is reserved for command output
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match config.mode {
        Mode::Serve(settings) => run_server(settings),
        Mode::Client(settings, action) => run_client(settings, action),
        Mode::Stress(settings) => run_stress(settings),
        Mode::StressWorker(args) => Ok(stress::worker::run_child(args)?),
    }
}

fn run_server(settings: ServerSettings) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %settings.listen,
        mode = %settings.mode,
        workers = settings.workers,
        root = %settings.root.display(),
        timeout_s = settings.timeout.map_or(0, |t| t.as_secs()),
        "Starting file server"
    );

    let server = Server::bind(&settings)?;
    server.run()?;
    Ok(())
}

fn run_client(
    settings: ClientSettings,
    action: ClientAction,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::new(settings.server, settings.timeout);

    match action {
        ClientAction::List => {
            for name in client.list()? {
                println!("- {}", name);
            }
        }
        ClientAction::Get { name, output } => {
            let (remote_name, contents) = client.get(&name)?;
            // Never trust the server with a local path
            let local_name = if protocol::validate_filename(&remote_name).is_ok() {
                remote_name
            } else {
                name
            };
            let target = output.unwrap_or_else(|| PathBuf::from(".")).join(&local_name);
            std::fs::write(&target, &contents)?;
            println!("File {} downloaded to {}", local_name, target.display());
        }
        ClientAction::Upload { path } => {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| format!("invalid upload path {}", path.display()))?
                .to_string();
            let contents = std::fs::read(&path)?;
            println!("{}", client.upload(&name, &contents)?);
        }
        ClientAction::Delete { name } => {
            println!("{}", client.delete(&name)?);
        }
    }
    Ok(())
}

fn run_stress(settings: StressSettings) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        server = %settings.server,
        file_sizes = ?settings.file_sizes,
        client_pools = ?settings.client_pools,
        server_pools = ?settings.server_pools,
        executors = ?settings.executors,
        operations = ?settings.operations,
        "Starting stress session"
    );

    if let Some(path) = stress::run(&settings)? {
        println!("Results saved to {}", path.display());
    }
    Ok(())
}
