mod config;
mod serve;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// TimeBank handshake engine.
#[derive(Parser)]
#[command(name = "timebank", version, about = "TimeBank handshake engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Path to timebank.toml
        #[arg(long)]
        config: Option<PathBuf>,
        /// Port to listen on (overrides [server] port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate a config file and print a summary
    Check {
        /// Path to timebank.toml
        config: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port } => {
            let config = match config {
                Some(path) => load_or_exit(&path),
                None => Config::default(),
            };
            let port = port.unwrap_or(config.server.port);
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("error: failed to create tokio runtime: {}", e);
                    process::exit(1);
                }
            };
            if let Err(e) = rt.block_on(serve::start_server(config, port)) {
                eprintln!("Server error: {}", e);
                process::exit(1);
            }
        }
        Commands::Check { config } => {
            let loaded = load_or_exit(&config);
            println!("{}: ok", config.display());
            println!("{}", loaded.summary());
        }
    }
}

fn load_or_exit(path: &Path) -> Config {
    match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    }
}
