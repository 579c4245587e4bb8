//! `ha-signer` daemon binary.
//!
//! `init` prepares the config directory; `start` runs the signer until
//! interrupted.

use clap::{Parser, Subcommand};
use ha_signer::config::{self, Config, SEED_FILE_NAME};
use ha_signer::{ServerConfig, SignerIdentity, SignerServer};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// High-availability remote signer for validators.
#[derive(Parser, Debug)]
#[command(name = "ha-signer")]
#[command(about = "Rank-based failover signer with double-sign protection")]
#[command(version)]
struct Args {
    /// Config directory (defaults to $HOME/.ha-signer)
    #[arg(long, global = true, env = config::CONFIG_DIR_ENV)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the config directory, a config template and the connection seed
    Init,
    /// Run the signer
    Start,
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.to_ascii_lowercase())),
        )
        .init();
}

fn main() {
    let args = Args::parse();

    let dir = match args.config_dir.map(Ok).unwrap_or_else(config::config_dir) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    match args.command {
        Command::Init => init(dir),
        Command::Start => start(dir),
    }
}

fn init(dir: PathBuf) {
    init_logging("info");

    if let Err(e) = config::init_dir(&dir) {
        error!("Failed to create config directory {:?}: {}", dir, e);
        std::process::exit(1);
    }
    match config::write_template(&dir) {
        Ok(true) => info!("Wrote config template to {:?}", dir.join(config::CONFIG_FILE_NAME)),
        Ok(false) => info!("Keeping existing {:?}", dir.join(config::CONFIG_FILE_NAME)),
        Err(e) => {
            error!("Failed to write config template: {}", e);
            std::process::exit(1);
        }
    }

    let seed_path = dir.join(SEED_FILE_NAME);
    if seed_path.exists() {
        info!("Keeping existing connection seed {:?}", seed_path);
    } else if let Err(e) = SignerIdentity::generate_seed_file(&seed_path) {
        error!("Failed to generate connection seed: {}", e);
        std::process::exit(1);
    }
}

fn start(dir: PathBuf) {
    // Logging needs the configured level, so a config error is reported
    // before the subscriber exists.
    let config = match Config::load_from_dir(&dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration in {:?}: {}", dir, e);
            std::process::exit(1);
        }
    };
    init_logging(config.log_level());

    info!("Starting ha-signer");
    info!("Config directory: {:?}", dir);
    info!("Key file: {:?}", config.file_pv.key_file_path);
    info!("State file: {:?}", config.file_pv.state_file_path);

    let server_config = match ServerConfig::from_config(&config, &dir) {
        Ok(c) => c,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let server = match SignerServer::new(server_config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create server: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received, shutting down");
                    shutdown.cancel();
                }
                Err(e) => error!("Failed to listen for interrupt: {}", e),
            }
        });
        server.run(cancel).await
    });

    if let Err(e) = result {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
