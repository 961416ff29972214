mod config;
mod setup;
mod telemetry;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use setup::create_store;
use telemetry::{init_telemetry, log_startup_info};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "caw-server")]
#[command(about = "Workflow orchestration server for coding agents")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Listen address override (default: 127.0.0.1)
    #[arg(long, env = "LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Store path override
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Repository root for per-repo mode (uses <repo>/.caw/workflows.db)
    #[arg(long, env = "CAW_REPO_PATH", conflicts_with = "database_url")]
    repo_path: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Log level override
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(config_file) => {
            info!("Loading configuration from file: {}", config_file);
            Config::from_file(config_file)?
        }
        None => Config::from_env()?,
    };

    if let Some(database_url) = &cli.database_url {
        config.database.url = Some(database_url.clone());
    } else if let Some(repo_path) = &cli.repo_path {
        let repo = std::path::Path::new(repo_path);
        if !repo.is_dir() {
            anyhow::bail!("Repository path does not exist: {repo_path}");
        }
        config.database.url = Some(
            Config::repo_database_path(repo)
                .to_string_lossy()
                .into_owned(),
        );
    }

    if let Some(listen_addr) = &cli.listen_addr {
        config.server.listen_addr = listen_addr.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(log_level) = &cli.log_level {
        config.logging.level = log_level.clone();
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = load_config(&cli).context("Failed to load configuration")?;
    init_telemetry(&config.logging).context("Failed to initialize telemetry")?;

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        std::process::exit(1);
    }
    log_startup_info(&config);

    let store = create_store(&config)
        .await
        .context("Failed to initialize the store")?;

    let addr = config.server_address();
    info!("Workflow server listening on http://{addr}");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM handler");
            let mut sigint =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                    .expect("Failed to register SIGINT handler");
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
                _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
            }
        }

        #[cfg(windows)]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for ctrl+c");
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        let _ = shutdown_tx.send(());
    });

    tokio::select! {
        result = caw_http::serve(store, &addr) => {
            match result {
                Ok(()) => {
                    info!("Server shut down cleanly");
                    Ok(())
                }
                Err(e) => {
                    error!(error = %e, "Server error");
                    std::process::exit(3);
                }
            }
        }
        _ = shutdown_rx => {
            info!("Shutdown signal received, stopping server");
            Ok(())
        }
    }
}
