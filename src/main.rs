//! Spread Scanner - Main Entry Point
//!
//! Loads configuration, wires the scanner service, starts the config
//! watcher when a file is given, and serves the HTTP API until shutdown.

use anyhow::Result;
use clap::{Parser, Subcommand};
use spread_scanner::config::{Config, ConfigWatcher};
use spread_scanner::{server, ScannerService};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Spread Scanner CLI
#[derive(Parser)]
#[command(name = "spread-scanner")]
#[command(version, about = "Concurrent market-scanning service")]
struct Cli {
    /// Path to a TOML configuration file; changes are hot-reloaded
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Pick up SCANNER__* overrides from a local .env during development
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.validate()?;

    if let Some(Commands::CheckConfig) = cli.command {
        println!("configuration OK");
        return Ok(());
    }

    init_logging(&config.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.server.bind_address,
        max_concurrency = config.scanner.max_concurrency,
        provider = ?config.provider.kind,
        "Starting spread scanner"
    );

    let service = Arc::new(ScannerService::new(config, cli.config.clone())?);

    // Hot reload only applies when the configuration came from a file.
    // The watcher must stay alive for the lifetime of the server.
    let _watcher = match &cli.config {
        Some(path) => {
            let reload_service = service.clone();
            Some(ConfigWatcher::spawn(path.clone(), move || {
                let service = reload_service.clone();
                async move { service.reload_config().await }
            })?)
        }
        None => {
            warn!("No configuration file given, hot reload disabled");
            None
        }
    };

    server::serve(service).await?;

    info!("Spread scanner shutdown complete");
    Ok(())
}

/// Initialize logging with file output alongside stdout.
fn init_logging(log_level: &str) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::daily("logs", "spread-scanner.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep the writer flushing for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("spread_scanner={log_level},info"))),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}
