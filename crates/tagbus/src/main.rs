//! tagbus - the tag bus server
//!
//! # Usage
//!
//! ```bash
//! # Run the bus on the defaults (127.0.0.1:1324)
//! tagbus
//!
//! # Run with a settings file and verbose logging
//! tagbus serve --config bus.yaml --log-level debug
//!
//! # Override the bind address on the command line
//! tagbus serve --bind 0.0.0.0 --port 2324
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tagbus_config::BusConfig;
use tagbus_server::{BusServer, ServerConfig};

/// Tag bus server for distributed SCADA processes
#[derive(Parser, Debug)]
#[command(name = "tagbus")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bus server (the default when no subcommand is given)
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    /// Path to a YAML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address, overrides the settings file
    #[arg(long)]
    bind: Option<String>,

    /// Listen port, overrides the settings file
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let args = match cli.command {
        Some(Command::Serve(args)) => args,
        None => cli.serve,
    };

    init_logging(&args.log_level)?;
    serve(args).await
}

async fn serve(args: ServeArgs) -> Result<()> {
    let bus = match &args.config {
        Some(path) => BusConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BusConfig::default(),
    };

    let mut config = ServerConfig::default();
    config.address = args.bind.unwrap_or(bus.address);
    config.port = args.port.unwrap_or(bus.port);

    let server = BusServer::new(config);
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("shutdown requested");
        shutdown.cancel();
    });

    server.run(cancel).await?;
    Ok(())
}

/// Resolve on SIGINT or, on unix, SIGTERM
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Initialize the tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("invalid log level: {}", e))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}
