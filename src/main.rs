use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tuner_bridge::{
    catalog::MemoryCatalog,
    config::Config,
    web::{AppState, WebServer},
};

#[derive(Parser)]
#[command(name = "tuner-bridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A bridging gateway presenting IPTV streams to media servers as a network tuner")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level (overridden by RUST_LOG when set)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::load(&cli.config)?;
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        transcoder = %config.streaming.transcoder_command,
        "starting tuner-bridge"
    );

    // The catalog store is an external collaborator; the standalone
    // binary runs against the in-memory implementation, populated by
    // whatever deployment wiring sits in front of it.
    let catalog = MemoryCatalog::new();

    let state = AppState::build(config, catalog)?;
    let server = WebServer::new(state)?;
    server.run().await
}
