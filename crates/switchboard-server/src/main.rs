use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use switchboard::JsonlSink;
use switchboard_server::{app, bootstrap, logging};
use tracing::info;

#[derive(Parser)]
#[command(name = "switchboardd", author, version, about = "Tier-routing chat completion gateway")]
struct Cli {
    /// Path to the gateway configuration document.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Path to the persisted model health stats.
    #[arg(long, default_value = "model_stats.v1.json")]
    stats: PathBuf,

    /// Path to the JSONL request log.
    #[arg(long, default_value = "requests.jsonl")]
    request_log: PathBuf,

    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:6688")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::setup_logging();
    let cli = Cli::parse();

    let sink = Arc::new(JsonlSink::spawn(cli.request_log.clone()));
    let state = bootstrap(&cli.config, &cli.stats, sink)?;

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app(state)).await?;
    Ok(())
}
