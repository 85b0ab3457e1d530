use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use querydeck::config::ServiceConfig;
use querydeck::logging;
use querydeck::server::Server;
use querydeck::storage::BufferStoreFactory;
use tracing::info;

/// querydeck: SQL batch execution and result paging over JSON-RPC on stdio.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overriding the configuration file.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServiceConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate().context("invalid configuration")?;

    logging::init(&config.logging)?;

    let factory = BufferStoreFactory::from_config(&config.storage);
    info!(
        storage = ?config.storage.kind,
        directory = ?factory.directory(),
        "querydeck starting"
    );

    let server = Server::new(factory, config.execution);
    server
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await?;

    info!("querydeck stopped");
    Ok(())
}
