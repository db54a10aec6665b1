#![warn(missing_docs)]

//! docshard-mgmt binary entry point.

use anyhow::Result;
use clap::Parser;
use docshard_mgmt::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if cli.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    tracing::info!("docshard management CLI starting...");

    cli.run().await
}
