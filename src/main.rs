use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tftpd::{Cli, Server, StaticPayload};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Cli::parse();
    let payload = StaticPayload::from_path(&args.payload)
        .with_context(|| format!("failed to read {}", args.payload.display()))?;
    info!("serving {} ({} bytes)", args.payload.display(), payload.len());

    let server = Arc::new(Server::bind(args.config(), payload).await?);

    let signal = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutting down");
                signal.shutdown();
            }
            Err(e) => warn!("failed to listen for ctrl-c: {e}"),
        }
    });

    server.serve().await
}
