//! dp5-server binary: registration and/or lookup server for one track

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dp5_core::PlaintextEngine;
use dp5_server::{ServerBuilder, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "dp5-server")]
#[command(about = "DP5 registration and lookup server")]
struct Args {
    /// Server configuration (JSON); defaults to ./dp5-data
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(short, long, default_value = "8443")]
    port: u16,

    /// Serve the combined track
    #[arg(long)]
    combined: bool,

    /// Expose Prometheus metrics on /metrics
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("dp5_server=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if args.combined {
        config.combined = true;
    }
    if config.debug_fast_forward {
        tracing::warn!("Debug fast-forward is enabled; do not run this in production");
    }

    let mut builder = ServerBuilder::new(PlaintextEngine::new(), config).port(args.port);
    if args.metrics {
        builder = builder.prometheus(dp5_server::metrics::init_prometheus_recorder()?);
    }
    let server = builder.build()?;

    tracing::info!(port = args.port, "Server ready");
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}
