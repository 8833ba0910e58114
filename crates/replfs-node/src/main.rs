use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use replfs_node::{Heartbeater, NodeApi, NodeConfig};

#[derive(Parser)]
#[command(name = "rfs-node")]
#[command(about = "replfs reference storage node", long_about = None)]
struct Args {
    /// TOML or JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Override the node id
    #[arg(long)]
    node_id: Option<String>,
    /// Override the listen address
    #[arg(short, long)]
    bind: Option<SocketAddr>,
    /// Override the data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
    /// File server to register with
    #[arg(long, env = "RFS_COORDINATOR")]
    coordinator: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    if let Some(id) = args.node_id {
        config.node_id = id;
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if args.coordinator.is_some() {
        config.coordinator = args.coordinator;
    }

    let api = Arc::new(NodeApi::from_config(&config).await?);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let port = listener.local_addr()?.port();

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
        }
        token.cancel();
    });

    let heartbeats = config.coordinator.as_ref().map(|coordinator| {
        let hb = Heartbeater::new(
            coordinator.clone(),
            api.clone(),
            config.advertise_address.clone(),
            port,
            Duration::from_secs(config.heartbeat_interval_secs.max(1)),
        );
        tokio::spawn(hb.run(shutdown.child_token()))
    });

    api.serve(listener, shutdown).await?;
    if let Some(h) = heartbeats {
        let _ = h.await;
    }
    Ok(())
}
