//! Coordinator server for the mosaic commit system.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use mosaic_core::UdpTransport;
use mosaic_coordinator::{api, Coordinator, CoordinatorWal, TxnConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "coordinator")]
#[command(about = "Run the mosaic commit coordinator")]
struct Args {
    /// UDP port for participant traffic
    port: u16,

    /// Participant address table entry, `name=host:port`; repeatable
    #[arg(short, long = "peer", value_parser = parse_peer)]
    peers: Vec<(String, SocketAddr)>,

    /// Bind address for the HTTP submission API
    #[arg(long, default_value = "0.0.0.0:9090")]
    api_bind: SocketAddr,

    /// Working directory for artifacts and the log
    #[arg(short, long, default_value = ".")]
    workdir: PathBuf,

    /// Write-ahead log filename, relative to the working directory
    #[arg(long, default_value = "log")]
    log_file: PathBuf,

    /// Voting window in milliseconds
    #[arg(long, default_value_t = 3000)]
    vote_window_ms: u64,

    /// Retransmission window in milliseconds
    #[arg(long, default_value_t = 3000)]
    retransmit_window_ms: u64,
}

fn parse_peer(s: &str) -> Result<(String, SocketAddr), String> {
    let (name, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=host:port, got {s:?}"))?;
    let addr = addr.parse().map_err(|e| format!("bad address: {e}"))?;
    Ok((name.to_owned(), addr))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let peers: HashMap<String, SocketAddr> = args.peers.into_iter().collect();
    let transport = UdpTransport::bind(args.port, peers).await?;
    info!(port = args.port, "bound substrate socket");

    let wal = CoordinatorWal::open(args.workdir.join(&args.log_file))?;
    let config = TxnConfig {
        vote_window: Duration::from_millis(args.vote_window_ms),
        retransmit_window: Duration::from_millis(args.retransmit_window_ms),
    };
    let coordinator = Coordinator::new(transport, wal, args.workdir, config);

    // The dispatcher must be pumping before recovery so that participant
    // ACKs reach the resumed transactions.
    let dispatcher = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.dispatch().await })
    };

    coordinator.recover().await?;

    let listener = tokio::net::TcpListener::bind(args.api_bind).await?;
    info!(addr = %args.api_bind, "submission API listening");
    let api_router = api::router(coordinator);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api_router).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    dispatcher.await?;
    Ok(())
}
