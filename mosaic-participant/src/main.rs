//! Participant node for the mosaic commit system.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use mosaic_core::UdpTransport;
use mosaic_participant::{Participant, ParticipantWal, Policy};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "participant")]
#[command(about = "Run a mosaic participant node")]
struct Args {
    /// UDP port for coordinator traffic
    port: u16,

    /// Stable participant identifier (the address used in source tuples)
    id: String,

    /// Working directory holding the candidate source files
    #[arg(short, long, default_value = ".")]
    workdir: PathBuf,

    /// Reject every PREPARE instead of approving
    #[arg(long)]
    reject: bool,
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

    let transport = UdpTransport::bind(args.port, HashMap::new()).await?;
    info!(port = args.port, id = %args.id, "bound substrate socket");

    let wal = ParticipantWal::open(args.workdir.join(format!("log_{}.txt", args.id)))?;
    let policy = if args.reject {
        Policy::RejectAll
    } else {
        Policy::ApproveAll
    };
    let participant = Participant::new(args.id, transport, wal, args.workdir, policy);

    participant.recover()?;
    participant.run().await?;
    Ok(())
}
