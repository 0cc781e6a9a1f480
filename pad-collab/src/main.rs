//! `pad-server <peers-file> <me> [data-dir]`
//!
//! Runs one replica until Ctrl-C. `RUST_LOG` controls log verbosity.

use std::path::PathBuf;

use log::{error, info};
use pad_collab::{PadServer, ServerConfig};

fn usage() -> ! {
    eprintln!("usage: pad-server <peers-file> <me> [data-dir]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(peers_file) = args.next() else { usage() };
    let Some(me) = args.next().and_then(|s| s.parse::<usize>().ok()) else { usage() };

    let mut config = ServerConfig::from_peers_file(&peers_file, me)?;
    config.data_dir = Some(args.next().map_or_else(
        || PathBuf::from(format!("pad_data_{me}")),
        PathBuf::from,
    ));

    info!(
        "Starting peer {me}/{} on {} (data in {:?})",
        config.peers.len(),
        config.listen_addr()?,
        config.data_dir
    );
    let server = PadServer::start(config).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl-C: {e}");
    }
    server.shutdown().await;
    Ok(())
}
