//! Logos sync server: collaborative text editing over WebSocket.
//!
//! Configuration comes from `LOGOS_SYNC_*` environment variables (see
//! [`ServerConfig::from_env`]); log output is controlled with `RUST_LOG`.

use std::sync::Arc;

use logos_sync::{MemoryStore, ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    log::info!(
        "Starting logos-sync on {} (max {} participants/room, snapshot every {} ops)",
        config.bind_addr,
        config.room.max_participants,
        config.snapshot_every
    );

    let server = SyncServer::with_persistence(config, Arc::new(MemoryStore::new()));
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutdown requested");
            server.shutdown().await;
        }
    }
    Ok(())
}
