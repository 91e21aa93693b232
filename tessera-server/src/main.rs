//! Tessera store server.
//!
//! Serves one shared world store over WebSocket, optionally saving worlds
//! to disk and running the canonical merge server-side. Every flag falls
//! back to its `TESSERA_*` environment variable, then to the default.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::info;
use tessera_sync::{ServerConfig, StoreServer};

#[derive(Parser, Debug)]
#[command(name = "tessera-server", about = "Real-time world store server")]
struct Args {
    /// Address to listen on (TESSERA_BIND)
    #[arg(long)]
    bind: Option<String>,

    /// Directory for world snapshots (TESSERA_STORAGE_PATH)
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Change-feed buffer per watcher (TESSERA_BROADCAST_CAPACITY)
    #[arg(long)]
    broadcast_capacity: Option<usize>,

    /// Save changed worlds this often (TESSERA_PERSIST_INTERVAL_MS)
    #[arg(long)]
    persist_interval_ms: Option<u64>,

    /// Merge channels server-side this often, 0 to leave it to clients
    /// (TESSERA_SERVER_MERGE_MS)
    #[arg(long)]
    merge_interval_ms: Option<u64>,
}

impl Args {
    fn into_config(self, mut config: ServerConfig) -> ServerConfig {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(path) = self.storage {
            config.storage_path = Some(path);
        }
        if let Some(cap) = self.broadcast_capacity {
            config.broadcast_capacity = cap.max(1);
        }
        if let Some(ms) = self.persist_interval_ms {
            config.persist_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = self.merge_interval_ms {
            config.merge_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config(ServerConfig::from_env());
    info!(
        "Starting tessera-server on {} (storage: {:?}, server merge: {:?})",
        config.bind_addr, config.storage_path, config.merge_interval
    );

    StoreServer::new(config)?.run().await?;
    Ok(())
}
