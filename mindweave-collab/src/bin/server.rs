//! `mindweave-server [config.toml]`
//!
//! Runs the sync server with an in-memory document store. Without a config
//! path the defaults are used, which accept no tokens.

use std::sync::Arc;

use log::{error, info, warn};
use mindweave_collab::{Config, MemoryStore, StaticTokens, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => match Config::load(&path) {
            Ok(config) => {
                info!("Loaded configuration from {path}");
                config
            }
            Err(e) => {
                error!("Failed to load {path}: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let auth = StaticTokens::from_config(&config.auth);
    if auth.is_empty() {
        warn!("No auth tokens configured; every upgrade will be rejected with 401");
    }

    info!("Starting Mindweave sync server on {}...", config.server.bind_addr);
    let server = SyncServer::new(config, Arc::new(MemoryStore::new()), Arc::new(auth));
    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        std::process::exit(1);
    }
}
