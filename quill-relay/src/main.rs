//! Quill relay: pairs the two sides of each peer link and pipes frames
//! between them over WebSocket.
//!
//! Configured from the environment: `QUILL_RELAY_ADDR` (default
//! `127.0.0.1:9190`) and `QUILL_RELAY_PAIR_TIMEOUT_SECS` (default 30).
//! Log level follows `RUST_LOG`.

use log::{error, info};
use quill_sync::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RelayConfig::from_env();
    info!(
        "starting quill relay on {} (pair timeout {:?})",
        config.bind_addr, config.pair_timeout
    );

    let server = RelayServer::new(config);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats();
            info!(
                "shutting down: {} connections, {} pairs, {} frames relayed",
                stats.total_connections, stats.pairs_formed, stats.frames_relayed
            );
        }
    }
}
