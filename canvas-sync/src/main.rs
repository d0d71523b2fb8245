//! `canvas-relay`: development broker for local whiteboard sessions.
//!
//! Binds `CANVAS_RELAY_ADDR` (default `127.0.0.1:9090`). Log output is
//! controlled by `RUST_LOG`.

use canvas_sync::{RelayConfig, RelayServer};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Ok(addr) = std::env::var("CANVAS_RELAY_ADDR") {
        config.bind_addr = addr;
    }

    info!("Starting canvas relay on {}...", config.bind_addr);
    let relay = RelayServer::new(config);

    tokio::select! {
        result = relay.run() => {
            if let Err(e) = result {
                error!("Relay error: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            relay.shutdown();
        }
    }
}
