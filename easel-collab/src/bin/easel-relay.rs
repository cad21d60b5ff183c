//! Board relay.
//!
//! ```text
//! EASEL_RELAY_ADDR=0.0.0.0:9090 EASEL_MAX_PEERS=50 RUST_LOG=info easel-relay
//! ```

use easel_collab::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    log::info!(
        "Starting relay on {} (max {} peers per board, capacity {})",
        config.bind_addr,
        config.max_peers_per_room,
        config.broadcast_capacity
    );
    RelayServer::new(config).run().await
}
