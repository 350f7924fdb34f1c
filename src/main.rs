//! PolyQL Server
//!
//! Run with: cargo run
//!
//! Environment variables:
//! - POLYQL_HOST: Bind address (default: 0.0.0.0)
//! - POLYQL_PORT: Port number (default: 8086)
//! - POLYQL_ENGINE_URL: Execution engine base URL (default: http://127.0.0.1:9000)
//! - POLYQL_QUERY_TIMEOUT_SECS: Default per-query timeout (default: 30)
//! - RUST_LOG: Log level (default: info)
//!
//! Cluster configuration:
//! - POLYQL_NODE_ID: Unique identifier for this node (default: node-1)
//! - POLYQL_ADVERTISE_ADDR: Address this node advertises to peers (default: 127.0.0.1:PORT)
//! - POLYQL_ENGINE_ADDR: Engine holding this node's shards (default: advertise address)
//! - POLYQL_PEERS: Comma-separated peers, `id@addr` or bare `addr`

use polyql::api::{run_server, ServerConfig};
use polyql::cluster::ClusterConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "polyql=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let defaults = ServerConfig::default();
    let host = std::env::var("POLYQL_HOST").unwrap_or(defaults.host);
    let port: u16 = std::env::var("POLYQL_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(defaults.port);
    let engine_url = std::env::var("POLYQL_ENGINE_URL").unwrap_or(defaults.engine_url);
    let query_timeout_secs = std::env::var("POLYQL_QUERY_TIMEOUT_SECS")
        .ok()
        .and_then(|t| t.parse().ok())
        .unwrap_or(defaults.query_timeout_secs);

    let mut cluster_config = ClusterConfig::from_env();
    if std::env::var("POLYQL_ADVERTISE_ADDR").is_err() {
        cluster_config.advertise_addr = format!("127.0.0.1:{}", port);
    }

    let config = ServerConfig {
        host,
        port,
        engine_url,
        query_timeout_secs,
        cluster_config,
    };

    tracing::info!("PolyQL configuration:");
    tracing::info!("  Host: {}:{}", config.host, config.port);
    tracing::info!("  Engine: {}", config.engine_url);
    tracing::info!("  Query timeout: {} seconds", config.query_timeout_secs);
    for peer in &config.cluster_config.peers {
        tracing::info!("    - {} @ {}", peer.id, peer.addr);
    }

    run_server(config).await
}
