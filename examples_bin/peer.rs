//! Minimal peer harness: wires `CoreConfig`, tracing, and `Database` into a
//! runnable node. Grounded on the teacher's `main.rs` entry-point shape —
//! parse config, init tracing, construct the long-lived state, run until
//! interrupted.

use clap::Parser;
use graphdb_core::{CoreConfig, Database};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CoreConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let db = Database::open(config.clone()).await?;
    tracing::info!(actor_id = %db.get_actor_id(), "graphdb-core peer starting");

    if let Some(port) = config.port {
        db.serve(port).await?;
        tracing::info!(port, "serving replication socket transport");
    }

    for peer in &config.peers {
        if let Err(e) = db.connect(peer).await {
            tracing::warn!(peer, "failed to connect: {e}");
        }
    }

    if let Some(key) = &config.sync_key {
        db.enable_sync(key).await?;
        tracing::info!("dht-discovery sync enabled");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    db.close().await;
    Ok(())
}
