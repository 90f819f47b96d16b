//! Phalanx Server
//!
//! Deterministic lockstep match coordinator. Hosts matchmaking and the
//! per-match tick loops; the game simulation itself runs on the clients.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use phalanx::{EngineConfig, GameServer, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env();
    info!("Phalanx Engine v{}", VERSION);
    info!(
        "mode {} at {} tps, listening on {}",
        config.game_mode.preset_name(),
        config.tick_rate,
        config.bind_addr
    );

    let server = Arc::new(GameServer::new(config));
    let mut runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        result = &mut runner => {
            result.context("server task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            server.shutdown();
            runner.await.context("server task panicked")??;
        }
    }

    Ok(())
}
