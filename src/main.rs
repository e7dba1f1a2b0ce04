//! Crash Round Server
//!
//! Runs the round engine and serves it over WebSocket.

use std::sync::Arc;
use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crash_round::{
    VERSION,
    config::EngineConfig,
    game::{crash_point::CrashPointGenerator, engine::RoundEngine, settlement::SettlementCoordinator},
    network::{AuthConfig, BroadcastFanout, CrashServer, ServerConfig},
    store::InMemoryAccountStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let engine_config = EngineConfig::from_env().context("invalid engine configuration")?;
    let server_config = ServerConfig::from_env().context("invalid server configuration")?;
    let auth_config = AuthConfig::from_env();

    info!("Crash Round Server v{}", VERSION);
    info!(
        "Countdown {:?}, tick {:?}, growth {}, cap {}x",
        engine_config.countdown_duration,
        engine_config.tick_interval,
        engine_config.growth_rate,
        engine_config.max_multiplier
    );
    if !auth_config.is_configured() {
        warn!("No AUTH_SECRET / JWT_SECRET set; every login will fail");
    }

    let store = Arc::new(InMemoryAccountStore::new(server_config.starting_balance));
    let settlement = Arc::new(SettlementCoordinator::from_config(store, &engine_config));
    let fanout = Arc::new(BroadcastFanout::new());

    let generator = CrashPointGenerator::from_entropy(engine_config.max_multiplier);
    let engine = RoundEngine::new(engine_config, Box::new(generator), settlement.clone(), fanout.clone());

    let server = Arc::new(CrashServer::new(
        server_config,
        auth_config,
        settlement,
        fanout,
        engine.watch(),
    ));

    let engine_handle = tokio::spawn(engine.run(server.shutdown_signal()));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            signal_server.shutdown();
        }
    });

    server.run().await.context("server failed")?;
    engine_handle.await.context("round engine panicked")?;

    info!("Shut down cleanly");
    Ok(())
}
