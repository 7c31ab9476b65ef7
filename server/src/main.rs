use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use server::config::ReplayConfig;
use server::service::ReplayService;
use server::sim::SimulatedWorld;

/// Step the simulated world at the tick rate and fire the occasional
/// recording trigger, the way combat and anti-cheat hooks would.
async fn run_simulation(
    service: Arc<ReplayService>,
    world: Arc<SimulatedWorld>,
    tick_rate: u32,
    cancellation_token: CancellationToken,
) {
    let period = Duration::from_secs_f64(1.0 / tick_rate.max(1) as f64);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = cancellation_token.cancelled() => {
                info!("Simulation shutting down");
                break;
            }

            _ = interval.tick() => {
                world.step();

                if let Some(player_id) = world.roll(0.002) {
                    let name = world
                        .players()
                        .into_iter()
                        .find(|(id, _)| *id == player_id)
                        .map(|(_, name)| name)
                        .unwrap_or_default();
                    let reply = service
                        .start_recording(player_id, &name, "combat", "simulated fight")
                        .await;
                    debug!("{}", reply);
                }
                if let Some(player_id) = world.roll(0.001) {
                    let reply = service.stop_recording(player_id).await;
                    debug!("{}", reply);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if exists
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ReplayConfig::from_env().context("Failed to load replay configuration")?;
    info!("Storage directory: {:?}", config.storage_dir);

    let sim_players: usize = env::var("REPLAY_SIM_PLAYERS")
        .ok()
        .map(|v| v.parse().context("REPLAY_SIM_PLAYERS must be a number"))
        .transpose()?
        .unwrap_or(4);
    let seed: u64 = env::var("REPLAY_SIM_SEED")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() as u64);

    let tick_rate = config.server_tick_rate;
    let service = Arc::new(ReplayService::new(config));
    let world = Arc::new(SimulatedWorld::new(seed));
    for i in 0..sim_players {
        let name = format!("player{}", i + 1);
        let id = world.spawn(&name);
        service.orchestrator().lock().await.on_player_join(id, &name);
    }

    service.start(world.clone()).await?;

    let cancellation_token = CancellationToken::new();
    let simulation = tokio::spawn(run_simulation(
        service.clone(),
        world.clone(),
        tick_rate,
        cancellation_token.clone(),
    ));

    // Wait for shutdown signal
    info!(
        "Replay server started with {} simulated players. Waiting for shutdown signal (Ctrl+C)...",
        sim_players
    );
    tokio::signal::ctrl_c().await?;

    info!("Received shutdown signal. Shutting down gracefully...");
    cancellation_token.cancel();
    let _ = simulation.await;
    info!("{}", service.metrics().await);
    service.shutdown().await?;

    info!("Replay server shut down successfully");
    Ok(())
}
