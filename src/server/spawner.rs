// src/server/spawner.rs

//! Spawns the bridge's long-running background tasks.

use super::context::ServerContext;
use super::metrics_server;
use crate::config::BackboneConfig;
use crate::core::backbone::TopicPurgerTask;
use anyhow::Result;
use tracing::info;

/// Spawns all background tasks into the context's JoinSet.
pub fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let state = &ctx.state;
    let shutdown_tx = &ctx.shutdown_tx;
    let background_tasks = &mut ctx.background_tasks;

    // --- Metrics Server ---
    if state.config.metrics.enabled {
        let metrics_state = state.clone();
        let shutdown_rx_metrics = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(metrics_state, shutdown_rx_metrics).await
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    // --- Local Backbone Maintenance ---
    if let (Some(broker), BackboneConfig::Local(local)) =
        (&state.local_broker, &state.config.backbone)
    {
        let purger = TopicPurgerTask::new(broker.clone(), local.purge_interval);
        let shutdown_rx_purge = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            purger.run(shutdown_rx_purge).await;
            Ok(())
        });
    }

    info!("All background tasks have been spawned.");
    Ok(())
}
