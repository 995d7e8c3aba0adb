//! tetherd — remote-management control plane daemon.

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use tether_api::ApiState;
use tether_core::codec::salt_codec;
use tether_core::config::TetherConfig;
use tether_core::{act, Packet};
use tether_services::{sweep_loop, HealthMonitor, HealthSettings};

#[tokio::main]
async fn main() -> Result<()> {
    let written = TetherConfig::write_default_if_missing();
    let loaded = TetherConfig::load();
    let level = match &loaded {
        Ok(c) => c.log.level.clone(),
        Err(_) => "info".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    if let Err(e) = written {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = loaded.context("failed to load config")?;
    tracing::info!(listen = %config.server.listen, "tetherd starting");

    let salt = salt_codec(&config.server.salt).context("invalid site salt")?;
    let state = ApiState::new(salt, &config);

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let server_task = {
        let state = state.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown.recv().await;
            };
            if let Err(e) = tether_api::serve(state, listener, signal).await {
                tracing::error!(error = %e, "server failed");
            }
        })
    };

    let health_task = tokio::spawn(
        HealthMonitor::new(
            state.hub.clone(),
            state.devices.clone(),
            state.events.clone(),
            HealthSettings {
                ping_every: config.timeouts.ping(),
                idle_check_every: config.timeouts.idle_check(),
                idle_after: config.timeouts.idle(),
                ping_timeout: config.timeouts.event(),
            },
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    let sweep_task = tokio::spawn(sweep_loop(
        state.bridges.clone(),
        config.timeouts.bridge_sweep(),
        config.timeouts.bridge_idle(),
        shutdown_tx.subscribe(),
    ));

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = server_task        => tracing::error!("server task exited: {:?}", r),
        r = health_task        => tracing::error!("health monitor exited: {:?}", r),
        r = sweep_task         => tracing::error!("bridge sweeper exited: {:?}", r),
    }

    state.hub.shutdown(Packet::act(act::OFFLINE)).await;
    tracing::info!("all sessions closed");
    Ok(())
}
