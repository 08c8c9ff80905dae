//! regionscoped: watches the game client and reports its servers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use regionscope_core::config::RegionScopeConfig;
use regionscope_services::{IpRangeRegistry, MonitorSession};

mod status;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = RegionScopeConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = RegionScopeConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        RegionScopeConfig::default()
    });

    let process_name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config.target.process_name.clone());
    tracing::info!(process = %process_name, "regionscoped starting");

    // Registry
    let registry = Arc::new(
        IpRangeRegistry::from_config(&config.registry).context("failed to build IP range registry")?,
    );
    tracing::info!(
        url = %config.registry.url,
        cache = %config.registry.cache_path.display(),
        "IP range registry ready"
    );

    // Session
    let session = Arc::new(MonitorSession::start(process_name, &config, registry));

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

    let snapshot_printer = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let snapshot = session.latest();
                for (role, target) in [("lobby", &snapshot.lobby), ("game", &snapshot.game)] {
                    match target {
                        Some(t) => tracing::info!(
                            role,
                            endpoint = %t.target.endpoint,
                            target = %t.target.descriptor,
                            rtt_ms = ?t.latency.rtt_ms,
                            stale = t.stale,
                            "  target"
                        ),
                        None => tracing::info!(role, "  no target"),
                    }
                }
            }
        })
    };

    let status_server = if config.api.enabled {
        let state = status::StatusState {
            session: session.clone(),
        };
        let port = config.api.port;
        Some(tokio::spawn(async move {
            if let Err(e) = status::serve(state, port).await {
                tracing::error!(error = %e, "status server failed");
            }
        }))
    } else {
        None
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = snapshot_printer    => tracing::error!("snapshot printer exited: {:?}", r),
    }

    if let Some(server) = status_server {
        server.abort();
    }
    session.stop().await;

    Ok(())
}
