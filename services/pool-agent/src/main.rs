//! vpool Pool Agent
//!
//! Serves one pool reconciler per configured viewport over HTTP.
//!
//! ## Architecture
//!
//! - **API**: accepts per-viewport snapshots and whole director scenes
//! - **Registry**: routes each snapshot to its viewport's reconciler
//! - **Runtime**: launches windows from a command template (mock in dev)

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vpool_agent::{
    api,
    config::{Config, RuntimeKind},
    registry::PoolRegistry,
    runtime::{CommandSupervisor, MockRuntime, NoopGeometryApplier, ProcessRuntime},
    scene::SceneDecoder,
    state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to VPOOL_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vpool pool agent");
    info!(
        listen_addr = %config.listen_addr,
        viewports = ?config.viewports,
        runtime = ?config.runtime,
        data_dir = %config.data_dir.display(),
        "Configuration loaded"
    );

    let runtime = match config.runtime {
        RuntimeKind::Mock => {
            warn!("Using mock runtime, no windows will be launched");
            ProcessRuntime::mock(Arc::new(MockRuntime::new()))
        }
        RuntimeKind::Command => {
            let supervisor = CommandSupervisor::new(&config.browser_command, config.stop_timeout)?;
            ProcessRuntime::new(Arc::new(supervisor), Arc::new(NoopGeometryApplier))
        }
    };

    let registry = Arc::new(PoolRegistry::from_config(&config, runtime));
    let state = AppState::new(
        Arc::clone(&registry),
        SceneDecoder::new(config.activity.as_str()),
    );
    let app = api::create_router(state);

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    let shutdown_timeout = std::time::Duration::from_secs(10);
    if !server_handle.is_finished()
        && tokio::time::timeout(shutdown_timeout, &mut server_handle)
            .await
            .is_err()
    {
        warn!("HTTP server did not shut down in time");
    }

    // Windows outlive the agent otherwise.
    for report in registry.teardown_all().await {
        for failure in &report.failures {
            warn!(
                viewport = %report.viewport,
                instance_id = %failure.id,
                error = %failure.error,
                "Instance did not stop cleanly"
            );
        }
    }

    info!("Pool agent shutdown complete");
    Ok(())
}
