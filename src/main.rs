//! NetFusion - Entry Point
//!
//! Starts one proxy session over the uplinks named in `NETFUSION_UPLINKS`
//! and stops it on Ctrl+C, SIGTERM or session failure.

use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use netfusion::config::{Config, LogConfig};
use netfusion::{LifecycleController, ProxyEvent, ProxyState, UplinkSet};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(&config.log);

    info!("Starting NetFusion");

    let uplinks =
        UplinkSet::from_config(&config.uplinks).context("invalid NETFUSION_UPLINKS")?;
    uplinks
        .probe()
        .context("uplink address is not assigned on this host")?;
    info!("Using {} uplinks", uplinks.len());

    let controller = LifecycleController::new(config.proxy.clone());

    let mut events = controller.subscribe();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ProxyEvent::Status { message, .. }) => {
                    info!(target: "netfusion::events", "{}", message)
                }
                Ok(ProxyEvent::Error { message, .. }) => {
                    error!(target: "netfusion::events", "{}", message)
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event log lagged, skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut states = controller.state_changes();
    let addr = controller
        .start(uplinks)
        .await
        .context("failed to start proxy")?;
    info!("Configure clients to use http://{} as their HTTP proxy", addr);

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        _ = states.wait_for(|state| *state == ProxyState::Failed) => {
            warn!("Proxy session failed");
        }
    }

    let stats = controller.stop().await.context("failed to stop proxy")?;
    info!(
        "Session statistics: {}",
        serde_json::to_string(&stats).context("failed to serialise statistics")?
    );

    drop(controller);
    let _ = tokio::time::timeout(Duration::from_secs(1), event_task).await;

    info!("NetFusion stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("netfusion={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
