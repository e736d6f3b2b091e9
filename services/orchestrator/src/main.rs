//! fleetboot daemon
//!
//! Watches the fleet for crashes and reboots it once a day when the player
//! count drops below the configured threshold.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleetboot_orchestrator::clock::SystemClock;
use fleetboot_orchestrator::config::Config;
use fleetboot_orchestrator::control_plane::HttpControlPlane;
use fleetboot_orchestrator::load::{HttpLoadProbe, LoadProbe, StaticLoad};
use fleetboot_orchestrator::notify::{GuardedNotifier, LogSink, Notifier, WebhookSink};
use fleetboot_orchestrator::orchestrator::{Orchestrator, OrchestratorParts, RecoveryOutcome};
use fleetboot_orchestrator::state::SqliteStore;
use fleetboot_orchestrator::telemetry::PollingTelemetrySource;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        control_plane_url = %config.control_plane_url,
        data_dir = %config.data_dir,
        player_threshold = config.engine.orchestrator.player_threshold,
        "Starting fleetboot"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir))?;
    let store = Arc::new(SqliteStore::open(Path::new(&config.data_dir).join("fleetboot.db"))?);

    let control_plane = Arc::new(HttpControlPlane::new(
        config.control_plane_url.clone(),
        config.control_plane_token.clone(),
    )?);
    let telemetry_source = Arc::new(PollingTelemetrySource::new(
        control_plane.clone(),
        config.engine.telemetry.poll_interval,
    ));

    let notifier: Arc<dyn Notifier> =
        if config.staff_webhook.is_some() || config.public_webhook.is_some() {
            let sink = WebhookSink::new(config.staff_webhook.clone(), config.public_webhook.clone())?;
            Arc::new(GuardedNotifier::new(sink, config.engine.notifier.clone()))
        } else {
            warn!("No webhooks configured, notifications go to the log");
            Arc::new(GuardedNotifier::new(LogSink, config.engine.notifier.clone()))
        };

    let load: Arc<dyn LoadProbe> = match &config.load_url {
        Some(url) => Arc::new(HttpLoadProbe::new(url.clone())?),
        None => {
            warn!("FLEETBOOT_LOAD_URL not set, load is always unavailable");
            let load = StaticLoad::new(0);
            load.set_unavailable(true);
            Arc::new(load)
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorParts {
            control_plane,
            telemetry_source,
            store,
            notifier,
            load,
            clock: Arc::new(SystemClock),
        },
        config.engine.clone(),
    ));

    if let RecoveryOutcome::Recovered { date, successful, total } = orchestrator.recover().await {
        warn!(date = %date, successful, total, "Closed interrupted reboot run");
    }

    match orchestrator.watch_fleet().await {
        Ok(watched) => info!(watched, "Watching fleet"),
        Err(e) => error!(error = %e, "Failed to start fleet health watch"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.run(shutdown_rx).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = loop_handle => {
            if let Err(e) = result {
                error!(error = %e, "Orchestrator task panicked");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    orchestrator.telemetry().stop_all();

    info!("fleetboot shutdown complete");
    Ok(())
}
