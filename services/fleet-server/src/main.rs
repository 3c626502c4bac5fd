//! fleetd
//!
//! Coordinates a fleet of build VMs: serves the operator and bootstrap API,
//! runs queue consumers for provisioning and lifecycle jobs, and keeps the
//! fleet cache in step with the provider.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleet_server::{
    api::{self, auth::AuthGate},
    cleanup::{CleanupWorker, CleanupWorkerConfig},
    config::{self, Config},
    db::Database,
    jobs::{build_registry, BootstrapRenderer},
    notify::{Notifier, NullNotifier, SlackNotifier, TracingReporter},
    provider::{CloudProvider, FakeProvider, HttpProvider},
    reconcile::{Ec2Sync, Keepalive, PeriodicJob, ReconciliationLoop},
    state::AppState,
    workers::WorkerDispatcher,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn provider_from_config(config: &Config) -> Result<Arc<dyn CloudProvider>> {
    match &config.provider.url {
        Some(url) if !config.dev_mode => {
            info!(url = %url, region = %config.provider.region, "Using provider gateway");
            Ok(Arc::new(HttpProvider::new(
                url.clone(),
                config.provider.region.clone(),
                config.provider.token.clone(),
            )?))
        }
        _ => {
            warn!("Using in-memory fake provider");
            Ok(Arc::new(FakeProvider::new()))
        }
    }
}

fn notifier_from_config(config: &Config) -> Result<Arc<dyn Notifier>> {
    match &config.slack.webhook_url {
        Some(url) => Ok(Arc::new(SlackNotifier::new(
            url.clone(),
            config.slack.channel.clone(),
        )?)),
        None => {
            info!("Slack webhook not configured, notifications disabled");
            Ok(Arc::new(NullNotifier))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleetd");
    info!(
        listen_addr = %config.listen_addr,
        public_url = %config.public_url,
        dev_mode = config.dev_mode,
        "Configuration loaded"
    );

    // Connect to the store
    let db = match Database::connect(&config.store).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "Failed to connect to store");
            return Err(e.into());
        }
    };

    if let Err(e) = db.run_migrations().await {
        error!(error = %e, "Failed to run migrations");
        return Err(e.into());
    }

    let provider = provider_from_config(&config)?;
    let notifier = notifier_from_config(&config)?;

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Queue consumers
    let registry = build_registry(
        &db,
        provider.clone(),
        notifier.clone(),
        BootstrapRenderer::new(&config.public_url, &config.init_script_template),
    )?;
    let dispatcher = WorkerDispatcher::new(
        db.queue(),
        registry,
        config.queues.clone(),
        Arc::new(TracingReporter),
    );
    let dispatcher_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            dispatcher.run(shutdown_rx).await;
        }
    });

    // Reconciliation loop
    let jobs: Vec<Arc<dyn PeriodicJob>> = vec![
        Arc::new(Ec2Sync::new(
            provider.clone(),
            db.fleet_cache(),
            db.default_ttl(),
        )),
        Arc::new(Keepalive::new(&config.public_url)?),
    ];
    let reconciler = ReconciliationLoop::new(jobs, config.sync_interval);
    let reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    // Expired key cleanup
    let cleanup_worker = CleanupWorker::new(db.kv().clone(), CleanupWorkerConfig::default());
    let cleanup_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            cleanup_worker.run(shutdown_rx).await;
        }
    });

    // Create application state
    let state = AppState::new(db, notifier, AuthGate::new(config.auth_token.clone()));

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
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
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Wait for workers to finish; in-flight jobs are allowed to complete.
    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(30);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, dispatcher_handle).await {
        warn!(error = %e, "Worker dispatcher did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, reconciler_handle).await {
        warn!(error = %e, "Reconciliation loop did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, cleanup_handle).await {
        warn!(error = %e, "Cleanup worker did not shut down in time");
    }

    info!("fleetd shutdown complete");
    Ok(())
}
