//! uptimed - website uptime monitoring engine.
//!
//! Probes targets from multiple regions, records ticks, tracks incident
//! boundaries and streaks, and serves the aggregated stats over a JSON API.

mod aggregate;
mod alert;
mod config;
mod db;
mod probe;
mod scheduler;
mod status;
mod web;

use aggregate::LiveBuckets;
use alert::AlertDispatcher;
use config::EngineConfig;
use db::Store;
use scheduler::{RetentionManager, Scheduler};
use status::StatusTracker;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("uptimed=info".parse()?),
        )
        .init();

    // Load configuration
    let cfg = EngineConfig::load();
    tracing::info!("Starting uptimed on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);
    tracing::info!("Probing from regions: {}", cfg.regions.join(", "));

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Alert hook: delivery is external; here we log every emitted event.
    let dispatcher = AlertDispatcher::default();
    let mut alert_rx = dispatcher.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = alert_rx.recv().await {
            tracing::info!(
                kind = ?event.kind,
                target_id = event.target_id,
                region = event.region_id.as_deref().unwrap_or("global"),
                at = %event.at,
                "alert hook fired"
            );
        }
    });

    // Rebuild per-pair status state before any new ticks arrive.
    let tracker = Arc::new(StatusTracker::new(
        store.clone(),
        dispatcher.clone(),
        cfg.debounce_ticks,
    ));
    tracker.recover(&cfg.regions)?;

    // Start the scheduler and retention manager
    let live = Arc::new(LiveBuckets::new());
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        tracker.clone(),
        live.clone(),
        cfg.clone(),
    ));
    scheduler.clone().start().await?;

    let retention = RetentionManager::new(store.clone(), cfg.retention_days);
    retention.start();

    // Start the API server
    let server = Server::new(cfg, store, scheduler, tracker, live, dispatcher);
    server.start().await?;

    Ok(())
}
