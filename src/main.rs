//! Gamewatch - Game Server Status Monitor
//!
//! Periodically queries configured game servers over their native
//! protocols, records availability history and raises downtime alerts.

mod alert;
mod config;
mod db;
mod query;
mod scheduler;

use alert::{LogDisplayRefresher, LogNotifier};
use config::Config;
use db::Store;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("gamewatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = Arc::new(Config::load());
    tracing::info!("Starting Gamewatch...");
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Store::new(&cfg.db_path)?;
    tracing::info!("Database initialized successfully");

    let notifier = Arc::new(LogNotifier);
    let displays = Arc::new(LogDisplayRefresher);

    scheduler::run(store, notifier, displays, cfg).await;

    Ok(())
}
