use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod api;
mod auto_import;
mod capabilities;
mod config;
mod db;
mod error;
mod ollama;
mod pipeline;
mod queue;
mod routing;
mod service;

use crate::config::load_config;
use crate::db::Database;
use crate::service::EnrichmentService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!(
        "Starting enrichment service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = load_config()?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        workers = config.queue.workers,
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.storage.data_dir)?;

    let db_path = config.storage.data_dir.join("enrichment.db");
    let db = Arc::new(Database::open(&db_path)?);
    info!(path = %db_path.display(), "Database initialized");

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let auto_import_dir = config.storage.auto_import_dir.clone();

    let service = Arc::new(EnrichmentService::new(config, db)?);

    // Jobs left running by a previous process cannot be resumed
    if let Err(e) = service.queue.recover_interrupted() {
        warn!(error = %e, "Interrupted job recovery failed");
    }

    let shutdown = CancellationToken::new();

    let mut tasks = EnrichmentService::start_workers(service.clone(), shutdown.clone());
    tasks.push(EnrichmentService::start_janitor(
        service.clone(),
        shutdown.clone(),
    ));
    if let Some(dir) = auto_import_dir {
        tasks.push(auto_import::start_auto_import_worker(
            service.clone(),
            dir,
            shutdown.clone(),
        ));
    }

    let app = api::router(service);

    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown requested");
            signal.cancel();
        })
        .await?;

    // Workers finish their current job before exiting
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("Enrichment service stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("enrichment_service=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
