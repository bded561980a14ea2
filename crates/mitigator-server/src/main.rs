//! Mitigation Engine Process
//!
//! Bootstraps the core against its collaborators: loads the configuration
//! document and the persisted catalogs, wires the attack engine, planner
//! and dispatcher behind the alert ingress, subscribes to the alert bus
//! and serves the HTTP API. Exits non-zero on fatal startup failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mitigator_core::graphdb::GraphQuery;
use mitigator_core::{
    AttackEngine, Catalogs, Dispatcher, HttpGraphClient, MappingSchema, NoGraphDb, Planner,
};

mod bus;
mod config;
mod ingress;
mod routes;

use bus::BusSubscriber;
use config::ServerConfig;
use ingress::{AlertQueue, AlertWorker};
use routes::ApiState;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MITIGATOR_CONFIG").ok())
    {
        Some(path) => ServerConfig::load(&path)?,
        None => ServerConfig::default(),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log.directives()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Catalogs: invalid persisted state is fatal here, recoverable on CRUD
    let catalogs = Arc::new(Catalogs::new());
    let store = Arc::new(config.store.catalog_store());
    store.load_into(&catalogs)?;

    let graphdb: Arc<dyn GraphQuery> = match &config.graph_db {
        Some(settings) => {
            tracing::info!(url = %settings.url, "using graph database");
            Arc::new(HttpGraphClient::new(
                settings.url.clone(),
                settings.credentials(),
                Duration::from_secs(settings.timeout_secs),
            )?)
        }
        None => {
            tracing::info!("no graph database configured, query conditions will not hold");
            Arc::new(NoGraphDb)
        }
    };

    let (queue, receiver) = AlertQueue::new(config.queue_capacity);
    let worker = AlertWorker::new(
        MappingSchema::wazuh(),
        AttackEngine::with_risk(Arc::clone(&catalogs), Arc::clone(&graphdb), (&config.risk).into()),
        Arc::new(Planner::new((&config.planner).into())),
        Arc::new(Dispatcher::new((&config.dispatcher).into())?),
        Arc::clone(&catalogs),
        Arc::clone(&graphdb),
    );
    let worker_handle = tokio::spawn(worker.run(receiver));

    let bus_handle = if config.bus.enabled {
        let subscriber = BusSubscriber::new(config.bus.clone(), queue.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = subscriber.run().await {
                tracing::error!(error = %e, "message bus is gone, shutting down");
                std::process::exit(2);
            }
        }))
    } else {
        None
    };

    let state = Arc::new(ApiState {
        catalogs,
        store,
        queue,
    });
    let app = routes::router(state);
    let listener = TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    tracing::info!(port = config.http_port, "mitigation engine listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received, draining");
        })
        .await?;

    // Every queue sender is gone once the router and bus are dropped; the
    // worker then drains what is left and waits for in-flight dispatches.
    if let Some(handle) = bus_handle {
        handle.abort();
    }
    let grace = Duration::from_secs(config.shutdown_grace_secs);
    if tokio::time::timeout(grace, worker_handle).await.is_err() {
        tracing::warn!("grace period expired, aborting in-flight work");
    }
    tracing::info!("shutdown complete");
    Ok(())
}
