//! Orchestrator process: the HTTP API plus the reconcile loop that drains
//! dispatch nudges.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use jobflow_core::config::JobflowConfig;
use jobflow_core::event_store::{EventStore, PostgresEventStore};
use jobflow_core::events::EventBuilder;
use jobflow_core::logging::init_structured_logging;
use jobflow_core::messaging::{PgmqWorkQueue, WorkQueue};
use jobflow_core::orchestration::{Dispatcher, TaskEnqueuer};
use jobflow_core::registry::PostgresTemplateStore;
use jobflow_core::web::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging();
    let config = JobflowConfig::load().context("failed to load configuration")?;
    info!(version = jobflow_core::VERSION, "Starting jobflow orchestrator");

    let pool = PgPoolOptions::new()
        .max_connections(config.database.pool)
        .connect(&config.database.url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresEventStore::new(pool.clone(), config.tenant.tenant_id.clone());
    store.migrate().await.context("event store migration failed")?;
    let templates = PostgresTemplateStore::new(pool.clone(), config.tenant.tenant_id.clone());
    templates
        .migrate()
        .await
        .context("template store migration failed")?;

    let queue = PgmqWorkQueue::new_with_pool(pool).await;
    queue.create_queue(&config.queues.task_queue).await?;
    queue.create_queue(&config.queues.reconcile_queue).await?;

    let store: Arc<dyn EventStore> = Arc::new(store);
    let queue: Arc<dyn WorkQueue> = Arc::new(queue);
    let events = EventBuilder::new(
        config.tenant.tenant_id.clone(),
        config.tenant.app_name.clone(),
        config.tenant.environment.clone(),
    );
    let enqueuer = TaskEnqueuer::new(
        queue.clone(),
        config.queues.task_queue.clone(),
        config.queues.reconcile_queue.clone(),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        queue.clone(),
        enqueuer,
        events.clone(),
        config.queues.reconcile_queue.clone(),
        config.dispatcher.reconcile_visibility_seconds,
    ));

    let reconcile_loop = tokio::spawn(run_reconcile_loop(dispatcher.clone()));

    let state = AppState::new(
        store,
        Arc::new(templates),
        dispatcher,
        events,
    );
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.web.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.web.bind_address))?;
    info!(bind_address = %config.web.bind_address, "HTTP API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shutting down");
    reconcile_loop.abort();
    Ok(())
}

/// Drain the reconcile queue forever, idling briefly when it is empty.
async fn run_reconcile_loop(dispatcher: Arc<Dispatcher>) {
    info!("Reconcile loop started");
    loop {
        match dispatcher.run_once().await {
            Ok(true) => {}
            Ok(false) => tokio::time::sleep(Duration::from_millis(500)).await,
            Err(e) => {
                warn!(error = %e, "Reconcile queue receive failed");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
