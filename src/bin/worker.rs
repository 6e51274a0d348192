//! Worker process: polls the task queue and runs work items through the
//! payload subprocess, bounded by the configured concurrency.

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
use jobflow_core::orchestration::TaskEnqueuer;
use jobflow_core::worker::{SubprocessExecutor, TaskExecutor, WorkerRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging();
    let config = JobflowConfig::load().context("failed to load configuration")?;
    info!(version = jobflow_core::VERSION, "Starting jobflow worker");

    let pool = PgPoolOptions::new()
        .max_connections(config.database.pool)
        .connect(&config.database.url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresEventStore::new(pool.clone(), config.tenant.tenant_id.clone());
    store.migrate().await.context("event store migration failed")?;

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
    let executor: Arc<dyn TaskExecutor> = Arc::new(SubprocessExecutor::new(
        config.worker.payload_command.clone(),
        config.worker.execution_timeout_ms,
        config.worker.extra_env_allowlist.clone(),
    ));

    let idle_wait = Duration::from_secs(config.queues.poll_wait_seconds);
    let runtime = Arc::new(WorkerRuntime::new(
        store, queue, executor, enqueuer, events, config,
    ));

    info!("Worker polling loop started");
    loop {
        tokio::select! {
            picked_up = runtime.poll_once() => match picked_up {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(idle_wait).await,
                Err(e) => {
                    warn!(error = %e, "Task queue receive failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, leased messages will be redelivered");
                break;
            }
        }
    }
    Ok(())
}
