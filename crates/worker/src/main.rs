use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use shelfkeep_events::{EventBus, InMemoryEventBus, WorkspaceEvent};
use shelfkeep_infra::adapters::{ImageThumbnailer, LocalStorage, SmtpEmailSender};
use shelfkeep_infra::config::JobsConfig;
use shelfkeep_infra::event_log::log_events;
use shelfkeep_infra::jobs::{CronScheduler, WorkerServer};
use shelfkeep_infra::postgres::{MIGRATOR, PgStore, PgTaskBroker, PgTxBackend};
use shelfkeep_infra::processors::{EmailSender, ProcessorDeps, Processors};
use shelfkeep_infra::tx::TransactionManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    shelfkeep_observability::init();

    let config = JobsConfig::from_env().context("invalid worker configuration")?;
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size()?)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&database_url)
        .await
        .context("failed to connect to postgres")?;
    MIGRATOR
        .run(&pool)
        .await
        .context("failed to run job migrations")?;

    let store = Arc::new(PgStore::new(pool.clone()));
    let broker = Arc::new(PgTaskBroker::new(pool.clone()));

    // Nothing else in this process listens to the bus; log what processors publish.
    let events = Arc::new(InMemoryEventBus::<WorkspaceEvent>::new());
    let event_log = tokio::task::spawn_blocking({
        let sub = events.subscribe();
        move || log_events(sub)
    });

    let email = match config.smtp.clone() {
        Some(smtp) => Some(Arc::new(SmtpEmailSender::from_config(smtp)?) as Arc<dyn EmailSender>),
        None => None,
    };

    let processors = Processors::new(ProcessorDeps {
        broker: broker.clone(),
        loans: store.clone(),
        repairs: store.clone(),
        members: store.clone(),
        notifications: store.clone(),
        photos: store.clone(),
        cleanup: store,
        storage: Arc::new(LocalStorage::new(config.storage_root.clone())),
        images: Arc::new(ImageThumbnailer::new()),
        uow: Arc::new(TransactionManager::new(PgTxBackend::new(pool.clone()))),
        events: events.clone(),
        email,
        push: None,
        cleanup_config: config.cleanup,
    });

    let mut scheduler = CronScheduler::new(broker.clone());
    scheduler.register_defaults()?;
    let scheduler = scheduler.start();

    let worker = WorkerServer::new(broker, processors, config.worker_config()).start();
    tracing::info!(concurrency = config.concurrency, "worker started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    scheduler.shutdown().await;
    worker.shutdown().await;
    pool.close().await;

    // The worker's processors held the other references; this closes the bus.
    drop(events);
    if let Ok(Ok(seen)) = tokio::time::timeout(Duration::from_secs(1), event_log).await {
        tracing::debug!(events = seen, "event log closed");
    }

    tracing::info!("worker stopped");
    Ok(())
}
