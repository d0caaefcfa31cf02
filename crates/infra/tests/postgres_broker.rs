//! Black-box tests for the Postgres broker.
//!
//! Needs a disposable database in `DATABASE_URL`; every test returns early
//! when it is unset. Each test uses its own queue name so runs can share one
//! database.

use chrono::{Duration, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use shelfkeep_infra::jobs::{
    BrokerError, EnqueueOptions, LEASE_EXPIRED, Task, TaskBroker, TaskKind, TaskState,
};
use shelfkeep_infra::postgres::{MIGRATOR, PgTaskBroker, PgTxBackend};
use shelfkeep_infra::tx::TransactionManager;

async fn pool() -> Option<PgPool> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping postgres test");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("failed to connect to DATABASE_URL");
    MIGRATOR.run(&pool).await.expect("failed to run migrations");
    Some(pool)
}

fn isolated_queue() -> (Vec<String>, EnqueueOptions) {
    let queue = format!("test-{}", Uuid::now_v7());
    (vec![queue.clone()], EnqueueOptions::default().queue(queue))
}

fn payload() -> Task {
    Task::json(TaskKind::LoanReminder, &serde_json::json!({ "loan": "x" })).unwrap()
}

#[tokio::test]
async fn claimed_tasks_are_not_handed_out_twice() {
    let Some(pool) = pool().await else { return };
    let broker = PgTaskBroker::new(pool);
    let (queues, opts) = isolated_queue();

    let info = broker.enqueue(payload(), opts).await.unwrap();
    let first = broker.dequeue(&queues).await.unwrap().expect("task should be ready");
    assert_eq!(first.id, info.id);
    assert_eq!(first.state, TaskState::Active);
    assert!(broker.dequeue(&queues).await.unwrap().is_none());

    broker.complete(&first).await.unwrap();
    // Zero retention deletes on completion.
    assert!(broker.get(info.id).await.unwrap().is_none());
}

#[tokio::test]
async fn retry_then_archive_then_requeue() {
    let Some(pool) = pool().await else { return };
    let broker = PgTaskBroker::new(pool);
    let (queues, opts) = isolated_queue();

    let info = broker.enqueue(payload(), opts.max_retry(1)).await.unwrap();

    let msg = broker.dequeue(&queues).await.unwrap().unwrap();
    broker.retry(&msg, Utc::now() - Duration::seconds(1), "smtp timeout").await.unwrap();
    let stored = broker.get(info.id).await.unwrap().unwrap();
    assert_eq!((stored.state, stored.retried), (TaskState::Retry, 1));
    assert_eq!(stored.last_error.as_deref(), Some("smtp timeout"));

    let msg = broker.dequeue(&queues).await.unwrap().unwrap();
    broker.archive(&msg, "smtp timeout").await.unwrap();
    let archived = broker.list_archived(Some(&queues[0]), 10).await.unwrap();
    assert_eq!(archived.len(), 1);

    // Completing an archived task is rejected.
    let err = broker.complete(&msg).await.unwrap_err();
    assert!(matches!(err, BrokerError::InvalidState { .. }));

    let requeued = broker.requeue_archived(info.id).await.unwrap();
    assert_eq!(requeued.state, TaskState::Pending);
    assert!(broker.dequeue(&queues).await.unwrap().is_some());
}

#[tokio::test]
async fn enqueue_joins_the_ambient_transaction() {
    let Some(pool) = pool().await else { return };
    let broker = PgTaskBroker::new(pool.clone());
    let manager = TransactionManager::new(PgTxBackend::new(pool));
    let (queues, opts) = isolated_queue();

    let result: Result<(), BrokerError> = manager
        .with_transaction(|| async {
            broker.enqueue(payload(), opts.clone()).await?;
            Err(BrokerError::Storage("abort".into()))
        })
        .await;
    assert!(result.is_err());
    assert!(broker.dequeue(&queues).await.unwrap().is_none());

    manager
        .with_transaction(|| async {
            broker.enqueue(payload(), opts.clone()).await?;
            Ok::<_, BrokerError>(())
        })
        .await
        .unwrap();
    assert!(broker.dequeue(&queues).await.unwrap().is_some());
}

#[tokio::test]
async fn stale_final_attempts_come_back_archived() {
    let Some(pool) = pool().await else { return };
    let broker = PgTaskBroker::new(pool);
    let (queues, opts) = isolated_queue();

    // Short enough that tasks other tests hold stay untouched.
    let opts = opts.max_retry(0).timeout(std::time::Duration::from_millis(1));
    let info = broker.enqueue(payload(), opts).await.unwrap();
    broker.dequeue(&queues).await.unwrap().unwrap();

    let later = Utc::now() + Duration::seconds(1);
    let recovery = broker
        .recover_stale(later, std::time::Duration::ZERO)
        .await
        .unwrap();
    let mine: Vec<_> = recovery.archived.iter().filter(|m| m.id == info.id).collect();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].state, TaskState::Archived);
    assert_eq!(mine[0].last_error.as_deref(), Some(LEASE_EXPIRED));
    assert!(broker.pending_queues().await.unwrap().iter().all(|q| q != &queues[0]));
}
