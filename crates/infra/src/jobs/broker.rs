//! Task broker abstraction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{EnqueueOptions, Task, TaskId, TaskInfo, TaskMessage, TaskState};
use crate::tx::TxError;

/// Durable store and dispatcher of tasks.
///
/// Workers drive a task through `dequeue` and then exactly one of
/// `complete`, `retry` or `archive`. Tasks whose worker disappeared are
/// handed back by `recover_stale`.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Persist a task for later execution.
    async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> Result<TaskInfo, BrokerError>;

    /// Enqueue with the kind's default options.
    async fn submit(&self, task: Task) -> Result<TaskInfo, BrokerError> {
        let opts = task.kind.default_options();
        self.enqueue(task, opts).await
    }

    /// Claim the next ready task, trying `queues` in the given order.
    /// The returned message is `Active`.
    async fn dequeue(&self, queues: &[String]) -> Result<Option<TaskMessage>, BrokerError>;

    /// Mark a claimed task as done.
    async fn complete(&self, msg: &TaskMessage) -> Result<(), BrokerError>;

    /// Record a failed attempt and schedule the next one.
    async fn retry(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), BrokerError>;

    /// Move a claimed task to the archive (dead-letter).
    async fn archive(&self, msg: &TaskMessage, error: &str) -> Result<(), BrokerError>;

    /// Hand back tasks that stayed `Active` past their deadline plus `grace`.
    /// Tasks with no retries left are archived and returned so the caller
    /// can run their dead-letter hooks.
    async fn recover_stale(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<StaleRecovery, BrokerError>;

    /// Delete completed tasks whose retention has elapsed.
    async fn purge_completed(&self, now: DateTime<Utc>) -> Result<usize, BrokerError>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskMessage>, BrokerError>;

    /// List archived tasks, newest failure first.
    async fn list_archived(
        &self,
        queue: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TaskMessage>, BrokerError>;

    /// Put an archived task back in its queue with a fresh retry budget.
    async fn requeue_archived(&self, id: TaskId) -> Result<TaskInfo, BrokerError>;

    async fn delete_archived(&self, id: TaskId) -> Result<(), BrokerError>;

    async fn stats(&self) -> Result<BrokerStats, BrokerError>;

    /// Distinct queues holding tasks that still wait to run, sorted.
    async fn pending_queues(&self) -> Result<Vec<String>, BrokerError>;
}

/// Outcome of [`TaskBroker::recover_stale`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleRecovery {
    /// Tasks put back for another attempt.
    pub retried: usize,
    /// Tasks that lost their last attempt, now `Archived`.
    pub archived: Vec<TaskMessage>,
}

impl StaleRecovery {
    pub fn total(&self) -> usize {
        self.retried + self.archived.len()
    }
}

/// Broker error.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task {id} is {}, expected {expected}", .state.as_str())]
    InvalidState {
        id: TaskId,
        state: TaskState,
        expected: &'static str,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Transaction(#[from] TxError),
}

/// Task counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct BrokerStats {
    pub pending: usize,
    pub scheduled: usize,
    pub active: usize,
    pub retry: usize,
    pub completed: usize,
    pub archived: usize,
}

impl BrokerStats {
    pub fn record(&mut self, state: TaskState) {
        self.add(state, 1);
    }

    pub fn add(&mut self, state: TaskState, n: usize) {
        match state {
            TaskState::Pending => self.pending += n,
            TaskState::Scheduled => self.scheduled += n,
            TaskState::Active => self.active += n,
            TaskState::Retry => self.retry += n,
            TaskState::Completed => self.completed += n,
            TaskState::Archived => self.archived += n,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.scheduled + self.active + self.retry + self.completed + self.archived
    }
}

/// Error recorded on tasks handed back by `recover_stale`.
pub const LEASE_EXPIRED: &str = "task lease expired: worker stopped before finishing";
