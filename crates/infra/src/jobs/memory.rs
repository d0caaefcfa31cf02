//! In-memory task broker for tests/dev.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::broker::{BrokerError, BrokerStats, LEASE_EXPIRED, StaleRecovery, TaskBroker};
use super::types::{EnqueueOptions, Task, TaskId, TaskInfo, TaskMessage, TaskState};

#[derive(Debug, Default)]
pub struct InMemoryTaskBroker {
    tasks: RwLock<HashMap<TaskId, TaskMessage>>,
}

impl InMemoryTaskBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every stored task, oldest first.
    pub fn all(&self) -> Vec<TaskMessage> {
        let mut all: Vec<_> = self.read().values().cloned().collect();
        all.sort_by_key(|m| (m.created_at, m.id.0));
        all
    }

    /// Tasks of one state, oldest first.
    pub fn in_state(&self, state: TaskState) -> Vec<TaskMessage> {
        self.all().into_iter().filter(|m| m.state == state).collect()
    }

    /// Make every waiting task due now, skipping retry backoff and
    /// `process_at` delays.
    pub fn fast_forward(&self) {
        let now = Utc::now();
        for msg in self.write().values_mut() {
            if msg.state.is_claimable() && msg.process_at > now {
                msg.process_at = now;
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskId, TaskMessage>> {
        self.tasks.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, TaskMessage>> {
        self.tasks.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Apply `f` to the stored copy of an `Active` task.
    fn with_active<F>(&self, id: TaskId, f: F) -> Result<(), BrokerError>
    where
        F: FnOnce(&mut HashMap<TaskId, TaskMessage>, TaskMessage),
    {
        let mut tasks = self.write();
        let stored = tasks.get(&id).ok_or(BrokerError::NotFound(id))?;
        if stored.state != TaskState::Active {
            return Err(BrokerError::InvalidState {
                id,
                state: stored.state,
                expected: "active",
            });
        }
        let stored = stored.clone();
        f(&mut tasks, stored);
        Ok(())
    }
}

fn fail(msg: &mut TaskMessage, error: &str, now: DateTime<Utc>) {
    msg.last_error = Some(error.to_string());
    msg.last_failed_at = Some(now);
    msg.updated_at = now;
}

#[async_trait]
impl TaskBroker for InMemoryTaskBroker {
    async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> Result<TaskInfo, BrokerError> {
        let msg = TaskMessage::new(task, opts, Utc::now());
        let info = TaskInfo::from(&msg);
        self.write().insert(msg.id, msg);
        Ok(info)
    }

    async fn dequeue(&self, queues: &[String]) -> Result<Option<TaskMessage>, BrokerError> {
        let now = Utc::now();
        let mut tasks = self.write();

        for queue in queues {
            let next = tasks
                .values()
                .filter(|m| &m.queue == queue && m.is_ready(now))
                .min_by_key(|m| (m.process_at, m.created_at, m.id.0))
                .map(|m| m.id);

            if let Some(id) = next {
                if let Some(msg) = tasks.get_mut(&id) {
                    msg.state = TaskState::Active;
                    msg.updated_at = now;
                    return Ok(Some(msg.clone()));
                }
            }
        }

        Ok(None)
    }

    async fn complete(&self, msg: &TaskMessage) -> Result<(), BrokerError> {
        self.with_active(msg.id, |tasks, mut stored| {
            if stored.retention.is_zero() {
                tasks.remove(&stored.id);
                return;
            }
            let now = Utc::now();
            stored.state = TaskState::Completed;
            stored.completed_at = Some(now);
            stored.updated_at = now;
            tasks.insert(stored.id, stored);
        })
    }

    async fn retry(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), BrokerError> {
        self.with_active(msg.id, |tasks, mut stored| {
            fail(&mut stored, error, Utc::now());
            stored.state = TaskState::Retry;
            stored.retried += 1;
            stored.process_at = process_at;
            tasks.insert(stored.id, stored);
        })
    }

    async fn archive(&self, msg: &TaskMessage, error: &str) -> Result<(), BrokerError> {
        self.with_active(msg.id, |tasks, mut stored| {
            fail(&mut stored, error, Utc::now());
            stored.state = TaskState::Archived;
            tasks.insert(stored.id, stored);
        })
    }

    async fn recover_stale(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<StaleRecovery, BrokerError> {
        let mut recovery = StaleRecovery::default();
        for msg in self.write().values_mut() {
            if msg.state != TaskState::Active {
                continue;
            }
            let lease = chrono::Duration::from_std(msg.timeout + grace).unwrap_or_default();
            if msg.updated_at + lease > now {
                continue;
            }
            fail(msg, LEASE_EXPIRED, now);
            if msg.retries_exhausted() {
                msg.state = TaskState::Archived;
                recovery.archived.push(msg.clone());
            } else {
                msg.state = TaskState::Retry;
                msg.retried += 1;
                msg.process_at = now;
                recovery.retried += 1;
            }
        }
        Ok(recovery)
    }

    async fn purge_completed(&self, now: DateTime<Utc>) -> Result<usize, BrokerError> {
        let mut tasks = self.write();
        let before = tasks.len();
        tasks.retain(|_, m| {
            let Some(done) = m.completed_at.filter(|_| m.state == TaskState::Completed) else {
                return true;
            };
            done + chrono::Duration::from_std(m.retention).unwrap_or_default() > now
        });
        Ok(before - tasks.len())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskMessage>, BrokerError> {
        Ok(self.read().get(&id).cloned())
    }

    async fn list_archived(
        &self,
        queue: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TaskMessage>, BrokerError> {
        let mut archived: Vec<_> = self
            .read()
            .values()
            .filter(|m| m.state == TaskState::Archived)
            .filter(|m| queue.is_none_or(|q| m.queue == q))
            .cloned()
            .collect();
        archived.sort_by(|a, b| b.last_failed_at.cmp(&a.last_failed_at));
        archived.truncate(limit);
        Ok(archived)
    }

    async fn requeue_archived(&self, id: TaskId) -> Result<TaskInfo, BrokerError> {
        let mut tasks = self.write();
        let msg = tasks.get_mut(&id).ok_or(BrokerError::NotFound(id))?;
        if msg.state != TaskState::Archived {
            return Err(BrokerError::InvalidState {
                id,
                state: msg.state,
                expected: "archived",
            });
        }
        let now = Utc::now();
        msg.state = TaskState::Pending;
        msg.retried = 0;
        msg.process_at = now;
        msg.updated_at = now;
        Ok(TaskInfo::from(&*msg))
    }

    async fn delete_archived(&self, id: TaskId) -> Result<(), BrokerError> {
        let mut tasks = self.write();
        match tasks.get(&id) {
            None => Err(BrokerError::NotFound(id)),
            Some(m) if m.state != TaskState::Archived => Err(BrokerError::InvalidState {
                id,
                state: m.state,
                expected: "archived",
            }),
            Some(_) => {
                tasks.remove(&id);
                Ok(())
            }
        }
    }

    async fn stats(&self) -> Result<BrokerStats, BrokerError> {
        let mut stats = BrokerStats::default();
        for msg in self.read().values() {
            stats.record(msg.state);
        }
        Ok(stats)
    }

    async fn pending_queues(&self) -> Result<Vec<String>, BrokerError> {
        let queues: BTreeSet<String> = self
            .read()
            .values()
            .filter(|m| m.state.is_claimable())
            .map(|m| m.queue.clone())
            .collect();
        Ok(queues.into_iter().collect())
    }
}
