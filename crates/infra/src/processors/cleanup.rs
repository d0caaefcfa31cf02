//! Retention cleanup for soft-deleted records and activity logs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::info;

use super::ports::{CleanupStore, StoreError};
use crate::jobs::{TaskContext, TaskError, TaskHandler, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupConfig {
    pub deleted_records_retention_days: u32,
    pub activity_logs_retention_days: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            deleted_records_retention_days: 90,
            activity_logs_retention_days: 90,
        }
    }
}

/// What a cleanup run purges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupTarget {
    DeletedRecords,
    ActivityLogs,
}

impl CleanupTarget {
    pub fn for_kind(kind: TaskKind) -> Option<Self> {
        match kind {
            TaskKind::CleanupDeletedRecords => Some(Self::DeletedRecords),
            TaskKind::CleanupOldActivity => Some(Self::ActivityLogs),
            _ => None,
        }
    }
}

/// Purges rows older than the configured retention. Both targets share the
/// processor; the task kind selects which one runs.
pub struct CleanupProcessor {
    store: Arc<dyn CleanupStore>,
    config: CleanupConfig,
}

impl CleanupProcessor {
    pub fn new(store: Arc<dyn CleanupStore>, config: CleanupConfig) -> Self {
        Self { store, config }
    }

    pub fn cutoff(&self, target: CleanupTarget, now: DateTime<Utc>) -> DateTime<Utc> {
        let days = match target {
            CleanupTarget::DeletedRecords => self.config.deleted_records_retention_days,
            CleanupTarget::ActivityLogs => self.config.activity_logs_retention_days,
        };
        now - Duration::days(i64::from(days))
    }

    /// Purge everything older than the retention as seen from `now`.
    pub async fn run_at(&self, target: CleanupTarget, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = self.cutoff(target, now);
        let purged = match target {
            CleanupTarget::DeletedRecords => self.store.purge_deleted_records(cutoff).await?,
            CleanupTarget::ActivityLogs => self.store.purge_activity_logs(cutoff).await?,
        };
        info!(target = ?target, %cutoff, purged, "retention cleanup finished");
        Ok(purged)
    }
}

#[async_trait]
impl TaskHandler for CleanupProcessor {
    async fn process(&self, ctx: &TaskContext, _payload: &[u8]) -> Result<(), TaskError> {
        let Some(target) = CleanupTarget::for_kind(ctx.kind) else {
            return Err(TaskError::dependency(
                "route cleanup task",
                format!("{} is not a cleanup task", ctx.kind),
            ));
        };
        self.run_at(target, Utc::now())
            .await
            .map_err(|e| TaskError::dependency("purge expired rows", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::memory::InMemoryStore;
    use uuid::Uuid;

    #[tokio::test]
    async fn purges_only_records_past_retention() {
        let now = Utc::now();
        let store = Arc::new(InMemoryStore::new());
        let (old, recent) = (Uuid::new_v4(), Uuid::new_v4());
        store.add_deleted_record(old, now - Duration::days(100));
        store.add_deleted_record(recent, now - Duration::days(10));

        let processor = CleanupProcessor::new(store.clone(), CleanupConfig::default());
        let purged = processor.run_at(CleanupTarget::DeletedRecords, now).await.unwrap();

        assert_eq!(purged, 1);
        assert!(!store.has_deleted_record(old));
        assert!(store.has_deleted_record(recent));
    }

    #[tokio::test]
    async fn activity_logs_use_their_own_retention() {
        let now = Utc::now();
        let store = Arc::new(InMemoryStore::new());
        let entry = Uuid::new_v4();
        store.add_activity_log(entry, now - Duration::days(20));
        store.add_deleted_record(Uuid::new_v4(), now - Duration::days(20));

        let config = CleanupConfig {
            deleted_records_retention_days: 90,
            activity_logs_retention_days: 14,
        };
        let processor = CleanupProcessor::new(store.clone(), config);

        assert_eq!(processor.run_at(CleanupTarget::ActivityLogs, now).await.unwrap(), 1);
        assert!(!store.has_activity_log(entry));
        assert_eq!(processor.run_at(CleanupTarget::DeletedRecords, now).await.unwrap(), 0);
    }

    #[test]
    fn only_cleanup_kinds_have_targets() {
        let targets: Vec<_> = TaskKind::ALL
            .into_iter()
            .filter_map(CleanupTarget::for_kind)
            .collect();
        assert_eq!(
            targets,
            vec![CleanupTarget::DeletedRecords, CleanupTarget::ActivityLogs]
        );
    }
}
