use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use shelfkeep_core::{InventoryId, LoanId, PhotoId, RepairLogId, UserId, WorkspaceId};

use super::{execute, fetch_all, fetch_optional};
use crate::processors::{
    CleanupStore, DueLoan, DueRepair, LoanStore, MemberDirectory, NewNotification,
    NotificationStore, PhotoStore, PhotoThumbnail, RepairStore, StoreError, ThumbnailPaths,
    ThumbnailStatus,
};

/// Store ports over the application schema.
///
/// Joins the ambient transaction when there is one, so thumbnail paths and
/// the `ready` status commit together.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn photo_exists(&self, photo_id: PhotoId) -> Result<bool, StoreError> {
        Ok(self.thumbnail(photo_id).await?.is_some())
    }

    /// `Ok(false)` when the row exists but the guard did not match.
    async fn guarded(&self, photo_id: PhotoId, affected: u64) -> Result<bool, StoreError> {
        if affected > 0 {
            return Ok(true);
        }
        if self.photo_exists(photo_id).await? {
            Ok(false)
        } else {
            Err(StoreError::NotFound)
        }
    }
}

fn due_loan(row: &PgRow) -> Result<DueLoan, sqlx::Error> {
    Ok(DueLoan {
        loan_id: LoanId::from_uuid(row.try_get("loan_id")?),
        workspace_id: WorkspaceId::from_uuid(row.try_get("workspace_id")?),
        borrower_name: row.try_get("borrower_name")?,
        borrower_email: row.try_get("borrower_email")?,
        item_name: row.try_get("item_name")?,
        due_date: row.try_get("due_date")?,
    })
}

fn due_repair(row: &PgRow) -> Result<DueRepair, sqlx::Error> {
    Ok(DueRepair {
        repair_log_id: RepairLogId::from_uuid(row.try_get("repair_log_id")?),
        workspace_id: WorkspaceId::from_uuid(row.try_get("workspace_id")?),
        inventory_id: InventoryId::from_uuid(row.try_get("inventory_id")?),
        item_name: row.try_get("item_name")?,
        description: row.try_get("description")?,
        reminder_date: row.try_get("reminder_date")?,
    })
}

fn photo_thumbnail(row: &PgRow) -> Result<PhotoThumbnail, StoreError> {
    let status: String = row.try_get("thumbnail_status")?;
    let status = ThumbnailStatus::parse(&status)
        .ok_or_else(|| StoreError::Backend(format!("unknown thumbnail status: {status}")))?;
    Ok(PhotoThumbnail {
        status,
        error: row.try_get("thumbnail_error")?,
        paths: ThumbnailPaths {
            small: row.try_get("thumbnail_small_path")?,
            medium: row.try_get("thumbnail_medium_path")?,
            large: row.try_get("thumbnail_large_path")?,
        },
    })
}

#[async_trait]
impl LoanStore for PgStore {
    #[instrument(skip(self), err)]
    async fn due_loans(&self, due_before: DateTime<Utc>) -> Result<Vec<DueLoan>, StoreError> {
        let rows = fetch_all::<StoreError>(
            &self.pool,
            sqlx::query(
                r#"
                SELECT l.id AS loan_id, l.workspace_id, b.name AS borrower_name,
                       b.email AS borrower_email, i.name AS item_name, l.due_date
                FROM warehouse.loans l
                JOIN warehouse.borrowers b ON b.id = l.borrower_id
                JOIN warehouse.inventory inv ON inv.id = l.inventory_id
                JOIN warehouse.items i ON i.id = inv.item_id
                WHERE l.returned_at IS NULL
                  AND l.due_date IS NOT NULL
                  AND l.due_date <= $1
                ORDER BY l.due_date
                "#,
            )
            .bind(due_before),
        )
        .await?;
        Ok(rows.iter().map(due_loan).collect::<Result<_, _>>()?)
    }
}

#[async_trait]
impl RepairStore for PgStore {
    #[instrument(skip(self), err)]
    async fn due_repair_reminders(
        &self,
        due_before: DateTime<Utc>,
    ) -> Result<Vec<DueRepair>, StoreError> {
        let rows = fetch_all::<StoreError>(
            &self.pool,
            sqlx::query(
                r#"
                SELECT r.id AS repair_log_id, r.workspace_id, r.inventory_id,
                       i.name AS item_name, r.description, r.reminder_date
                FROM warehouse.repair_logs r
                JOIN warehouse.inventory inv ON inv.id = r.inventory_id
                JOIN warehouse.items i ON i.id = inv.item_id
                WHERE r.reminder_sent = false
                  AND r.status <> 'COMPLETED'
                  AND r.reminder_date <= $1
                ORDER BY r.reminder_date
                "#,
            )
            .bind(due_before),
        )
        .await?;
        Ok(rows.iter().map(due_repair).collect::<Result<_, _>>()?)
    }

    async fn mark_reminder_sent(&self, repair_log_id: RepairLogId) -> Result<(), StoreError> {
        let result = execute::<StoreError>(
            &self.pool,
            sqlx::query(
                "UPDATE warehouse.repair_logs SET reminder_sent = true, updated_at = now() WHERE id = $1",
            )
            .bind(repair_log_id.as_uuid()),
        )
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl MemberDirectory for PgStore {
    async fn admins(&self, workspace_id: WorkspaceId) -> Result<Vec<UserId>, StoreError> {
        let rows = fetch_all::<StoreError>(
            &self.pool,
            sqlx::query(
                "SELECT user_id FROM auth.workspace_members \
                 WHERE workspace_id = $1 AND role IN ('owner', 'admin') \
                 ORDER BY user_id",
            )
            .bind(workspace_id.as_uuid()),
        )
        .await?;
        rows.iter()
            .map(|r| Ok(UserId::from_uuid(r.try_get("user_id")?)))
            .collect()
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn create(&self, notification: NewNotification) -> Result<(), StoreError> {
        execute::<StoreError>(
            &self.pool,
            sqlx::query(
                "INSERT INTO auth.notifications \
                 (id, workspace_id, user_id, notification_type, title, message, metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(Uuid::now_v7())
            .bind(notification.workspace_id.as_uuid())
            .bind(notification.user_id.as_uuid())
            .bind(&notification.kind)
            .bind(&notification.title)
            .bind(&notification.message)
            .bind(Json(&notification.metadata)),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PhotoStore for PgStore {
    async fn thumbnail(&self, photo_id: PhotoId) -> Result<Option<PhotoThumbnail>, StoreError> {
        let row = fetch_optional::<StoreError>(
            &self.pool,
            sqlx::query(
                "SELECT thumbnail_status, thumbnail_error, thumbnail_small_path, \
                        thumbnail_medium_path, thumbnail_large_path \
                 FROM warehouse.item_photos WHERE id = $1",
            )
            .bind(photo_id.as_uuid()),
        )
        .await?;
        row.as_ref().map(photo_thumbnail).transpose()
    }

    async fn mark_processing(&self, photo_id: PhotoId) -> Result<bool, StoreError> {
        let result = execute::<StoreError>(
            &self.pool,
            sqlx::query(
                "UPDATE warehouse.item_photos SET thumbnail_status = 'processing', updated_at = now() \
                 WHERE id = $1 AND thumbnail_status IN ('pending', 'processing')",
            )
            .bind(photo_id.as_uuid()),
        )
        .await?;
        self.guarded(photo_id, result.rows_affected()).await
    }

    async fn record_error(&self, photo_id: PhotoId, error: &str) -> Result<(), StoreError> {
        execute::<StoreError>(
            &self.pool,
            sqlx::query(
                "UPDATE warehouse.item_photos SET thumbnail_error = $2, updated_at = now() \
                 WHERE id = $1 AND thumbnail_status IN ('pending', 'processing')",
            )
            .bind(photo_id.as_uuid())
            .bind(error),
        )
        .await?;
        Ok(())
    }

    async fn save_thumbnail_paths(
        &self,
        photo_id: PhotoId,
        paths: &ThumbnailPaths,
    ) -> Result<(), StoreError> {
        let result = execute::<StoreError>(
            &self.pool,
            sqlx::query(
                "UPDATE warehouse.item_photos SET thumbnail_small_path = $2, \
                     thumbnail_medium_path = $3, thumbnail_large_path = $4, updated_at = now() \
                 WHERE id = $1",
            )
            .bind(photo_id.as_uuid())
            .bind(paths.small.as_deref())
            .bind(paths.medium.as_deref())
            .bind(paths.large.as_deref()),
        )
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn mark_ready(&self, photo_id: PhotoId) -> Result<bool, StoreError> {
        let result = execute::<StoreError>(
            &self.pool,
            sqlx::query(
                "UPDATE warehouse.item_photos SET thumbnail_status = 'ready', thumbnail_error = NULL, \
                     updated_at = now() \
                 WHERE id = $1 AND thumbnail_status IN ('pending', 'processing')",
            )
            .bind(photo_id.as_uuid()),
        )
        .await?;
        self.guarded(photo_id, result.rows_affected()).await
    }

    async fn mark_failed(&self, photo_id: PhotoId, error: &str) -> Result<bool, StoreError> {
        let result = execute::<StoreError>(
            &self.pool,
            sqlx::query(
                "UPDATE warehouse.item_photos SET thumbnail_status = 'failed', thumbnail_error = $2, \
                     updated_at = now() \
                 WHERE id = $1 AND thumbnail_status IN ('pending', 'processing')",
            )
            .bind(photo_id.as_uuid())
            .bind(error),
        )
        .await?;
        self.guarded(photo_id, result.rows_affected()).await
    }
}

#[async_trait]
impl CleanupStore for PgStore {
    #[instrument(skip(self), err)]
    async fn purge_deleted_records(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = execute::<StoreError>(
            &self.pool,
            sqlx::query("DELETE FROM warehouse.deleted_records WHERE deleted_at < $1").bind(cutoff),
        )
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn purge_activity_logs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = execute::<StoreError>(
            &self.pool,
            sqlx::query("DELETE FROM warehouse.activity_log WHERE created_at < $1").bind(cutoff),
        )
        .await?;
        Ok(result.rows_affected())
    }
}
