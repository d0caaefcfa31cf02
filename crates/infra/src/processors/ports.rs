//! Outbound ports used by the task processors.
//!
//! Processors depend only on these traits; Postgres adapters live in
//! [`crate::postgres`], in-memory fakes in tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncRead;

use shelfkeep_core::{InventoryId, ItemId, LoanId, PhotoId, RepairLogId, UserId, WorkspaceId};

use crate::tx::TxError;

/// Streaming body passed to and from [`Storage`].
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Failure of an external service (email, push, storage, image processing).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("{0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PortError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

/// Failure of a store query or update.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error(transparent)]
    Transaction(#[from] TxError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Backend(String),
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_loan_reminder(
        &self,
        to: &str,
        borrower_name: &str,
        item_name: &str,
        due_date: DateTime<Utc>,
        is_overdue: bool,
    ) -> Result<(), PortError>;
}

/// Web-push notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub tag: Option<String>,
    pub url: Option<String>,
    pub data: Map<String, Value>,
}

#[async_trait]
pub trait PushSender: Send + Sync {
    /// Whether push delivery is configured (keys present, feature on).
    fn is_enabled(&self) -> bool;

    async fn send_to_users(&self, user_ids: &[UserId], message: &PushMessage)
    -> Result<(), PortError>;
}

/// Object storage for item photos.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store `body` and return its storage path.
    async fn save(
        &self,
        workspace_id: WorkspaceId,
        item_id: ItemId,
        filename: &str,
        body: ByteStream,
    ) -> Result<String, PortError>;

    async fn get(&self, path: &str) -> Result<ByteStream, PortError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailSize {
    Small,
    Medium,
    Large,
}

impl ThumbnailSize {
    pub const ALL: [ThumbnailSize; 3] = [Self::Small, Self::Medium, Self::Large];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }

    /// `<base>_<size>.<ext>`, next to `base`.
    pub fn sibling_path(&self, base: &Path, ext: &str) -> PathBuf {
        let stem = base
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        base.with_file_name(format!("{stem}_{}.{ext}", self.as_str()))
    }

    /// Longest edge in pixels.
    pub fn max_edge(&self) -> u32 {
        match self {
            Self::Small => 150,
            Self::Medium => 400,
            Self::Large => 800,
        }
    }
}

#[async_trait]
pub trait ImageProcessor: Send + Sync {
    /// Render every thumbnail size of `source` next to `dest_base`, returning
    /// the local file written for each size.
    async fn generate_all_thumbnails(
        &self,
        source: &Path,
        dest_base: &Path,
    ) -> Result<BTreeMap<ThumbnailSize, PathBuf>, PortError>;
}

/// Loan due (or overdue) for a reminder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueLoan {
    pub loan_id: LoanId,
    pub workspace_id: WorkspaceId,
    pub borrower_name: String,
    pub borrower_email: Option<String>,
    pub item_name: String,
    pub due_date: DateTime<Utc>,
}

#[async_trait]
pub trait LoanStore: Send + Sync {
    /// Active loans due at or before `due_before`, overdue ones included.
    async fn due_loans(&self, due_before: DateTime<Utc>) -> Result<Vec<DueLoan>, StoreError>;
}

/// Repair whose reminder date is near and whose reminder was not sent yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueRepair {
    pub repair_log_id: RepairLogId,
    pub workspace_id: WorkspaceId,
    pub inventory_id: InventoryId,
    pub item_name: String,
    pub description: String,
    pub reminder_date: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RepairStore: Send + Sync {
    async fn due_repair_reminders(
        &self,
        due_before: DateTime<Utc>,
    ) -> Result<Vec<DueRepair>, StoreError>;

    async fn mark_reminder_sent(&self, repair_log_id: RepairLogId) -> Result<(), StoreError>;
}

#[async_trait]
pub trait MemberDirectory: Send + Sync {
    /// Members holding the `owner` or `admin` role.
    async fn admins(&self, workspace_id: WorkspaceId) -> Result<Vec<UserId>, StoreError>;
}

/// In-app notification to create for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub workspace_id: WorkspaceId,
    pub user_id: UserId,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub metadata: Map<String, Value>,
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create(&self, notification: NewNotification) -> Result<(), StoreError>;
}

/// Thumbnail lifecycle of a photo: `pending -> processing -> {ready | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl ThumbnailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    /// Forward-only transitions. Staying in `processing` is allowed so a
    /// retried attempt can re-enter it.
    pub fn can_transition_to(&self, next: ThumbnailStatus) -> bool {
        use ThumbnailStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Pending | Processing, Ready | Failed)
        )
    }
}

/// Storage paths of the generated sizes; absent sizes stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailPaths {
    pub small: Option<String>,
    pub medium: Option<String>,
    pub large: Option<String>,
}

impl ThumbnailPaths {
    pub fn set(&mut self, size: ThumbnailSize, path: String) {
        match size {
            ThumbnailSize::Small => self.small = Some(path),
            ThumbnailSize::Medium => self.medium = Some(path),
            ThumbnailSize::Large => self.large = Some(path),
        }
    }

    pub fn get(&self, size: ThumbnailSize) -> Option<&str> {
        match size {
            ThumbnailSize::Small => self.small.as_deref(),
            ThumbnailSize::Medium => self.medium.as_deref(),
            ThumbnailSize::Large => self.large.as_deref(),
        }
    }
}

/// Thumbnail columns of a photo row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoThumbnail {
    pub status: ThumbnailStatus,
    pub error: Option<String>,
    pub paths: ThumbnailPaths,
}

/// Status updates only apply when [`ThumbnailStatus::can_transition_to`]
/// allows them; the `bool` results report whether the row changed.
#[async_trait]
pub trait PhotoStore: Send + Sync {
    async fn thumbnail(&self, photo_id: PhotoId) -> Result<Option<PhotoThumbnail>, StoreError>;

    async fn mark_processing(&self, photo_id: PhotoId) -> Result<bool, StoreError>;

    /// Record a non-terminal failure diagnostic, leaving the status alone.
    async fn record_error(&self, photo_id: PhotoId, error: &str) -> Result<(), StoreError>;

    async fn save_thumbnail_paths(
        &self,
        photo_id: PhotoId,
        paths: &ThumbnailPaths,
    ) -> Result<(), StoreError>;

    async fn mark_ready(&self, photo_id: PhotoId) -> Result<bool, StoreError>;

    async fn mark_failed(&self, photo_id: PhotoId, error: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait CleanupStore: Send + Sync {
    /// Hard-delete soft-deleted records deleted before `cutoff`.
    async fn purge_deleted_records(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete activity log entries created before `cutoff`.
    async fn purge_activity_logs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ThumbnailStatus::*;

    const ALL: [ThumbnailStatus; 4] = [Pending, Processing, Ready, Failed];

    #[test]
    fn terminal_states_are_final() {
        for next in ALL {
            assert!(!Ready.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Pending));
    }

    fn rank(s: ThumbnailStatus) -> u8 {
        match s {
            Pending => 0,
            Processing => 1,
            Ready | Failed => 2,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Applying arbitrary requested transitions never moves backwards.
        #[test]
        fn applied_transitions_never_regress(requests in prop::collection::vec(0usize..4, 0..20)) {
            let mut status = Pending;
            for r in requests {
                let next = ALL[r];
                if status.can_transition_to(next) {
                    prop_assert!(rank(next) >= rank(status));
                    status = next;
                }
            }
        }
    }
}
