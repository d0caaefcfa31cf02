//! In-memory port implementations for tests/dev.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use shelfkeep_core::{ItemId, PhotoId, RepairLogId, UserId, WorkspaceId};

use super::ports::{
    ByteStream, CleanupStore, DueLoan, DueRepair, EmailSender, ImageProcessor, LoanStore,
    MemberDirectory, NewNotification, NotificationStore, PhotoStore, PhotoThumbnail, PortError,
    PushMessage, PushSender, RepairStore, Storage, StoreError, ThumbnailPaths, ThumbnailSize,
    ThumbnailStatus,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct State {
    loans: Vec<DueLoan>,
    repairs: Vec<(DueRepair, bool)>,
    admins: HashMap<WorkspaceId, Vec<UserId>>,
    notifications: Vec<NewNotification>,
    failing_recipients: HashSet<UserId>,
    fail_mark_sent: bool,
    photos: HashMap<PhotoId, PhotoThumbnail>,
    status_history: HashMap<PhotoId, Vec<ThumbnailStatus>>,
    deleted_records: BTreeMap<Uuid, DateTime<Utc>>,
    activity_logs: BTreeMap<Uuid, DateTime<Utc>>,
}

/// One in-memory implementation of every store port.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_loan(&self, loan: DueLoan) {
        lock(&self.state).loans.push(loan);
    }

    pub fn add_repair(&self, repair: DueRepair) {
        lock(&self.state).repairs.push((repair, false));
    }

    pub fn add_admin(&self, workspace_id: WorkspaceId, user_id: UserId) {
        lock(&self.state)
            .admins
            .entry(workspace_id)
            .or_default()
            .push(user_id);
    }

    /// Make notification inserts for `user_id` fail.
    pub fn fail_notifications_for(&self, user_id: UserId) {
        lock(&self.state).failing_recipients.insert(user_id);
    }

    pub fn fail_mark_sent(&self, fail: bool) {
        lock(&self.state).fail_mark_sent = fail;
    }

    pub fn reminder_sent(&self, id: RepairLogId) -> bool {
        lock(&self.state)
            .repairs
            .iter()
            .any(|(r, sent)| r.repair_log_id == id && *sent)
    }

    pub fn notifications(&self) -> Vec<NewNotification> {
        lock(&self.state).notifications.clone()
    }

    pub fn add_photo(&self, photo_id: PhotoId) {
        let mut state = lock(&self.state);
        state.photos.insert(
            photo_id,
            PhotoThumbnail {
                status: ThumbnailStatus::Pending,
                error: None,
                paths: ThumbnailPaths::default(),
            },
        );
        state
            .status_history
            .insert(photo_id, vec![ThumbnailStatus::Pending]);
    }

    pub fn photo(&self, photo_id: PhotoId) -> Option<PhotoThumbnail> {
        lock(&self.state).photos.get(&photo_id).cloned()
    }

    /// Every status the photo has been in, oldest first.
    pub fn status_history(&self, photo_id: PhotoId) -> Vec<ThumbnailStatus> {
        lock(&self.state)
            .status_history
            .get(&photo_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_deleted_record(&self, id: Uuid, deleted_at: DateTime<Utc>) {
        lock(&self.state).deleted_records.insert(id, deleted_at);
    }

    pub fn has_deleted_record(&self, id: Uuid) -> bool {
        lock(&self.state).deleted_records.contains_key(&id)
    }

    pub fn add_activity_log(&self, id: Uuid, created_at: DateTime<Utc>) {
        lock(&self.state).activity_logs.insert(id, created_at);
    }

    pub fn has_activity_log(&self, id: Uuid) -> bool {
        lock(&self.state).activity_logs.contains_key(&id)
    }

    fn transition(
        &self,
        photo_id: PhotoId,
        next: ThumbnailStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut state = lock(&self.state);
        let photo = state.photos.get_mut(&photo_id).ok_or(StoreError::NotFound)?;
        if !photo.status.can_transition_to(next) {
            return Ok(false);
        }
        let changed = photo.status != next;
        photo.status = next;
        if let Some(error) = error {
            photo.error = Some(error.to_string());
        } else if next == ThumbnailStatus::Ready {
            photo.error = None;
        }
        if changed {
            state.status_history.entry(photo_id).or_default().push(next);
        }
        Ok(true)
    }
}

#[async_trait]
impl LoanStore for InMemoryStore {
    async fn due_loans(&self, due_before: DateTime<Utc>) -> Result<Vec<DueLoan>, StoreError> {
        Ok(lock(&self.state)
            .loans
            .iter()
            .filter(|l| l.due_date <= due_before)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RepairStore for InMemoryStore {
    async fn due_repair_reminders(
        &self,
        due_before: DateTime<Utc>,
    ) -> Result<Vec<DueRepair>, StoreError> {
        Ok(lock(&self.state)
            .repairs
            .iter()
            .filter(|(r, sent)| !sent && r.reminder_date.is_some_and(|d| d <= due_before))
            .map(|(r, _)| r.clone())
            .collect())
    }

    async fn mark_reminder_sent(&self, repair_log_id: RepairLogId) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        if state.fail_mark_sent {
            return Err(StoreError::Backend("connection reset".into()));
        }
        let (_, sent) = state
            .repairs
            .iter_mut()
            .find(|(r, _)| r.repair_log_id == repair_log_id)
            .ok_or(StoreError::NotFound)?;
        *sent = true;
        Ok(())
    }
}

#[async_trait]
impl MemberDirectory for InMemoryStore {
    async fn admins(&self, workspace_id: WorkspaceId) -> Result<Vec<UserId>, StoreError> {
        Ok(lock(&self.state)
            .admins
            .get(&workspace_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl NotificationStore for InMemoryStore {
    async fn create(&self, notification: NewNotification) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        if state.failing_recipients.contains(&notification.user_id) {
            return Err(StoreError::Backend("insert notification failed".into()));
        }
        state.notifications.push(notification);
        Ok(())
    }
}

#[async_trait]
impl PhotoStore for InMemoryStore {
    async fn thumbnail(&self, photo_id: PhotoId) -> Result<Option<PhotoThumbnail>, StoreError> {
        Ok(self.photo(photo_id))
    }

    async fn mark_processing(&self, photo_id: PhotoId) -> Result<bool, StoreError> {
        self.transition(photo_id, ThumbnailStatus::Processing, None)
    }

    async fn record_error(&self, photo_id: PhotoId, error: &str) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        let photo = state.photos.get_mut(&photo_id).ok_or(StoreError::NotFound)?;
        if !photo.status.is_terminal() {
            photo.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn save_thumbnail_paths(
        &self,
        photo_id: PhotoId,
        paths: &ThumbnailPaths,
    ) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        let photo = state.photos.get_mut(&photo_id).ok_or(StoreError::NotFound)?;
        photo.paths = paths.clone();
        Ok(())
    }

    async fn mark_ready(&self, photo_id: PhotoId) -> Result<bool, StoreError> {
        self.transition(photo_id, ThumbnailStatus::Ready, None)
    }

    async fn mark_failed(&self, photo_id: PhotoId, error: &str) -> Result<bool, StoreError> {
        self.transition(photo_id, ThumbnailStatus::Failed, Some(error))
    }
}

#[async_trait]
impl CleanupStore for InMemoryStore {
    async fn purge_deleted_records(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = lock(&self.state);
        let before = state.deleted_records.len();
        state.deleted_records.retain(|_, deleted_at| *deleted_at >= cutoff);
        Ok((before - state.deleted_records.len()) as u64)
    }

    async fn purge_activity_logs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = lock(&self.state);
        let before = state.activity_logs.len();
        state.activity_logs.retain(|_, created_at| *created_at >= cutoff);
        Ok((before - state.activity_logs.len()) as u64)
    }
}

/// A loan reminder as handed to [`RecordingEmail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReminder {
    pub to: String,
    pub borrower_name: String,
    pub item_name: String,
    pub due_date: DateTime<Utc>,
    pub is_overdue: bool,
}

/// Email sender that records instead of sending; optionally fails every call.
#[derive(Debug, Default)]
pub struct RecordingEmail {
    sent: Mutex<Vec<SentReminder>>,
    failure: Mutex<Option<String>>,
}

impl RecordingEmail {
    pub fn failing(error: &str) -> Self {
        let email = Self::default();
        email.fail_with(Some(error));
        email
    }

    pub fn fail_with(&self, error: Option<&str>) {
        *lock(&self.failure) = error.map(String::from);
    }

    pub fn sent(&self) -> Vec<SentReminder> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl EmailSender for RecordingEmail {
    async fn send_loan_reminder(
        &self,
        to: &str,
        borrower_name: &str,
        item_name: &str,
        due_date: DateTime<Utc>,
        is_overdue: bool,
    ) -> Result<(), PortError> {
        if let Some(error) = lock(&self.failure).clone() {
            return Err(PortError::Unavailable(error));
        }
        lock(&self.sent).push(SentReminder {
            to: to.to_string(),
            borrower_name: borrower_name.to_string(),
            item_name: item_name.to_string(),
            due_date,
            is_overdue,
        });
        Ok(())
    }
}

/// Push sender that records instead of sending.
#[derive(Debug)]
pub struct RecordingPush {
    enabled: bool,
    failure: Option<String>,
    sent: Mutex<Vec<(Vec<UserId>, PushMessage)>>,
}

impl Default for RecordingPush {
    fn default() -> Self {
        Self {
            enabled: true,
            failure: None,
            sent: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingPush {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            failure: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(Vec<UserId>, PushMessage)> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl PushSender for RecordingPush {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn send_to_users(
        &self,
        user_ids: &[UserId],
        message: &PushMessage,
    ) -> Result<(), PortError> {
        if let Some(error) = &self.failure {
            return Err(PortError::Unavailable(error.clone()));
        }
        lock(&self.sent).push((user_ids.to_vec(), message.clone()));
        Ok(())
    }
}

/// Object storage held in a map keyed by path.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, bytes: &[u8]) {
        lock(&self.objects).insert(path.to_string(), bytes.to_vec());
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.objects).get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn save(
        &self,
        workspace_id: WorkspaceId,
        item_id: ItemId,
        filename: &str,
        mut body: ByteStream,
    ) -> Result<String, PortError> {
        let mut bytes = Vec::new();
        body.read_to_end(&mut bytes).await?;
        let path = format!("{workspace_id}/{item_id}/{filename}");
        lock(&self.objects).insert(path.clone(), bytes);
        Ok(path)
    }

    async fn get(&self, path: &str) -> Result<ByteStream, PortError> {
        let bytes = self
            .object(path)
            .ok_or_else(|| PortError::NotFound(path.to_string()))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }
}

/// Image processor that copies the source once per size, for pipelines
/// that only care about file plumbing. Can be told to fail.
#[derive(Debug)]
pub struct CopyingImageProcessor {
    failure: Option<String>,
    sizes: Vec<ThumbnailSize>,
}

impl Default for CopyingImageProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl CopyingImageProcessor {
    pub fn new() -> Self {
        Self {
            failure: None,
            sizes: ThumbnailSize::ALL.to_vec(),
        }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            failure: Some(error.to_string()),
            sizes: Vec::new(),
        }
    }

    /// Only produce these sizes.
    pub fn with_sizes(sizes: &[ThumbnailSize]) -> Self {
        Self {
            failure: None,
            sizes: sizes.to_vec(),
        }
    }
}

#[async_trait]
impl ImageProcessor for CopyingImageProcessor {
    async fn generate_all_thumbnails(
        &self,
        source: &Path,
        dest_base: &Path,
    ) -> Result<BTreeMap<ThumbnailSize, PathBuf>, PortError> {
        if let Some(error) = &self.failure {
            return Err(PortError::Unavailable(error.clone()));
        }
        let mut out = BTreeMap::new();
        for size in &self.sizes {
            let dest = size.sibling_path(dest_base, "jpg");
            tokio::fs::copy(source, &dest).await?;
            out.insert(*size, dest);
        }
        Ok(out)
    }
}
