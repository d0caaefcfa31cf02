//! Thumbnail generation for uploaded item photos.
//!
//! A photo moves `pending -> processing -> {ready | failed}` and never back.
//! Failures before the last attempt only record a diagnostic; the photo
//! turns `failed` once the task has no retries left, so a transient storage
//! error does not leave a permanently failed photo behind.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shelfkeep_core::{ItemId, PhotoId, WorkspaceId};
use shelfkeep_events::{EventBus, WorkspaceEvent, event_types};

use super::ports::{ImageProcessor, PhotoStore, Storage, StoreError, ThumbnailPaths, ThumbnailSize};
use crate::jobs::{Task, TaskContext, TaskError, TaskHandler, TaskKind, decode_payload};
use crate::tx::{BoxError, UnitOfWork};

const ENTITY_TYPE: &str = "photo";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailPayload {
    pub photo_id: PhotoId,
    pub workspace_id: WorkspaceId,
    pub item_id: ItemId,
    /// Storage path of the original upload.
    pub storage_path: String,
}

impl ThumbnailPayload {
    pub fn task(&self) -> Result<Task, serde_json::Error> {
        Task::json(TaskKind::GenerateThumbnails, self)
    }

    /// Storage filename for one generated size.
    fn filename(&self, size: ThumbnailSize, local: &Path) -> String {
        let ext = local
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("jpg");
        format!("{}_{}.{ext}", self.photo_id, size.as_str())
    }

    fn event(&self, event_type: &str) -> WorkspaceEvent {
        WorkspaceEvent::new(
            self.workspace_id,
            event_type,
            ENTITY_TYPE,
            Uuid::from(self.photo_id),
        )
        .with("item_id", self.item_id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThumbnailOutcome {
    Generated(ThumbnailPaths),
    /// Photo was already `ready` or `failed` (redelivery or concurrent run).
    AlreadyTerminal,
    /// Photo row no longer exists.
    PhotoMissing,
}

pub struct ThumbnailProcessor<P> {
    photos: Arc<dyn PhotoStore>,
    storage: Arc<dyn Storage>,
    images: Arc<dyn ImageProcessor>,
    uow: Arc<dyn UnitOfWork<StoreError>>,
    events: P,
}

impl<P> ThumbnailProcessor<P>
where
    P: EventBus<WorkspaceEvent> + 'static,
{
    pub fn new(
        photos: Arc<dyn PhotoStore>,
        storage: Arc<dyn Storage>,
        images: Arc<dyn ImageProcessor>,
        uow: Arc<dyn UnitOfWork<StoreError>>,
        events: P,
    ) -> Self {
        Self {
            photos,
            storage,
            images,
            uow,
            events,
        }
    }

    /// Run the pipeline once. Errors leave the photo in `processing`; see
    /// [`Self::record_failure`].
    pub async fn generate(&self, payload: &ThumbnailPayload) -> Result<ThumbnailOutcome, TaskError> {
        let photo_id = payload.photo_id;

        let current = self
            .photos
            .thumbnail(photo_id)
            .await
            .map_err(|e| TaskError::dependency("load photo", e))?;
        match current {
            None => {
                warn!(%photo_id, "photo no longer exists, skipping thumbnails");
                return Ok(ThumbnailOutcome::PhotoMissing);
            }
            Some(photo) if photo.status.is_terminal() => {
                debug!(%photo_id, status = photo.status.as_str(), "thumbnails already settled");
                return Ok(ThumbnailOutcome::AlreadyTerminal);
            }
            Some(_) => {}
        }

        let entered = self
            .photos
            .mark_processing(photo_id)
            .await
            .map_err(|e| TaskError::dependency("mark photo processing", e))?;
        if !entered {
            return Ok(ThumbnailOutcome::AlreadyTerminal);
        }

        // Both temp locations are removed when dropped, on every path out.
        let source = tempfile::NamedTempFile::new()
            .map_err(|e| TaskError::dependency("create temp file", e))?;
        self.fetch_source(&payload.storage_path, source.path())
            .await
            .map_err(|e| TaskError::dependency("fetch source image", e))?;

        let workdir = tempfile::tempdir().map_err(|e| TaskError::dependency("create temp dir", e))?;
        let dest_base = workdir.path().join(photo_id.to_string());
        let generated = self
            .images
            .generate_all_thumbnails(source.path(), &dest_base)
            .await
            .map_err(|e| TaskError::dependency("generate thumbnails", e))?;

        let mut paths = ThumbnailPaths::default();
        for (size, local) in generated {
            let uploaded = self.upload(payload, size, &local).await;
            if let Err(e) = tokio::fs::remove_file(&local).await {
                debug!(path = %local.display(), error = %e, "could not remove local thumbnail");
            }
            let path = uploaded.map_err(|e| TaskError::dependency("upload thumbnail", e))?;
            paths.set(size, path);
        }

        let mut became_ready = false;
        self.uow
            .atomically(Box::pin(async {
                self.photos.save_thumbnail_paths(photo_id, &paths).await?;
                became_ready = self.photos.mark_ready(photo_id).await?;
                Ok::<(), StoreError>(())
            }))
            .await
            .map_err(|e| TaskError::dependency("save thumbnail paths", e))?;
        if !became_ready {
            info!(%photo_id, "photo settled concurrently, not publishing");
            return Ok(ThumbnailOutcome::AlreadyTerminal);
        }

        let event = payload
            .event(event_types::PHOTO_THUMBNAIL_READY)
            .with("small", paths.small.clone())
            .with("medium", paths.medium.clone())
            .with("large", paths.large.clone());
        self.publish(event);

        info!(%photo_id, workspace_id = %payload.workspace_id, "thumbnails ready");
        Ok(ThumbnailOutcome::Generated(paths))
    }

    async fn fetch_source(&self, storage_path: &str, dest: &Path) -> Result<(), BoxError> {
        let mut body = self.storage.get(storage_path).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;
        Ok(())
    }

    async fn upload(
        &self,
        payload: &ThumbnailPayload,
        size: ThumbnailSize,
        local: &Path,
    ) -> Result<String, BoxError> {
        let file = tokio::fs::File::open(local).await?;
        let path = self
            .storage
            .save(
                payload.workspace_id,
                payload.item_id,
                &payload.filename(size, local),
                Box::new(file),
            )
            .await?;
        Ok(path)
    }

    /// Record a failed attempt. With `terminal` the photo becomes `failed`
    /// and a failure event goes out, at most once per photo.
    pub async fn record_failure(&self, payload: &ThumbnailPayload, message: &str, terminal: bool) {
        let photo_id = payload.photo_id;
        if !terminal {
            if let Err(e) = self.photos.record_error(photo_id, message).await {
                error!(%photo_id, error = %e, "failed to record thumbnail error");
            }
            return;
        }

        match self.photos.mark_failed(photo_id, message).await {
            Ok(true) => {
                warn!(%photo_id, error = message, "thumbnail generation failed permanently");
                self.publish(
                    payload
                        .event(event_types::PHOTO_THUMBNAIL_FAILED)
                        .with("error", message),
                );
            }
            Ok(false) => debug!(%photo_id, "photo already settled, failure not recorded"),
            Err(StoreError::NotFound) => debug!(%photo_id, "photo gone, failure not recorded"),
            Err(e) => error!(%photo_id, error = %e, "failed to mark thumbnail failed"),
        }
    }

    fn publish(&self, event: WorkspaceEvent) {
        let event_type = event.event_type.clone();
        if let Err(e) = self.events.publish(event) {
            warn!(%event_type, error = ?e, "failed to publish workspace event");
        }
    }
}

#[async_trait]
impl<P> TaskHandler for ThumbnailProcessor<P>
where
    P: EventBus<WorkspaceEvent> + 'static,
{
    async fn process(&self, ctx: &TaskContext, payload: &[u8]) -> Result<(), TaskError> {
        let payload: ThumbnailPayload = decode_payload(payload)?;
        match self.generate(&payload).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.record_failure(&payload, &e.to_string(), ctx.is_final_attempt())
                    .await;
                Err(e)
            }
        }
    }

    /// Covers attempts that never reached `process`'s own failure handling
    /// (deadline, panic, lost lease).
    async fn dead_lettered(&self, _ctx: &TaskContext, payload: &[u8], error: &str) {
        match decode_payload::<ThumbnailPayload>(payload) {
            Ok(payload) => self.record_failure(&payload, error, true).await,
            Err(e) => debug!(error = %e, "dead-lettered thumbnail task has no usable payload"),
        }
    }
}
