//! Task processors: reminders, retention cleanup and thumbnails.
//!
//! Each processor depends on the narrow ports in [`ports`]; [`Processors`]
//! wires one handler per [`TaskKind`] for the worker server.

pub mod cleanup;
pub mod loan_reminder;
pub mod memory;
mod notify;
pub mod outcome;
pub mod ports;
pub mod repair_reminder;
pub mod thumbnail;

use std::sync::Arc;

use shelfkeep_events::{EventBus, WorkspaceEvent};

use crate::jobs::{TaskBroker, TaskHandler, TaskKind, TaskRouter};
use crate::tx::UnitOfWork;

pub use cleanup::{CleanupConfig, CleanupProcessor, CleanupTarget};
pub use loan_reminder::{LoanReminderPayload, LoanReminderProcessor, LoanReminderScheduler};
pub use outcome::{Channel, ChannelOutcome, DeliveryReport, Role, ScheduleReport};
pub use ports::{
    ByteStream, CleanupStore, DueLoan, DueRepair, EmailSender, ImageProcessor, LoanStore,
    MemberDirectory, NewNotification, NotificationStore, PhotoStore, PhotoThumbnail, PortError,
    PushMessage, PushSender, RepairStore, Storage, StoreError, ThumbnailPaths, ThumbnailSize,
    ThumbnailStatus,
};
pub use repair_reminder::{RepairReminderPayload, RepairReminderProcessor, RepairReminderScheduler};
pub use thumbnail::{ThumbnailOutcome, ThumbnailPayload, ThumbnailProcessor};

/// Everything the processors need from the outside world.
///
/// A single store type usually implements several of the store ports; pass
/// the same `Arc` for each.
pub struct ProcessorDeps<P> {
    pub broker: Arc<dyn TaskBroker>,
    pub loans: Arc<dyn LoanStore>,
    pub repairs: Arc<dyn RepairStore>,
    pub members: Arc<dyn MemberDirectory>,
    pub notifications: Arc<dyn NotificationStore>,
    pub photos: Arc<dyn PhotoStore>,
    pub cleanup: Arc<dyn CleanupStore>,
    pub storage: Arc<dyn Storage>,
    pub images: Arc<dyn ImageProcessor>,
    pub uow: Arc<dyn UnitOfWork<StoreError>>,
    pub events: P,
    /// `None` when no email channel is configured.
    pub email: Option<Arc<dyn EmailSender>>,
    pub push: Option<Arc<dyn PushSender>>,
    pub cleanup_config: CleanupConfig,
}

/// Handler table covering every task kind.
pub struct Processors {
    loan_schedule: Arc<dyn TaskHandler>,
    loan_reminder: Arc<dyn TaskHandler>,
    repair_schedule: Arc<dyn TaskHandler>,
    repair_reminder: Arc<dyn TaskHandler>,
    cleanup: Arc<dyn TaskHandler>,
    thumbnails: Arc<dyn TaskHandler>,
}

impl Processors {
    pub fn new<P>(deps: ProcessorDeps<P>) -> Self
    where
        P: EventBus<WorkspaceEvent> + 'static,
    {
        Self {
            loan_schedule: Arc::new(LoanReminderScheduler::new(deps.loans, deps.broker.clone())),
            loan_reminder: Arc::new(LoanReminderProcessor::new(
                deps.email,
                deps.push.clone(),
                deps.members.clone(),
            )),
            repair_schedule: Arc::new(RepairReminderScheduler::new(
                deps.repairs.clone(),
                deps.broker,
            )),
            repair_reminder: Arc::new(RepairReminderProcessor::new(
                deps.repairs,
                deps.members,
                deps.notifications,
                deps.push,
            )),
            cleanup: Arc::new(CleanupProcessor::new(deps.cleanup, deps.cleanup_config)),
            thumbnails: Arc::new(ThumbnailProcessor::new(
                deps.photos,
                deps.storage,
                deps.images,
                deps.uow,
                deps.events,
            )),
        }
    }
}

impl TaskRouter for Processors {
    fn route(&self, kind: TaskKind) -> &dyn TaskHandler {
        match kind {
            TaskKind::LoanReminderSchedule => self.loan_schedule.as_ref(),
            TaskKind::LoanReminder => self.loan_reminder.as_ref(),
            TaskKind::RepairReminderSchedule => self.repair_schedule.as_ref(),
            TaskKind::RepairReminder => self.repair_reminder.as_ref(),
            TaskKind::CleanupDeletedRecords | TaskKind::CleanupOldActivity => self.cleanup.as_ref(),
            TaskKind::GenerateThumbnails => self.thumbnails.as_ref(),
        }
    }
}
