//! Repair reminders: in-app and push notifications for upcoming repairs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use shelfkeep_core::{InventoryId, RepairLogId, UserId, WorkspaceId};

use super::notify;
use super::outcome::{Channel, ChannelOutcome, DeliveryReport, ScheduleReport};
use super::ports::{
    DueRepair, MemberDirectory, NewNotification, NotificationStore, PushMessage, PushSender,
    RepairStore, StoreError,
};
use crate::jobs::{Task, TaskBroker, TaskContext, TaskError, TaskHandler, TaskKind, decode_payload};

/// Repairs whose reminder date falls within this window get a reminder.
pub const REMINDER_WINDOW: chrono::Duration = chrono::Duration::days(3);

pub const NOTIFICATION_KIND: &str = "repair_reminder";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReminderPayload {
    pub repair_log_id: RepairLogId,
    pub workspace_id: WorkspaceId,
    pub inventory_id: InventoryId,
    pub item_name: String,
    pub description: String,
    pub reminder_date: DateTime<Utc>,
}

impl RepairReminderPayload {
    pub fn for_repair(repair: &DueRepair) -> Option<Self> {
        Some(Self {
            repair_log_id: repair.repair_log_id,
            workspace_id: repair.workspace_id,
            inventory_id: repair.inventory_id,
            item_name: repair.item_name.clone(),
            description: repair.description.clone(),
            reminder_date: repair.reminder_date?,
        })
    }

    fn title(&self) -> String {
        format!("Repair reminder: {}", self.item_name)
    }

    fn metadata(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("repair_log_id".into(), Value::from(self.repair_log_id.to_string()));
        data.insert("inventory_id".into(), Value::from(self.inventory_id.to_string()));
        data.insert(
            "reminder_date".into(),
            Value::from(self.reminder_date.to_rfc3339()),
        );
        data
    }

    fn notification(&self, user_id: UserId) -> NewNotification {
        NewNotification {
            workspace_id: self.workspace_id,
            user_id,
            kind: NOTIFICATION_KIND.to_string(),
            title: self.title(),
            message: self.description.clone(),
            metadata: self.metadata(),
        }
    }

    fn push_message(&self) -> PushMessage {
        let mut data = self.metadata();
        data.insert("type".into(), Value::from(NOTIFICATION_KIND));
        PushMessage {
            title: self.title(),
            body: self.description.clone(),
            icon: Some("/icons/icon-192.png".into()),
            badge: Some("/icons/badge-72.png".into()),
            tag: Some(format!("repair-reminder-{}", self.repair_log_id)),
            url: Some(format!("/inventory/{}", self.inventory_id)),
            data,
        }
    }
}

/// Fan-out trigger: finds repairs needing a reminder and enqueues one task
/// each. Repairs already marked as reminded are excluded by the store.
pub struct RepairReminderScheduler {
    repairs: Arc<dyn RepairStore>,
    broker: Arc<dyn TaskBroker>,
}

impl RepairReminderScheduler {
    pub fn new(repairs: Arc<dyn RepairStore>, broker: Arc<dyn TaskBroker>) -> Self {
        Self { repairs, broker }
    }

    pub async fn schedule_at(&self, now: DateTime<Utc>) -> Result<ScheduleReport, StoreError> {
        let due = self.repairs.due_repair_reminders(now + REMINDER_WINDOW).await?;
        let mut report = ScheduleReport {
            found: due.len(),
            ..Default::default()
        };

        for repair in &due {
            let Some(payload) = RepairReminderPayload::for_repair(repair) else {
                debug!(repair_log_id = %repair.repair_log_id, "skipping repair without reminder date");
                report.skipped += 1;
                continue;
            };

            let enqueued = match Task::json(TaskKind::RepairReminder, &payload) {
                Ok(task) => self.broker.submit(task).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match enqueued {
                Ok(info) => {
                    debug!(repair_log_id = %repair.repair_log_id, task_id = %info.id, "enqueued repair reminder");
                    report.enqueued += 1;
                }
                Err(e) => {
                    error!(repair_log_id = %repair.repair_log_id, error = %e, "failed to enqueue repair reminder");
                    report.failed += 1;
                }
            }
        }

        info!(
            found = report.found,
            enqueued = report.enqueued,
            skipped = report.skipped,
            failed = report.failed,
            "scheduled repair reminders"
        );
        Ok(report)
    }
}

#[async_trait]
impl TaskHandler for RepairReminderScheduler {
    async fn process(&self, _ctx: &TaskContext, _payload: &[u8]) -> Result<(), TaskError> {
        self.schedule_at(Utc::now())
            .await
            .map_err(|e| TaskError::dependency("query due repair reminders", e))?;
        Ok(())
    }
}

/// Notifies workspace admins about a repair, then marks it reminded.
///
/// Notifications are best-effort; marking the repair is what decides
/// success. A redelivered task may notify twice, never zero times.
pub struct RepairReminderProcessor {
    repairs: Arc<dyn RepairStore>,
    members: Arc<dyn MemberDirectory>,
    notifications: Arc<dyn NotificationStore>,
    push: Option<Arc<dyn PushSender>>,
}

impl RepairReminderProcessor {
    pub fn new(
        repairs: Arc<dyn RepairStore>,
        members: Arc<dyn MemberDirectory>,
        notifications: Arc<dyn NotificationStore>,
        push: Option<Arc<dyn PushSender>>,
    ) -> Self {
        Self {
            repairs,
            members,
            notifications,
            push,
        }
    }

    pub async fn deliver(&self, payload: &RepairReminderPayload) -> Result<DeliveryReport, TaskError> {
        let mut report = DeliveryReport::new();

        match notify::recipients(self.members.as_ref(), payload.workspace_id).await {
            Ok(users) => {
                let in_app = self.notify_in_app(payload, &users).await;
                report.auxiliary(Channel::InApp, in_app);
                let push = notify::push(self.push.as_ref(), &users, &payload.push_message()).await;
                report.auxiliary(Channel::Push, push);
            }
            Err(failed) => {
                report.auxiliary(Channel::InApp, failed.clone());
                report.auxiliary(Channel::Push, failed);
            }
        }

        let marked = self
            .repairs
            .mark_reminder_sent(payload.repair_log_id)
            .await
            .map(|()| ChannelOutcome::Delivered { recipients: 1 })
            .map_err(|e| TaskError::dependency("mark repair reminder sent", e));
        report.primary(Channel::Record, marked)?;

        Ok(report)
    }

    async fn notify_in_app(&self, payload: &RepairReminderPayload, users: &[UserId]) -> ChannelOutcome {
        if users.is_empty() {
            return ChannelOutcome::Skipped("no recipients");
        }
        let mut failed = 0;
        for user_id in users {
            if let Err(e) = self.notifications.create(payload.notification(*user_id)).await {
                warn!(%user_id, repair_log_id = %payload.repair_log_id, error = %e, "failed to create notification");
                failed += 1;
            }
        }
        let delivered = users.len() - failed;
        match (delivered, failed) {
            (_, 0) => ChannelOutcome::Delivered { recipients: delivered },
            (0, _) => ChannelOutcome::Failed(format!("{failed} notifications failed")),
            _ => ChannelOutcome::Partial { delivered, failed },
        }
    }
}

#[async_trait]
impl TaskHandler for RepairReminderProcessor {
    async fn process(&self, _ctx: &TaskContext, payload: &[u8]) -> Result<(), TaskError> {
        let payload: RepairReminderPayload = decode_payload(payload)?;
        self.deliver(&payload).await?;
        info!(
            repair_log_id = %payload.repair_log_id,
            workspace_id = %payload.workspace_id,
            "sent repair reminder"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryTaskBroker, TaskState};
    use crate::processors::memory::{InMemoryStore, RecordingPush};

    fn repair(workspace_id: WorkspaceId, reminder_in_days: Option<i64>) -> DueRepair {
        DueRepair {
            repair_log_id: RepairLogId::new(),
            workspace_id,
            inventory_id: InventoryId::new(),
            item_name: "Lawn mower".into(),
            description: "Replace blade".into(),
            reminder_date: reminder_in_days.map(|d| Utc::now() + chrono::Duration::days(d)),
        }
    }

    #[tokio::test]
    async fn scheduler_skips_rows_without_a_date_and_sent_reminders() {
        let ws = WorkspaceId::new();
        let store = Arc::new(InMemoryStore::new());
        let already = repair(ws, Some(1));
        store.add_repair(already.clone());
        store.mark_reminder_sent(already.repair_log_id).await.unwrap();
        store.add_repair(repair(ws, Some(2)));
        store.add_repair(repair(ws, Some(30)));
        let broker = InMemoryTaskBroker::arc();

        let report = RepairReminderScheduler::new(store, broker.clone())
            .schedule_at(Utc::now())
            .await
            .unwrap();

        assert_eq!(report.found, 1);
        assert_eq!(report.enqueued, 1);
        let tasks = broker.in_state(TaskState::Pending);
        assert_eq!(tasks[0].kind, TaskKind::RepairReminder);
    }

    #[test]
    fn rows_without_reminder_date_build_no_payload() {
        assert!(RepairReminderPayload::for_repair(&repair(WorkspaceId::new(), None)).is_none());
    }

    #[tokio::test]
    async fn per_recipient_failures_do_not_stop_the_rest() {
        let ws = WorkspaceId::new();
        let store = Arc::new(InMemoryStore::new());
        let (alice, bob, carol) = (UserId::new(), UserId::new(), UserId::new());
        for user in [alice, bob, carol] {
            store.add_admin(ws, user);
        }
        store.fail_notifications_for(bob);
        let r = repair(ws, Some(1));
        store.add_repair(r.clone());
        let push = Arc::new(RecordingPush::default());

        let processor = RepairReminderProcessor::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Some(push.clone() as Arc<dyn PushSender>),
        );
        let report = processor
            .deliver(&RepairReminderPayload::for_repair(&r).unwrap())
            .await
            .unwrap();

        let notified: Vec<UserId> = store.notifications().iter().map(|n| n.user_id).collect();
        assert_eq!(notified, vec![alice, carol]);
        assert_eq!(
            report.outcome(Channel::InApp),
            Some(&ChannelOutcome::Partial {
                delivered: 2,
                failed: 1
            })
        );
        assert_eq!(push.sent().len(), 1);
        assert!(store.reminder_sent(r.repair_log_id));
    }

    #[tokio::test]
    async fn marking_failure_fails_the_task() {
        let ws = WorkspaceId::new();
        let store = Arc::new(InMemoryStore::new());
        let r = repair(ws, Some(1));
        store.add_repair(r.clone());
        store.fail_mark_sent(true);

        let processor =
            RepairReminderProcessor::new(store.clone(), store.clone(), store.clone(), None);
        let err = processor
            .deliver(&RepairReminderPayload::for_repair(&r).unwrap())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("mark repair reminder sent"));
        assert!(!store.reminder_sent(r.repair_log_id));
    }
}
