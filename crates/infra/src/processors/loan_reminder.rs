//! Loan reminders: daily scan of due loans and per-loan email delivery.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use shelfkeep_core::{LoanId, WorkspaceId};

use super::notify;
use super::outcome::{Channel, ChannelOutcome, DeliveryReport, ScheduleReport};
use super::ports::{DueLoan, EmailSender, LoanStore, MemberDirectory, PushMessage, PushSender, StoreError};
use crate::jobs::{Task, TaskBroker, TaskContext, TaskError, TaskHandler, TaskKind, decode_payload};

/// Loans due within this window (overdue ones included) get a reminder.
pub const REMINDER_WINDOW: chrono::Duration = chrono::Duration::days(3);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanReminderPayload {
    pub loan_id: LoanId,
    pub workspace_id: WorkspaceId,
    pub borrower_name: String,
    pub borrower_email: String,
    pub item_name: String,
    pub due_date: DateTime<Utc>,
    pub is_overdue: bool,
}

impl LoanReminderPayload {
    /// `None` when the loan has no usable borrower email.
    pub fn for_loan(loan: &DueLoan, now: DateTime<Utc>) -> Option<Self> {
        let email = loan
            .borrower_email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())?;
        Some(Self {
            loan_id: loan.loan_id,
            workspace_id: loan.workspace_id,
            borrower_name: loan.borrower_name.clone(),
            borrower_email: email.to_string(),
            item_name: loan.item_name.clone(),
            due_date: loan.due_date,
            is_overdue: loan.due_date < now,
        })
    }

    fn push_message(&self) -> PushMessage {
        let (title, body) = if self.is_overdue {
            (
                "Overdue loan".to_string(),
                format!(
                    "{} borrowed by {} was due on {}",
                    self.item_name,
                    self.borrower_name,
                    self.due_date.format("%Y-%m-%d")
                ),
            )
        } else {
            (
                "Loan due soon".to_string(),
                format!(
                    "{} borrowed by {} is due on {}",
                    self.item_name,
                    self.borrower_name,
                    self.due_date.format("%Y-%m-%d")
                ),
            )
        };

        let mut data = Map::new();
        data.insert("type".into(), Value::from("loan_reminder"));
        data.insert("loan_id".into(), Value::from(self.loan_id.to_string()));
        data.insert("workspace_id".into(), Value::from(self.workspace_id.to_string()));

        PushMessage {
            title,
            body,
            icon: Some("/icons/icon-192.png".into()),
            badge: Some("/icons/badge-72.png".into()),
            tag: Some(format!("loan-reminder-{}", self.loan_id)),
            url: Some("/loans".into()),
            data,
        }
    }
}

/// Fan-out trigger: finds due loans and enqueues one reminder task each.
///
/// Loans carry no "reminder sent" marker, so a loan is reminded again on
/// every run until it is returned.
pub struct LoanReminderScheduler {
    loans: Arc<dyn LoanStore>,
    broker: Arc<dyn TaskBroker>,
}

impl LoanReminderScheduler {
    pub fn new(loans: Arc<dyn LoanStore>, broker: Arc<dyn TaskBroker>) -> Self {
        Self { loans, broker }
    }

    pub async fn schedule_at(&self, now: DateTime<Utc>) -> Result<ScheduleReport, StoreError> {
        let due = self.loans.due_loans(now + REMINDER_WINDOW).await?;
        let mut report = ScheduleReport {
            found: due.len(),
            ..Default::default()
        };

        for loan in &due {
            let Some(payload) = LoanReminderPayload::for_loan(loan, now) else {
                debug!(loan_id = %loan.loan_id, "skipping loan without borrower email");
                report.skipped += 1;
                continue;
            };

            let task = match Task::json(TaskKind::LoanReminder, &payload) {
                Ok(task) => task,
                Err(e) => {
                    error!(loan_id = %loan.loan_id, error = %e, "failed to encode loan reminder");
                    report.failed += 1;
                    continue;
                }
            };

            match self.broker.submit(task).await {
                Ok(info) => {
                    debug!(loan_id = %loan.loan_id, task_id = %info.id, "enqueued loan reminder");
                    report.enqueued += 1;
                }
                Err(e) => {
                    error!(loan_id = %loan.loan_id, error = %e, "failed to enqueue loan reminder");
                    report.failed += 1;
                }
            }
        }

        info!(
            found = report.found,
            enqueued = report.enqueued,
            skipped = report.skipped,
            failed = report.failed,
            "scheduled loan reminders"
        );
        Ok(report)
    }
}

#[async_trait]
impl TaskHandler for LoanReminderScheduler {
    async fn process(&self, _ctx: &TaskContext, _payload: &[u8]) -> Result<(), TaskError> {
        self.schedule_at(Utc::now())
            .await
            .map_err(|e| TaskError::dependency("query due loans", e))?;
        Ok(())
    }
}

/// Sends one loan reminder. Email is the primary channel; push is best-effort.
pub struct LoanReminderProcessor {
    email: Option<Arc<dyn EmailSender>>,
    push: Option<Arc<dyn PushSender>>,
    members: Arc<dyn MemberDirectory>,
}

impl LoanReminderProcessor {
    pub fn new(
        email: Option<Arc<dyn EmailSender>>,
        push: Option<Arc<dyn PushSender>>,
        members: Arc<dyn MemberDirectory>,
    ) -> Self {
        Self {
            email,
            push,
            members,
        }
    }

    pub async fn deliver(&self, payload: &LoanReminderPayload) -> Result<DeliveryReport, TaskError> {
        let mut report = DeliveryReport::new();

        let push = match notify::recipients(self.members.as_ref(), payload.workspace_id).await {
            Ok(users) => notify::push(self.push.as_ref(), &users, &payload.push_message()).await,
            Err(failed) => failed,
        };
        report.auxiliary(Channel::Push, push);

        let email = match &self.email {
            None => Ok(ChannelOutcome::Skipped("email not configured")),
            Some(sender) => sender
                .send_loan_reminder(
                    &payload.borrower_email,
                    &payload.borrower_name,
                    &payload.item_name,
                    payload.due_date,
                    payload.is_overdue,
                )
                .await
                .map(|()| ChannelOutcome::Delivered { recipients: 1 })
                .map_err(|e| TaskError::dependency("send loan reminder email", e)),
        };
        report.primary(Channel::Email, email)?;

        Ok(report)
    }
}

#[async_trait]
impl TaskHandler for LoanReminderProcessor {
    async fn process(&self, _ctx: &TaskContext, payload: &[u8]) -> Result<(), TaskError> {
        let payload: LoanReminderPayload = decode_payload(payload)?;
        let report = self.deliver(&payload).await?;

        if report.outcome(Channel::Email) == Some(&ChannelOutcome::Skipped("email not configured")) {
            warn!(loan_id = %payload.loan_id, "no email sender configured, reminder not emailed");
        }
        info!(
            loan_id = %payload.loan_id,
            workspace_id = %payload.workspace_id,
            overdue = payload.is_overdue,
            "sent loan reminder"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryTaskBroker, TaskState};
    use crate::processors::memory::{InMemoryStore, RecordingEmail, RecordingPush};

    fn due_loan(email: Option<&str>, due_in_days: i64, now: DateTime<Utc>) -> DueLoan {
        DueLoan {
            loan_id: LoanId::new(),
            workspace_id: WorkspaceId::new(),
            borrower_name: "Ada".into(),
            borrower_email: email.map(String::from),
            item_name: "Drill".into(),
            due_date: now + chrono::Duration::days(due_in_days),
        }
    }

    #[tokio::test]
    async fn loans_without_email_are_skipped_and_scan_continues() {
        let now = Utc::now();
        let store = Arc::new(InMemoryStore::new());
        store.add_loan(due_loan(None, 1, now));
        store.add_loan(due_loan(Some("  "), 1, now));
        store.add_loan(due_loan(Some("ada@example.com"), 2, now));
        store.add_loan(due_loan(Some("bob@example.com"), -10, now));
        store.add_loan(due_loan(Some("far@example.com"), 10, now));
        let broker = InMemoryTaskBroker::arc();

        let scheduler = LoanReminderScheduler::new(store, broker.clone());
        let report = scheduler.schedule_at(now).await.unwrap();

        assert_eq!(
            report,
            ScheduleReport {
                found: 4,
                enqueued: 2,
                skipped: 2,
                failed: 0
            }
        );

        let tasks = broker.in_state(TaskState::Pending);
        assert!(tasks.iter().all(|t| t.kind == TaskKind::LoanReminder && t.queue == "default"));
        let overdue: Vec<bool> = tasks
            .iter()
            .map(|t| decode_payload::<LoanReminderPayload>(&t.payload).unwrap().is_overdue)
            .collect();
        assert!(overdue.contains(&true) && overdue.contains(&false));
    }

    #[tokio::test]
    async fn loans_are_reminded_again_on_the_next_run() {
        let now = Utc::now();
        let store = Arc::new(InMemoryStore::new());
        store.add_loan(due_loan(Some("ada@example.com"), 1, now));
        let broker = InMemoryTaskBroker::arc();
        let scheduler = LoanReminderScheduler::new(store, broker.clone());

        scheduler.schedule_at(now).await.unwrap();
        scheduler.schedule_at(now + chrono::Duration::days(1)).await.unwrap();

        assert_eq!(broker.stats().await.unwrap().pending, 2);
    }

    fn payload(now: DateTime<Utc>) -> LoanReminderPayload {
        LoanReminderPayload::for_loan(&due_loan(Some("ada@example.com"), 2, now), now).unwrap()
    }

    #[tokio::test]
    async fn push_failure_does_not_fail_the_reminder() {
        let store = Arc::new(InMemoryStore::new());
        let p = payload(Utc::now());
        store.add_admin(p.workspace_id, shelfkeep_core::UserId::new());
        let email = Arc::new(RecordingEmail::default());
        let push = Arc::new(RecordingPush::failing("push service down"));

        let processor = LoanReminderProcessor::new(
            Some(email.clone() as Arc<dyn EmailSender>),
            Some(push as Arc<dyn PushSender>),
            store,
        );
        let report = processor.deliver(&p).await.unwrap();

        assert_eq!(email.sent().len(), 1);
        assert_eq!(report.auxiliary_failures(), 1);
    }

    #[tokio::test]
    async fn missing_email_sender_is_not_an_error() {
        let processor = LoanReminderProcessor::new(None, None, Arc::new(InMemoryStore::new()));
        let report = processor.deliver(&payload(Utc::now())).await.unwrap();

        assert_eq!(
            report.outcome(Channel::Email),
            Some(&ChannelOutcome::Skipped("email not configured"))
        );
        assert_eq!(
            report.outcome(Channel::Push),
            Some(&ChannelOutcome::Skipped("push not configured"))
        );
    }

    #[tokio::test]
    async fn malformed_payloads_fail_with_payload_error() {
        let processor = LoanReminderProcessor::new(None, None, Arc::new(InMemoryStore::new()));
        let ctx = TaskContext {
            task_id: crate::jobs::TaskId::new(),
            kind: TaskKind::LoanReminder,
            queue: "default".into(),
            attempt: 1,
            max_retry: 3,
            deadline: Utc::now(),
        };

        let err = processor
            .process(&ctx, br#"{"loan_id":"not-a-uuid"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Payload(_)));
    }
}
