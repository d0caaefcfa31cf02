//! Cron scheduler: enqueues trigger tasks at fixed times.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::TaskBroker;
use super::queues::{DEFAULT_QUEUE, LOW_QUEUE};
use super::types::{EnqueueOptions, Task, TaskKind};

/// Canonical schedules (seconds field first, `cron` crate syntax).
pub mod schedules {
    /// Every day at 09:00.
    pub const LOAN_REMINDERS: &str = "0 0 9 * * *";
    /// Every day at 09:00.
    pub const REPAIR_REMINDERS: &str = "0 0 9 * * *";
    /// Sundays at 03:00.
    pub const CLEANUP_DELETED_RECORDS: &str = "0 0 3 * * Sun";
    /// Sundays at 04:00.
    pub const CLEANUP_OLD_ACTIVITY: &str = "0 0 4 * * Sun";
}

/// A fire older than this when the loop wakes up counts as missed.
const MISSED_FIRE_TOLERANCE: chrono::Duration = chrono::Duration::seconds(60);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("cron expression {0:?} never fires")]
    NeverFires(String),
}

/// One registered recurring task.
#[derive(Debug, Clone)]
pub struct CronEntry {
    pub expr: String,
    pub schedule: cron::Schedule,
    pub task: Task,
    pub options: EnqueueOptions,
}

impl CronEntry {
    /// Latest fire in `(from, to]`, if any.
    pub fn last_fire_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&from)
            .take_while(|at| *at <= to)
            .last()
    }

    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// Parse a 5-field (minute resolution) or 6/7-field cron expression.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, SchedulerError> {
    let fields = expr.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {expr}"),
        6 | 7 => expr.to_string(),
        n => {
            return Err(SchedulerError::InvalidCron {
                expr: expr.to_string(),
                reason: format!("expected 5 to 7 fields, got {n}"),
            });
        }
    };
    let schedule =
        cron::Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
    if schedule.upcoming(Utc).next().is_none() {
        return Err(SchedulerError::NeverFires(expr.to_string()));
    }
    Ok(schedule)
}

/// Handle to a running scheduler loop.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "cron scheduler terminated abnormally");
        }
    }
}

/// Enqueues registered trigger tasks whenever their cron expression fires.
///
/// Fire times are evaluated in UTC. The loop sleeps until the next fire; if
/// it wakes up long after a fire (process suspended or down), that fire is
/// skipped rather than backfilled.
pub struct CronScheduler<B: ?Sized> {
    broker: Arc<B>,
    entries: Vec<CronEntry>,
}

impl<B: TaskBroker + ?Sized + 'static> CronScheduler<B> {
    pub fn new(broker: Arc<B>) -> Self {
        Self {
            broker,
            entries: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        expr: &str,
        task: Task,
        options: EnqueueOptions,
    ) -> Result<&CronEntry, SchedulerError> {
        let schedule = parse_cron(expr)?;
        if let Some(next) = schedule.upcoming(Utc).next() {
            debug!(expr, kind = %task.kind, %next, "registered cron entry");
        }
        self.entries.push(CronEntry {
            expr: expr.to_string(),
            schedule,
            task,
            options,
        });
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Install the reminder and cleanup schedules.
    pub fn register_defaults(&mut self) -> Result<(), SchedulerError> {
        let reminders = EnqueueOptions::default().queue(DEFAULT_QUEUE);
        let cleanup = TaskKind::CleanupDeletedRecords.default_options().queue(LOW_QUEUE);

        self.register(
            schedules::LOAN_REMINDERS,
            Task::trigger(TaskKind::LoanReminderSchedule),
            reminders.clone(),
        )?;
        self.register(
            schedules::REPAIR_REMINDERS,
            Task::trigger(TaskKind::RepairReminderSchedule),
            reminders,
        )?;
        self.register(
            schedules::CLEANUP_DELETED_RECORDS,
            Task::trigger(TaskKind::CleanupDeletedRecords),
            cleanup.clone(),
        )?;
        self.register(
            schedules::CLEANUP_OLD_ACTIVITY,
            Task::trigger(TaskKind::CleanupOldActivity),
            cleanup,
        )?;
        Ok(())
    }

    pub fn entries(&self) -> &[CronEntry] {
        &self.entries
    }

    /// Entries with a fire in `(from, to]`, with their latest fire time.
    pub fn due_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<(&CronEntry, DateTime<Utc>)> {
        self.entries
            .iter()
            .filter_map(|e| e.last_fire_between(from, to).map(|at| (e, at)))
            .collect()
    }

    /// Enqueue every entry that fired in `(from, to]`, once each.
    /// Fires older than the missed-fire tolerance are skipped.
    /// Returns the number of tasks enqueued.
    pub async fn fire_due(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> usize {
        let mut enqueued = 0;
        for (entry, fired_at) in self.due_between(from, to) {
            if to - fired_at > MISSED_FIRE_TOLERANCE {
                warn!(expr = %entry.expr, kind = %entry.task.kind, %fired_at, "skipping missed cron fire");
                continue;
            }
            match self
                .broker
                .enqueue(entry.task.clone(), entry.options.clone())
                .await
            {
                Ok(info) => {
                    enqueued += 1;
                    info!(
                        expr = %entry.expr,
                        kind = %entry.task.kind,
                        queue = %info.queue,
                        task_id = %info.id,
                        "enqueued scheduled task"
                    );
                }
                Err(e) => {
                    error!(expr = %entry.expr, kind = %entry.task.kind, error = %e, "failed to enqueue scheduled task");
                }
            }
        }
        enqueued
    }

    fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .filter_map(|e| e.next_fire_after(after))
            .min()
    }

    /// Spawn the scheduler loop on the tokio runtime.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        SchedulerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(entries = self.entries.len(), "cron scheduler started");
        let mut last = Utc::now();

        loop {
            let Some(next) = self.next_fire_after(last) else {
                warn!("no cron entries left to fire");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            // Sleep may return marginally early; never evaluate a window
            // that ends before the fire we waited for.
            let now = Utc::now().max(next);
            self.fire_due(last, now).await;
            last = now;
        }

        info!("cron scheduler stopped");
    }
}
