//! Core task types and policies.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::queues::{DEFAULT_QUEUE, LOW_QUEUE};

/// Broker-assigned task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Every task type the workers understand.
///
/// The wire names returned by [`TaskKind::as_str`] are shared between the
/// schedulers that enqueue and the workers that consume; they must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "loan:reminder")]
    LoanReminder,
    #[serde(rename = "loan:reminder:schedule")]
    LoanReminderSchedule,
    #[serde(rename = "repair:reminder")]
    RepairReminder,
    #[serde(rename = "repair:reminder:schedule")]
    RepairReminderSchedule,
    #[serde(rename = "cleanup:deleted_records")]
    CleanupDeletedRecords,
    #[serde(rename = "cleanup:old_activity")]
    CleanupOldActivity,
    #[serde(rename = "photo:generate_thumbnails")]
    GenerateThumbnails,
}

impl TaskKind {
    pub const ALL: [TaskKind; 7] = [
        TaskKind::LoanReminder,
        TaskKind::LoanReminderSchedule,
        TaskKind::RepairReminder,
        TaskKind::RepairReminderSchedule,
        TaskKind::CleanupDeletedRecords,
        TaskKind::CleanupOldActivity,
        TaskKind::GenerateThumbnails,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::LoanReminder => "loan:reminder",
            TaskKind::LoanReminderSchedule => "loan:reminder:schedule",
            TaskKind::RepairReminder => "repair:reminder",
            TaskKind::RepairReminderSchedule => "repair:reminder:schedule",
            TaskKind::CleanupDeletedRecords => "cleanup:deleted_records",
            TaskKind::CleanupOldActivity => "cleanup:old_activity",
            TaskKind::GenerateThumbnails => "photo:generate_thumbnails",
        }
    }

    /// Enqueue options this kind is normally submitted with.
    pub fn default_options(&self) -> EnqueueOptions {
        match self {
            TaskKind::LoanReminder
            | TaskKind::RepairReminder
            | TaskKind::LoanReminderSchedule
            | TaskKind::RepairReminderSchedule => EnqueueOptions::default(),
            TaskKind::CleanupDeletedRecords | TaskKind::CleanupOldActivity => {
                EnqueueOptions::default()
                    .queue(LOW_QUEUE)
                    .timeout(Duration::from_secs(10 * 60))
            }
            TaskKind::GenerateThumbnails => EnqueueOptions::default()
                .queue(DEFAULT_QUEUE)
                .timeout(Duration::from_secs(5 * 60)),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task kind: {0}")]
pub struct UnknownTaskKind(pub String);

impl FromStr for TaskKind {
    type Err = UnknownTaskKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownTaskKind(s.to_string()))
    }
}

/// A unit of work as submitted by a producer: what to run and with which bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub kind: TaskKind,
    pub payload: Vec<u8>,
}

impl Task {
    pub fn new(kind: TaskKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Task whose payload is the JSON encoding of `payload`.
    pub fn json<T: Serialize>(kind: TaskKind, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_vec(payload)?))
    }

    /// Zero-payload trigger task.
    pub fn trigger(kind: TaskKind) -> Self {
        Self::new(kind, Vec::new())
    }
}

/// Per-enqueue delivery options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub queue: String,
    /// Retries after the first attempt before the task is archived.
    pub max_retry: u32,
    /// Deadline of a single attempt.
    pub timeout: Duration,
    /// How long a completed task stays inspectable (zero = delete at once).
    pub retention: Duration,
    /// Earliest execution time; `None` = as soon as possible.
    pub process_at: Option<DateTime<Utc>>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            max_retry: 3,
            timeout: Duration::from_secs(30),
            retention: Duration::ZERO,
            process_at: None,
        }
    }
}

impl EnqueueOptions {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self
    }

    /// Delay the first execution by `delay` from now.
    pub fn process_in(self, delay: Duration) -> Self {
        let at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self.process_at(at)
    }
}

/// Lifecycle state of a task inside the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Ready to run
    Pending,
    /// Waiting for its `process_at`
    Scheduled,
    /// Claimed by a worker
    Active,
    /// Failed, waiting for its backoff to elapse
    Retry,
    /// Finished, kept for the retention period
    Completed,
    /// Exhausted retries (dead-lettered)
    Archived,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Scheduled => "scheduled",
            TaskState::Active => "active",
            TaskState::Retry => "retry",
            TaskState::Completed => "completed",
            TaskState::Archived => "archived",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Archived)
    }

    /// States a worker may claim once `process_at` has passed.
    pub fn is_claimable(&self) -> bool {
        matches!(
            self,
            TaskState::Pending | TaskState::Scheduled | TaskState::Retry
        )
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "scheduled" => Ok(TaskState::Scheduled),
            "active" => Ok(TaskState::Active),
            "retry" => Ok(TaskState::Retry),
            "completed" => Ok(TaskState::Completed),
            "archived" => Ok(TaskState::Archived),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    Exponential,
    /// Linear backoff: base * attempt
    #[default]
    Linear,
}

/// How long a failed task waits before its next attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(Duration::from_secs(60))
    }
}

impl RetryPolicy {
    /// `attempt × step`, capped at one hour.
    pub fn linear(step: Duration) -> Self {
        Self {
            base_delay: step,
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// A task as stored and handed out by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: Vec<u8>,
    pub queue: String,
    pub state: TaskState,
    pub max_retry: u32,
    /// Failed attempts so far.
    pub retried: u32,
    pub timeout: Duration,
    pub retention: Duration,
    pub process_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskMessage {
    /// Build the stored form of a freshly enqueued task.
    pub fn new(task: Task, opts: EnqueueOptions, now: DateTime<Utc>) -> Self {
        let (state, process_at) = match opts.process_at {
            Some(at) if at > now => (TaskState::Scheduled, at),
            _ => (TaskState::Pending, now),
        };
        Self {
            id: TaskId::new(),
            kind: task.kind,
            payload: task.payload,
            queue: opts.queue,
            state,
            max_retry: opts.max_retry,
            retried: 0,
            timeout: opts.timeout,
            retention: opts.retention,
            process_at,
            last_error: None,
            last_failed_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// 1-indexed number of the attempt currently (or next) running.
    pub fn attempt(&self) -> u32 {
        self.retried + 1
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state.is_claimable() && self.process_at <= now
    }

    /// Whether a failure of the current attempt exhausts the retry budget.
    pub fn retries_exhausted(&self) -> bool {
        self.retried >= self.max_retry
    }
}

/// What the producer gets back from `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub kind: TaskKind,
    pub queue: String,
    pub state: TaskState,
    pub process_at: DateTime<Utc>,
}

impl From<&TaskMessage> for TaskInfo {
    fn from(msg: &TaskMessage) -> Self {
        Self {
            id: msg.id,
            kind: msg.kind,
            queue: msg.queue.clone(),
            state: msg.state,
            process_at: msg.process_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn linear_backoff_is_one_minute_per_attempt_by_default() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(180));
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn wire_names_round_trip() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert!("loan:remind".parse::<TaskKind>().is_err());
    }

    #[test]
    fn default_options_per_kind() {
        let reminder = TaskKind::LoanReminder.default_options();
        assert_eq!(reminder.queue, "default");
        assert_eq!(reminder.max_retry, 3);
        assert_eq!(reminder.timeout, Duration::from_secs(30));

        let thumbs = TaskKind::GenerateThumbnails.default_options();
        assert_eq!(thumbs.timeout, Duration::from_secs(300));
    }

    #[test]
    fn future_process_at_is_scheduled() {
        let now = Utc::now();
        let later = now + chrono::Duration::minutes(5);

        let msg = TaskMessage::new(
            Task::trigger(TaskKind::LoanReminderSchedule),
            EnqueueOptions::default().process_at(later),
            now,
        );
        assert_eq!(msg.state, TaskState::Scheduled);
        assert!(!msg.is_ready(now));
        assert!(msg.is_ready(later));

        let msg = TaskMessage::new(
            Task::trigger(TaskKind::LoanReminderSchedule),
            EnqueueOptions::default(),
            now,
        );
        assert_eq!(msg.state, TaskState::Pending);
        assert_eq!(msg.attempt(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Delays never exceed the cap and never shrink as attempts grow.
        #[test]
        fn backoff_is_capped_and_monotonic(
            base_ms in 1u64..10_000,
            cap_ms in 1u64..1_000_000,
            attempt in 1u32..50,
            linear in any::<bool>(),
        ) {
            let policy = RetryPolicy {
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(cap_ms),
                strategy: if linear { BackoffStrategy::Linear } else { BackoffStrategy::Exponential },
                jitter: 0.0,
            };

            let now = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            prop_assert!(now <= Duration::from_millis(cap_ms.max(base_ms)));
            prop_assert!(now <= next);
        }
    }
}
