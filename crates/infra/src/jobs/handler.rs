//! Handler contract between the worker and task processors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use super::types::{TaskId, TaskKind, TaskMessage};
use crate::tx::BoxError;

/// What a handler knows about the attempt it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub queue: String,
    /// 1-indexed attempt number.
    pub attempt: u32,
    pub max_retry: u32,
    /// Point at which the worker abandons this attempt.
    pub deadline: DateTime<Utc>,
}

impl TaskContext {
    pub fn for_message(msg: &TaskMessage, started: DateTime<Utc>) -> Self {
        Self {
            task_id: msg.id,
            kind: msg.kind,
            queue: msg.queue.clone(),
            attempt: msg.attempt(),
            max_retry: msg.max_retry,
            deadline: started + chrono::Duration::from_std(msg.timeout).unwrap_or_default(),
        }
    }

    /// Whether a failure now would archive the task instead of retrying it.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt > self.max_retry
    }
}

/// Failure of one task attempt. Every variant counts against the retry budget.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("{context}: {source}")]
    Dependency {
        context: String,
        #[source]
        source: BoxError,
    },
    #[error("task exceeded its {0:?} deadline")]
    DeadlineExceeded(std::time::Duration),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn dependency(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Dependency {
            context: context.into(),
            source: source.into(),
        }
    }
}

/// Decode a JSON task payload.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, TaskError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Processes tasks of one kind.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn process(&self, ctx: &TaskContext, payload: &[u8]) -> Result<(), TaskError>;

    /// Called once after the task was archived with its final error.
    async fn dead_lettered(&self, _ctx: &TaskContext, _payload: &[u8], _error: &str) {}
}

/// Maps every task kind to its handler.
///
/// Implementations match exhaustively on [`TaskKind`], so a kind without a
/// handler does not compile.
pub trait TaskRouter: Send + Sync + 'static {
    fn route(&self, kind: TaskKind) -> &dyn TaskHandler;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{EnqueueOptions, Task};

    #[test]
    fn final_attempt_tracks_retry_budget() {
        let now = Utc::now();
        let mut msg = TaskMessage::new(
            Task::trigger(TaskKind::CleanupOldActivity),
            EnqueueOptions::default().max_retry(2),
            now,
        );

        let ctx = TaskContext::for_message(&msg, now);
        assert_eq!(ctx.attempt, 1);
        assert!(!ctx.is_final_attempt());
        assert_eq!(ctx.deadline, now + chrono::Duration::seconds(30));

        msg.retried = 2;
        assert!(TaskContext::for_message(&msg, now).is_final_attempt());
    }

    #[test]
    fn dependency_errors_keep_the_cause_in_the_message() {
        let err = TaskError::dependency("send loan reminder email", "smtp timeout");
        assert_eq!(err.to_string(), "send loan reminder email: smtp timeout");

        let err = decode_payload::<serde_json::Value>(b"{not json").unwrap_err();
        assert!(matches!(err, TaskError::Payload(_)));
    }
}
