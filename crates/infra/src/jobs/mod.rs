//! Background task system: broker, worker server and cron scheduler.
//!
//! ## Design
//!
//! - Task kinds are a closed enum with stable wire names
//! - Named queues polled in weighted random order (`critical`, `default`, `low`)
//! - Linear backoff retries, then archive (dead-letter) for inspection/replay
//! - Per-attempt timeout; panics and timeouts count as failed attempts
//! - At-least-once delivery: handlers must tolerate redelivery
//!
//! ## Components
//!
//! - `TaskBroker`: persistence and dispatch (in-memory or Postgres)
//! - `WorkerServer`: bounded-concurrency executor driven by a `TaskRouter`
//! - `CronScheduler`: enqueues trigger tasks on cron schedules

pub mod broker;
pub mod handler;
pub mod memory;
pub mod queues;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use broker::{BrokerError, BrokerStats, LEASE_EXPIRED, StaleRecovery, TaskBroker};
pub use handler::{TaskContext, TaskError, TaskHandler, TaskRouter, decode_payload};
pub use memory::InMemoryTaskBroker;
pub use queues::{CRITICAL_QUEUE, DEFAULT_QUEUE, LOW_QUEUE, QueueConfig, QueueConfigError};
pub use scheduler::{CronEntry, CronScheduler, SchedulerError, SchedulerHandle, parse_cron, schedules};
pub use types::{
    BackoffStrategy, EnqueueOptions, RetryPolicy, Task, TaskId, TaskInfo, TaskKind, TaskMessage,
    TaskState, UnknownTaskKind,
};
pub use worker::{ExecutionOutcome, WorkerConfig, WorkerHandle, WorkerServer, WorkerStats};
