//! Worker server: polls the broker and runs tasks with bounded concurrency.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::broker::{BrokerError, LEASE_EXPIRED, TaskBroker};
use super::handler::{TaskContext, TaskError, TaskRouter};
use super::queues::QueueConfig;
use super::types::{RetryPolicy, TaskMessage};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Maximum tasks executing at once
    pub concurrency: usize,
    /// Sleep between polls when every queue is empty
    pub poll_interval: Duration,
    pub queues: QueueConfig,
    pub retry: RetryPolicy,
    /// Extra time past a task's timeout before its lease counts as lost
    pub stale_grace: Duration,
    /// How often to recover stale tasks and purge expired completions
    pub maintenance_interval: Duration,
    /// How long shutdown waits for in-flight tasks
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "shelfkeep-worker".to_string(),
            concurrency: 10,
            poll_interval: Duration::from_millis(500),
            queues: QueueConfig::default(),
            retry: RetryPolicy::default(),
            stale_grace: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_queues(mut self, queues: QueueConfig) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Result of running one claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    Retrying { delay: Duration, error: String },
    DeadLettered { error: String },
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_dead_lettered: u64,
    pub tasks_timed_out: u64,
    pub tasks_panicked: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop claiming tasks and wait for in-flight ones (bounded by the
    /// configured shutdown timeout).
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "worker loop terminated abnormally");
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct Shared<B: ?Sized, R> {
    broker: Arc<B>,
    router: R,
    retry: RetryPolicy,
    stats: Arc<Mutex<WorkerStats>>,
}

/// Background task worker.
///
/// Each poll tries every configured queue in a weighted random order and
/// claims at most one task. The claimed task runs on its own tokio task with
/// the task's timeout; success completes it, failure either schedules a retry
/// with backoff or, on the final attempt, archives it and notifies the
/// handler through [`TaskHandler::dead_lettered`](super::TaskHandler::dead_lettered).
pub struct WorkerServer<B: ?Sized, R> {
    shared: Arc<Shared<B, R>>,
    config: WorkerConfig,
}

impl<B, R> WorkerServer<B, R>
where
    B: TaskBroker + ?Sized + 'static,
    R: TaskRouter,
{
    pub fn new(broker: Arc<B>, router: R, config: WorkerConfig) -> Self {
        let shared = Shared {
            broker,
            router,
            retry: config.retry.clone(),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        };
        Self {
            shared: Arc::new(shared),
            config,
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.shared.stats()
    }

    /// Claim and run a single task inline (for testing or synchronous use).
    pub async fn run_once(&self) -> Result<Option<ExecutionOutcome>, BrokerError> {
        let order = self.config.queues.poll_order(&mut rand::thread_rng());
        match self.shared.broker.dequeue(&order).await? {
            Some(msg) => self.shared.execute(msg).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run one maintenance pass inline: recover lost leases, settle tasks
    /// that lost their last attempt, purge expired completions.
    pub async fn run_maintenance(&self) {
        self.shared.maintain(&self.config).await;
    }

    /// Queues holding waiting tasks that this worker never polls.
    pub async fn unserved_queues(&self) -> Result<Vec<String>, BrokerError> {
        self.shared.unserved_queues(&self.config).await
    }

    /// Run tasks inline until no queue has a ready task.
    pub async fn run_until_idle(&self) -> Result<Vec<ExecutionOutcome>, BrokerError> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.run_once().await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Spawn the worker loop on the tokio runtime.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.shared.stats.clone();
        let join = tokio::spawn(worker_loop(self.shared, self.config, shutdown_rx));

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

impl<B, R> Shared<B, R>
where
    B: TaskBroker + ?Sized + 'static,
    R: TaskRouter,
{
    fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    async fn execute(&self, msg: TaskMessage) -> Result<ExecutionOutcome, BrokerError> {
        let ctx = TaskContext::for_message(&msg, Utc::now());
        let span = info_span!(
            "task",
            task_id = %msg.id,
            kind = %msg.kind,
            queue = %msg.queue,
            attempt = ctx.attempt,
        );

        self.update_stats(|s| s.current_running += 1);
        let result = self.attempt(&msg, &ctx).instrument(span).await;
        self.update_stats(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.tasks_processed += 1;
            match &result {
                Ok(ExecutionOutcome::Succeeded) => s.tasks_succeeded += 1,
                Ok(ExecutionOutcome::Retrying { .. }) => {
                    s.tasks_failed += 1;
                    s.tasks_retried += 1;
                }
                Ok(ExecutionOutcome::DeadLettered { .. }) => {
                    s.tasks_failed += 1;
                    s.tasks_dead_lettered += 1;
                }
                Err(_) => s.tasks_failed += 1,
            }
        });
        result
    }

    async fn attempt(
        &self,
        msg: &TaskMessage,
        ctx: &TaskContext,
    ) -> Result<ExecutionOutcome, BrokerError> {
        let handler = self.router.route(msg.kind);
        let run = AssertUnwindSafe(handler.process(ctx, &msg.payload)).catch_unwind();

        let result = match tokio::time::timeout(msg.timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                self.update_stats(|s| s.tasks_panicked += 1);
                Err(TaskError::Panicked(panic_message(panic.as_ref())))
            }
            Err(_) => {
                self.update_stats(|s| s.tasks_timed_out += 1);
                Err(TaskError::DeadlineExceeded(msg.timeout))
            }
        };

        let err = match result {
            Ok(()) => {
                self.broker.complete(msg).await?;
                debug!("task completed");
                return Ok(ExecutionOutcome::Succeeded);
            }
            Err(err) => err,
        };

        let error = err.to_string();
        if ctx.is_final_attempt() {
            self.broker.archive(msg, &error).await?;
            error!(error = %error, retried = msg.retried, "task archived after exhausting retries");
            handler.dead_lettered(ctx, &msg.payload, &error).await;
            return Ok(ExecutionOutcome::DeadLettered { error });
        }

        let delay = self.retry.delay_for_attempt(ctx.attempt);
        let process_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self.broker.retry(msg, process_at, &error).await?;
        warn!(error = %error, delay_ms = delay.as_millis() as u64, "task failed, scheduling retry");
        Ok(ExecutionOutcome::Retrying { delay, error })
    }

    async fn maintain(&self, config: &WorkerConfig) {
        let now = Utc::now();
        match self.broker.recover_stale(now, config.stale_grace).await {
            Ok(recovery) => {
                if recovery.retried > 0 {
                    warn!(worker = %config.name, recovered = recovery.retried, "recovered stale tasks");
                }
                for msg in recovery.archived {
                    self.dead_letter_stale(msg).await;
                }
            }
            Err(e) => error!(worker = %config.name, error = %e, "failed to recover stale tasks"),
        }
        match self.broker.purge_completed(now).await {
            Ok(0) => {}
            Ok(n) => debug!(worker = %config.name, purged = n, "purged completed tasks"),
            Err(e) => error!(worker = %config.name, error = %e, "failed to purge completed tasks"),
        }
        match self.unserved_queues(config).await {
            Ok(queues) => {
                for queue in queues {
                    warn!(worker = %config.name, %queue, "tasks waiting on a queue this worker does not poll");
                }
            }
            Err(e) => error!(worker = %config.name, error = %e, "failed to list pending queues"),
        }
    }

    /// Settle a task archived by lease recovery the same way a failed final
    /// attempt is settled.
    async fn dead_letter_stale(&self, msg: TaskMessage) {
        let ctx = TaskContext::for_message(&msg, Utc::now());
        let error = msg.last_error.as_deref().unwrap_or(LEASE_EXPIRED);
        error!(
            task_id = %msg.id,
            kind = %msg.kind,
            queue = %msg.queue,
            error = %error,
            "task archived after its lease expired on the final attempt"
        );
        self.router
            .route(msg.kind)
            .dead_lettered(&ctx, &msg.payload, error)
            .await;
        self.update_stats(|s| {
            s.tasks_failed += 1;
            s.tasks_dead_lettered += 1;
        });
    }

    async fn unserved_queues(&self, config: &WorkerConfig) -> Result<Vec<String>, BrokerError> {
        let pending = self.broker.pending_queues().await?;
        Ok(pending
            .into_iter()
            .filter(|q| !config.queues.contains(q))
            .collect())
    }
}

async fn worker_loop<B, R>(
    shared: Arc<Shared<B, R>>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) where
    B: TaskBroker + ?Sized + 'static,
    R: TaskRouter,
{
    info!(worker = %config.name, concurrency = config.concurrency, "worker started");

    let started = Instant::now();
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut in_flight = JoinSet::new();
    let mut rng = StdRng::from_entropy();
    let mut next_maintenance = Instant::now();

    loop {
        if *shutdown.borrow() {
            break;
        }
        while in_flight.try_join_next().is_some() {}

        if Instant::now() >= next_maintenance {
            shared.maintain(&config).await;
            next_maintenance = Instant::now() + config.maintenance_interval;
        }
        shared.update_stats(|s| s.uptime_secs = started.elapsed().as_secs());

        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let order = config.queues.poll_order(&mut rng);
        match shared.broker.dequeue(&order).await {
            Ok(Some(msg)) => {
                debug!(worker = %config.name, task_id = %msg.id, kind = %msg.kind, "claimed task");
                let shared = shared.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = shared.execute(msg).await {
                        error!(error = %e, "failed to record task outcome");
                    }
                });
            }
            Ok(None) => {
                drop(permit);
                if sleep_or_shutdown(&mut shutdown, config.poll_interval).await {
                    break;
                }
            }
            Err(e) => {
                drop(permit);
                error!(worker = %config.name, error = %e, "failed to poll queues");
                if sleep_or_shutdown(&mut shutdown, config.poll_interval).await {
                    break;
                }
            }
        }
    }

    info!(worker = %config.name, in_flight = in_flight.len(), "worker stopping");
    let drain = async { while in_flight.join_next().await.is_some() {} };
    if tokio::time::timeout(config.shutdown_timeout, drain).await.is_err() {
        warn!(
            worker = %config.name,
            abandoned = in_flight.len(),
            "shutdown timeout elapsed, cancelling in-flight tasks"
        );
        in_flight.abort_all();
        while in_flight.join_next().await.is_some() {}
    }
    info!(worker = %config.name, "worker stopped");
}

/// Returns `true` when shutdown was requested during the sleep.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::handler::TaskHandler;
    use crate::jobs::memory::InMemoryTaskBroker;
    use crate::jobs::types::{EnqueueOptions, Task, TaskKind, TaskState};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` attempts, then succeeds.
    #[derive(Default)]
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        dead_letters: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskHandler for Flaky {
        async fn process(&self, _ctx: &TaskContext, payload: &[u8]) -> Result<(), TaskError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match payload {
                b"panic" => panic!("boom"),
                b"hang" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
                _ if call < self.failures => Err(TaskError::dependency("send", "smtp timeout")),
                _ => Ok(()),
            }
        }

        async fn dead_lettered(&self, _ctx: &TaskContext, _payload: &[u8], error: &str) {
            self.dead_letters.lock().unwrap().push(error.to_string());
        }
    }

    struct OneHandler(Arc<Flaky>);

    impl TaskRouter for OneHandler {
        fn route(&self, _kind: TaskKind) -> &dyn TaskHandler {
            self.0.as_ref()
        }
    }

    fn server(
        handler: Arc<Flaky>,
    ) -> (Arc<InMemoryTaskBroker>, WorkerServer<InMemoryTaskBroker, OneHandler>) {
        let broker = InMemoryTaskBroker::arc();
        let config = WorkerConfig::default()
            .with_retry(RetryPolicy::linear(Duration::ZERO))
            .with_poll_interval(Duration::from_millis(10));
        let server = WorkerServer::new(broker.clone(), OneHandler(handler), config);
        (broker, server)
    }

    fn task(payload: &[u8]) -> Task {
        Task::new(TaskKind::LoanReminder, payload.to_vec())
    }

    #[tokio::test]
    async fn success_completes_and_removes_task() {
        let handler = Arc::new(Flaky::default());
        let (broker, server) = server(handler.clone());
        broker.submit(task(b"{}")).await.unwrap();

        let outcomes = server.run_until_idle().await.unwrap();

        assert_eq!(outcomes, vec![ExecutionOutcome::Succeeded]);
        assert_eq!(broker.stats().await.unwrap().total(), 0);
        assert_eq!(server.stats().tasks_succeeded, 1);
    }

    #[tokio::test]
    async fn failures_retry_until_success() {
        let handler = Arc::new(Flaky {
            failures: 2,
            ..Default::default()
        });
        let (broker, server) = server(handler.clone());
        broker.submit(task(b"{}")).await.unwrap();

        let outcomes = server.run_until_idle().await.unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0], ExecutionOutcome::Retrying { .. }));
        assert_eq!(outcomes[2], ExecutionOutcome::Succeeded);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(handler.dead_letters.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_archive_and_notify_once() {
        let handler = Arc::new(Flaky {
            failures: u32::MAX,
            ..Default::default()
        });
        let (broker, server) = server(handler.clone());
        broker.submit(task(b"{}")).await.unwrap();

        let outcomes = server.run_until_idle().await.unwrap();

        // One first attempt plus three retries.
        assert_eq!(outcomes.len(), 4);
        let archived = broker.in_state(TaskState::Archived);
        assert_eq!(archived.len(), 1);
        assert!(archived[0].last_error.as_deref().unwrap().contains("smtp timeout"));
        assert_eq!(handler.dead_letters.lock().unwrap().len(), 1);

        let stats = server.stats();
        assert_eq!(stats.tasks_retried, 3);
        assert_eq!(stats.tasks_dead_lettered, 1);
    }

    #[tokio::test]
    async fn panics_count_as_failed_attempts() {
        let handler = Arc::new(Flaky::default());
        let (broker, server) = server(handler.clone());
        broker
            .enqueue(task(b"panic"), EnqueueOptions::default().max_retry(0))
            .await
            .unwrap();

        let outcome = server.run_once().await.unwrap().unwrap();

        match outcome {
            ExecutionOutcome::DeadLettered { error } => assert!(error.contains("boom")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(server.stats().tasks_panicked, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_past_their_timeout_are_abandoned() {
        let handler = Arc::new(Flaky::default());
        let (broker, server) = server(handler.clone());
        broker
            .enqueue(
                task(b"hang"),
                EnqueueOptions::default().timeout(Duration::from_secs(30)),
            )
            .await
            .unwrap();

        let outcome = server.run_once().await.unwrap().unwrap();

        match outcome {
            ExecutionOutcome::Retrying { error, .. } => assert!(error.contains("deadline")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(server.stats().tasks_timed_out, 1);
    }

    #[tokio::test]
    async fn lease_lost_on_final_attempt_notifies_handler() {
        let handler = Arc::new(Flaky::default());
        let (broker, server) = server(handler.clone());
        let mut config = server.config.clone();
        config.stale_grace = Duration::ZERO;
        let server = WorkerServer::new(broker.clone(), OneHandler(handler.clone()), config);
        broker
            .enqueue(
                task(b"{}"),
                EnqueueOptions::default()
                    .max_retry(0)
                    .timeout(Duration::from_millis(1)),
            )
            .await
            .unwrap();
        broker.dequeue(&["default".to_string()]).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        server.run_maintenance().await;

        assert_eq!(broker.in_state(TaskState::Archived).len(), 1);
        assert_eq!(
            handler.dead_letters.lock().unwrap().as_slice(),
            [LEASE_EXPIRED.to_string()]
        );
        assert_eq!(server.stats().tasks_dead_lettered, 1);

        // Already settled; a second pass finds nothing.
        server.run_maintenance().await;
        assert_eq!(handler.dead_letters.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn queues_outside_the_poll_set_are_reported() {
        let handler = Arc::new(Flaky::default());
        let (broker, server) = server(handler);
        broker
            .enqueue(task(b"{}"), EnqueueOptions::default().queue("reports"))
            .await
            .unwrap();
        broker.submit(task(b"{}")).await.unwrap();

        assert_eq!(server.unserved_queues().await.unwrap(), vec!["reports".to_string()]);

        server.run_until_idle().await.unwrap();
        assert_eq!(broker.in_state(TaskState::Pending).len(), 1);
    }

    #[tokio::test]
    async fn started_worker_drains_queue_and_shuts_down() {
        let handler = Arc::new(Flaky::default());
        let (broker, server) = server(handler.clone());
        for _ in 0..5 {
            broker.submit(task(b"{}")).await.unwrap();
        }

        let handle = server.start();
        for _ in 0..200 {
            if handle.stats().tasks_succeeded == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.stats().tasks_succeeded, 5);

        handle.shutdown().await;
        assert_eq!(broker.stats().await.unwrap().total(), 0);
    }
}
