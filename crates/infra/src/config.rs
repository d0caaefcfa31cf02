//! Environment-driven configuration for the job runtime.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::adapters::{SmtpConfig, SmtpTls};
use crate::jobs::{QueueConfig, QueueConfigError, WorkerConfig};
use crate::processors::CleanupConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("QUEUE_WEIGHTS: {0}")]
    Queues(#[from] QueueConfigError),
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Required by the worker binary; optional here so tests can build a
    /// config without a database.
    pub database_url: Option<String>,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub stale_grace: Duration,
    pub queues: QueueConfig,
    pub cleanup: CleanupConfig,
    /// Root directory of [`LocalStorage`](crate::adapters::LocalStorage).
    pub storage_root: PathBuf,
    /// `None` when `SMTP_HOST` or `SMTP_FROM` is unset; loan reminders then
    /// go out without email.
    pub smtp: Option<SmtpConfig>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        let worker = WorkerConfig::default();
        Self {
            database_url: None,
            concurrency: worker.concurrency,
            poll_interval: worker.poll_interval,
            shutdown_timeout: worker.shutdown_timeout,
            stale_grace: worker.stale_grace,
            queues: worker.queues,
            cleanup: CleanupConfig::default(),
            storage_root: PathBuf::from("./uploads"),
            smtp: None,
        }
    }
}

impl JobsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let defaults = Self::default();

        let queues = match vars.get("QUEUE_WEIGHTS") {
            Some(raw) => raw.parse()?,
            None => defaults.queues,
        };

        let cleanup = CleanupConfig {
            deleted_records_retention_days: vars.parse_or(
                "CLEANUP_DELETED_RECORDS_RETENTION_DAYS",
                defaults.cleanup.deleted_records_retention_days,
            )?,
            activity_logs_retention_days: vars.parse_or(
                "CLEANUP_ACTIVITY_LOGS_RETENTION_DAYS",
                defaults.cleanup.activity_logs_retention_days,
            )?,
        };

        let storage_root = match vars.get("STORAGE_PATH") {
            Some(path) => PathBuf::from(path),
            None => {
                warn!(
                    path = %defaults.storage_root.display(),
                    "STORAGE_PATH not set, using default storage directory"
                );
                defaults.storage_root
            }
        };

        Ok(Self {
            database_url: vars.get("DATABASE_URL"),
            concurrency: vars.parse_or("WORKER_CONCURRENCY", defaults.concurrency)?,
            poll_interval: Duration::from_millis(vars.parse_or(
                "WORKER_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            shutdown_timeout: Duration::from_secs(vars.parse_or(
                "WORKER_SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout.as_secs(),
            )?),
            stale_grace: Duration::from_secs(
                vars.parse_or("STALE_TASK_GRACE_SECS", defaults.stale_grace.as_secs())?,
            ),
            queues,
            cleanup,
            storage_root,
            smtp: smtp_config(&vars)?,
        })
    }

    /// Postgres pool size: one connection per concurrent task plus two for
    /// polling and maintenance.
    pub fn pool_size(&self) -> Result<u32, ConfigError> {
        u32::try_from(self.concurrency)
            .map(|n| n.saturating_add(2))
            .map_err(|_| ConfigError::Invalid {
                name: "WORKER_CONCURRENCY",
                value: self.concurrency.to_string(),
                reason: format!("must be at most {}", u32::MAX),
            })
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig::default()
            .with_concurrency(self.concurrency)
            .with_poll_interval(self.poll_interval)
            .with_queues(self.queues.clone())
            .with_shutdown_timeout(self.shutdown_timeout);
        config.stale_grace = self.stale_grace;
        config
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set and non-blank.
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn parse_or<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

fn smtp_config<F>(vars: &Vars<F>) -> Result<Option<SmtpConfig>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let (Some(host), Some(from)) = (vars.get("SMTP_HOST"), vars.get("SMTP_FROM")) else {
        warn!("SMTP_HOST or SMTP_FROM not set, loan reminder emails are disabled");
        return Ok(None);
    };

    let mut config = SmtpConfig::new(host, from);
    config.port = vars.parse_or("SMTP_PORT", config.port)?;
    config.username = vars.get("SMTP_USER");
    config.password = vars.get("SMTP_PASSWORD");
    config.timeout = Duration::from_secs(vars.parse_or("SMTP_TIMEOUT_SECS", config.timeout.as_secs())?);
    if let Some(raw) = vars.get("SMTP_TLS") {
        config.tls = SmtpTls::parse(&raw).ok_or_else(|| ConfigError::Invalid {
            name: "SMTP_TLS",
            value: raw.clone(),
            reason: "expected starttls, tls or none".into(),
        })?;
    }
    Ok(Some(config))
}
