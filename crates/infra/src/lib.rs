//! Infrastructure layer: transactions, background tasks, processors and
//! their Postgres/SMTP/filesystem adapters.

pub mod adapters;
pub mod config;
pub mod event_log;
pub mod jobs;
pub mod postgres;
pub mod processors;
pub mod tx;
