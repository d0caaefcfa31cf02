//! Primary vs. auxiliary delivery outcomes.
//!
//! A reminder has one primary channel whose failure fails the task (and so
//! triggers a retry) and any number of auxiliary channels whose failures are
//! only logged.

use std::fmt;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Email,
    Push,
    InApp,
    /// Bookkeeping write such as "reminder sent".
    Record,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Email => "email",
            Channel::Push => "push",
            Channel::InApp => "in_app",
            Channel::Record => "record",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    Delivered { recipients: usize },
    /// Channel not configured or nobody to deliver to.
    Skipped(&'static str),
    /// Some recipients failed; the rest were delivered.
    Partial { delivered: usize, failed: usize },
    Failed(String),
}

impl ChannelOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ChannelOutcome::Failed(_) | ChannelOutcome::Partial { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Auxiliary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReport {
    pub channel: Channel,
    pub role: Role,
    pub outcome: ChannelOutcome,
}

/// Per-channel outcomes of one task execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    channels: Vec<ChannelReport>,
}

impl DeliveryReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a best-effort channel. Failures are logged and swallowed.
    pub fn auxiliary(&mut self, channel: Channel, outcome: ChannelOutcome) {
        if outcome.is_failure() {
            warn!(%channel, outcome = ?outcome, "best-effort delivery failed");
        }
        self.channels.push(ChannelReport {
            channel,
            role: Role::Auxiliary,
            outcome,
        });
    }

    /// Record the primary channel and hand its error back to the caller.
    pub fn primary<E: fmt::Display>(
        &mut self,
        channel: Channel,
        result: Result<ChannelOutcome, E>,
    ) -> Result<(), E> {
        let (outcome, result) = match result {
            Ok(outcome) => (outcome, Ok(())),
            Err(e) => (ChannelOutcome::Failed(e.to_string()), Err(e)),
        };
        self.channels.push(ChannelReport {
            channel,
            role: Role::Primary,
            outcome,
        });
        result
    }

    pub fn outcome(&self, channel: Channel) -> Option<&ChannelOutcome> {
        self.channels
            .iter()
            .find(|c| c.channel == channel)
            .map(|c| &c.outcome)
    }

    pub fn channels(&self) -> &[ChannelReport] {
        &self.channels
    }

    pub fn auxiliary_failures(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.role == Role::Auxiliary && c.outcome.is_failure())
            .count()
    }
}

/// Counts from one reminder scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ScheduleReport {
    /// Rows returned by the store query
    pub found: usize,
    pub enqueued: usize,
    /// Rows without a usable contact channel or date
    pub skipped: usize,
    /// Rows whose enqueue failed
    pub failed: usize,
}
