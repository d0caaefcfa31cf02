//! SMTP email delivery via lettre.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use crate::processors::{EmailSender, PortError};

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmtpTls {
    #[default]
    StartTls,
    /// Implicit TLS (usually port 465).
    Tls,
    /// Plaintext; local relays and mail catchers only.
    None,
}

impl SmtpTls {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "starttls" => Some(Self::StartTls),
            "tls" => Some(Self::Tls),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub tls: SmtpTls,
    pub timeout: Duration,
}

impl SmtpConfig {
    pub fn new(host: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 587,
            username: None,
            password: None,
            from: from.into(),
            tls: SmtpTls::default(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct SmtpEmailSender {
    transport: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    from: Mailbox,
}

impl SmtpEmailSender {
    pub fn from_config(config: SmtpConfig) -> Result<Self, PortError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|_| PortError::unavailable(format!("invalid sender address: {}", config.from)))?;

        let mut builder = match config.tls {
            SmtpTls::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
            SmtpTls::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| PortError::unavailable(e.to_string()))?,
            SmtpTls::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| PortError::unavailable(e.to_string()))?,
        };
        builder = builder.port(config.port).timeout(Some(config.timeout));
        if let (Some(username), Some(password)) = (config.username, config.password) {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self {
            transport: Arc::new(builder.build()),
            from,
        })
    }

    fn loan_reminder(
        &self,
        to: &str,
        borrower_name: &str,
        item_name: &str,
        due_date: DateTime<Utc>,
        is_overdue: bool,
    ) -> Result<Message, PortError> {
        let to: Mailbox = to
            .parse()
            .map_err(|_| PortError::unavailable(format!("invalid recipient address: {to}")))?;
        let (subject, body) = reminder_text(borrower_name, item_name, due_date, is_overdue);
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .body(body)
            .map_err(|e| PortError::unavailable(e.to_string()))
    }
}

fn reminder_text(
    borrower_name: &str,
    item_name: &str,
    due_date: DateTime<Utc>,
    is_overdue: bool,
) -> (String, String) {
    let due = due_date.format("%B %-d, %Y");
    if is_overdue {
        (
            format!("Overdue: please return {item_name}"),
            format!(
                "Hi {borrower_name},\n\n{item_name} was due back on {due}. Please return it as soon as possible.\n"
            ),
        )
    } else {
        (
            format!("Reminder: {item_name} is due {due}"),
            format!("Hi {borrower_name},\n\nA friendly reminder that {item_name} is due back on {due}.\n"),
        )
    }
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send_loan_reminder(
        &self,
        to: &str,
        borrower_name: &str,
        item_name: &str,
        due_date: DateTime<Utc>,
        is_overdue: bool,
    ) -> Result<(), PortError> {
        let message = self.loan_reminder(to, borrower_name, item_name, due_date, is_overdue)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| PortError::unavailable(e.to_string()))?;
        debug!(overdue = is_overdue, "loan reminder email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn overdue_reminders_say_so() {
        let due = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let (subject, body) = reminder_text("Ada", "Drill", due, true);
        assert_eq!(subject, "Overdue: please return Drill");
        assert!(body.contains("was due back on March 2, 2026"));

        let (subject, _) = reminder_text("Ada", "Drill", due, false);
        assert_eq!(subject, "Reminder: Drill is due March 2, 2026");
    }

    #[tokio::test]
    async fn rejects_malformed_addresses() {
        let mut config = SmtpConfig::new("localhost", "not an address");
        config.tls = SmtpTls::None;
        assert!(SmtpEmailSender::from_config(config).is_err());

        let mut config = SmtpConfig::new("localhost", "Shelfkeep <noreply@example.com>");
        config.tls = SmtpTls::None;
        let sender = SmtpEmailSender::from_config(config).unwrap();
        let due = Utc::now();
        assert!(sender.loan_reminder("nope", "Ada", "Drill", due, false).is_err());
        assert!(sender.loan_reminder("ada@example.com", "Ada", "Drill", due, false).is_ok());
    }

    #[test]
    fn tls_modes_parse() {
        assert_eq!(SmtpTls::parse("STARTTLS"), Some(SmtpTls::StartTls));
        assert_eq!(SmtpTls::parse("none"), Some(SmtpTls::None));
        assert_eq!(SmtpTls::parse("ssl"), None);
    }
}
