//! Concrete implementations of the processor ports.

pub mod local_storage;
pub mod smtp;
pub mod thumbnailer;

pub use local_storage::LocalStorage;
pub use smtp::{SmtpConfig, SmtpEmailSender, SmtpTls};
pub use thumbnailer::ImageThumbnailer;
