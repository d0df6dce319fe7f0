//! SMTP protocol, message model and mailbox storage

pub mod commands;
pub mod encoding;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod response;
pub mod server;
pub mod session;

pub use commands::Command;
pub use error::{SmtpError, SmtpLimits};
pub use mailbox::{Delivery, DeliveryReceipt, MailboxStore, MessageSummary, StoredMessage};
pub use message::{Attachment, Message};
pub use response::SmtpResponse;
pub use server::{ServerHandle, SmtpServer};
pub use session::{SmtpSession, SmtpState};
