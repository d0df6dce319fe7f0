//! # smtplab
//!
//! smtplab is a small SMTP stack for learning and local testing: a server
//! that stores every delivered message in a durable per-recipient mailbox,
//! and a client that composes MIME messages with attachments and submits
//! them.
//!
//! ## Quick Start
//!
//! ```rust
//! use smtplab::{Config, Message, list_mailbox, start_server, stop_server, submit};
//!
//! let dir = tempfile::tempdir()?;
//! let mut config = Config::default();
//! config.server.port = 0;
//! config.storage.path = dir.path().to_path_buf();
//!
//! // Start the server on an ephemeral port
//! let handle = start_server(&config)?;
//! config.server.port = handle.local_addr().port();
//!
//! // Submit a message
//! let message = Message::new(
//!     "alice@example.com",
//!     vec!["bob@example.com".to_string()],
//!     "Hi",
//!     "Hello Bob",
//! );
//! let receipts = submit(&config, &message)?;
//! assert_eq!(receipts[0].id, 1);
//!
//! // Check the mailbox
//! let summaries = list_mailbox(&config, "bob@example.com")?;
//! assert_eq!(summaries[0].subject, "Hi");
//!
//! stop_server(handle);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Supported SMTP commands
//!
//! - `HELO` - Identify the sender
//! - `MAIL FROM` - Specify the sender's address
//! - `RCPT TO` - Specify the destination (multiple destinations are supported)
//! - `DATA` - Send the message, terminated by a line containing only `.`
//! - `RSET` - Reset the current transaction
//! - `NOOP` - Do nothing
//! - `QUIT` - Close connection
//!
//! ## Additional Features
//!
//! Enabling the `ehlo` feature also allows you to use the `EHLO` command.
//!
//! ## Notes
//!
//! - Only the "minimal implementation" defined in RFC 821 is implemented.
//! - SMTP authentication is not supported.
//! - SSL/TLS connection is not supported.
//! - Mail relay is not supported.
//!
//! ## Size Limits
//!
//! The server enforces RFC 821 size limits:
//! - User names: 64 characters max
//! - Domain names: 64 characters max
//! - Paths: 256 characters max
//! - Command lines: 512 characters max
//! - Reply lines: 512 characters max
//!
//! Message limits (subject and body length, recipients, attachment count and
//! size) come from the `[limits]` section of the configuration.
//!
//! ## Mailboxes
//!
//! Every recipient gets a directory under the storage root. Messages are
//! numbered per mailbox starting at 1, in commit order, without gaps.

pub mod client;
pub mod config;
pub mod logging;
mod smtp;

pub use client::SmtpClient;
pub use config::{Config, LoggingConfig, MessageLimits, ServerConfig, StorageConfig};
pub use smtp::{
    Attachment, Command, Delivery, DeliveryReceipt, MailboxStore, Message, MessageSummary,
    ServerHandle, SmtpError, SmtpLimits, SmtpResponse, SmtpServer, SmtpSession, SmtpState,
    StoredMessage,
};

/// Start a server for `config` on a background thread
pub fn start_server(config: &Config) -> Result<ServerHandle, SmtpError> {
    SmtpServer::new(config.clone())?.spawn()
}

/// Stop a server started with [`start_server`]
pub fn stop_server(handle: ServerHandle) {
    handle.stop();
}

/// Submit a message to the server described by `config`
pub fn submit(config: &Config, message: &Message) -> Result<Vec<DeliveryReceipt>, SmtpError> {
    SmtpClient::from_config(config).submit(message)
}

/// Summaries of every message in `address`'s mailbox, oldest first
pub fn list_mailbox(config: &Config, address: &str) -> Result<Vec<MessageSummary>, SmtpError> {
    MailboxStore::open(&config.storage.path)?.list(address)
}

/// Read one message from `address`'s mailbox
pub fn read_message(config: &Config, address: &str, id: u64) -> Result<StoredMessage, SmtpError> {
    MailboxStore::open(&config.storage.path)?.read(address, id)
}

/// Addresses of every mailbox in the store
pub fn mailboxes(config: &Config) -> Result<Vec<String>, SmtpError> {
    MailboxStore::open(&config.storage.path)?.mailboxes()
}
