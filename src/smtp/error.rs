//! Error types for the SMTP server, client and mailbox store

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid syntax: {0}")]
    InvalidSyntax(String),

    #[error("Bad sequence of commands: {0}")]
    BadSequence(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Line too long (max {max} characters)")]
    LineTooLong { max: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Server replied {code}: {message}")]
    Rejected { code: String, message: String },

    #[error("Connection timed out")]
    Timeout,

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,
}

/// SMTP size limits as defined in RFC 821
pub struct SmtpLimits;

impl SmtpLimits {
    /// Maximum length of a user name
    pub const USER_MAX_LENGTH: usize = 64;

    /// Maximum length of a domain name
    pub const DOMAIN_MAX_LENGTH: usize = 64;

    /// Maximum length of a path (reverse-path or forward-path)
    pub const PATH_MAX_LENGTH: usize = 256;

    /// Maximum length of a command line including CRLF
    pub const COMMAND_LINE_MAX_LENGTH: usize = 512;

    /// Maximum length of a reply line including CRLF
    pub const REPLY_LINE_MAX_LENGTH: usize = 512;

    /// Maximum length of a text line including CRLF
    pub const TEXT_LINE_MAX_LENGTH: usize = 1000;
}

impl SmtpError {
    /// Convert an I/O error, reporting socket timeouts as [`SmtpError::Timeout`]
    pub fn from_io(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => SmtpError::Timeout,
            _ => SmtpError::Io(error),
        }
    }

    /// Stable name of the error kind, independent of the human-readable reason
    pub fn kind(&self) -> &'static str {
        match self {
            SmtpError::Io(_) => "IoError",
            SmtpError::UnknownCommand(_) => "UnknownCommandError",
            SmtpError::InvalidSyntax(_) => "SyntaxError",
            SmtpError::BadSequence(_) => "BadSequenceError",
            SmtpError::InvalidAddress(_) => "InvalidAddressError",
            SmtpError::LimitExceeded(_) => "LimitExceededError",
            SmtpError::Validation { .. } => "ValidationError",
            SmtpError::MalformedMessage(_) => "MalformedMessageError",
            SmtpError::NotFound(_) => "NotFoundError",
            SmtpError::Store(_) => "StoreError",
            SmtpError::LineTooLong { .. } => "LineTooLongError",
            SmtpError::Config(_) => "ConfigError",
            SmtpError::Rejected { .. } => "RejectedError",
            SmtpError::Timeout => "TimeoutError",
            SmtpError::ConnectionClosed => "ConnectionClosedError",
        }
    }

    /// Maps the error to an SMTP reply code
    pub fn to_response_code(&self) -> &str {
        match self {
            SmtpError::Io(_) => "421",
            SmtpError::UnknownCommand(_) => "500",
            SmtpError::InvalidSyntax(_) => "501",
            SmtpError::BadSequence(_) => "503",
            SmtpError::InvalidAddress(_) => "553",
            SmtpError::LimitExceeded(_) => "552",
            SmtpError::Validation { .. } => "554",
            SmtpError::MalformedMessage(_) => "554",
            SmtpError::NotFound(_) => "550",
            SmtpError::Store(_) => "451",
            SmtpError::LineTooLong { .. } => "500",
            SmtpError::Config(_) => "421",
            SmtpError::Rejected { code, .. } => code,
            SmtpError::Timeout => "421",
            SmtpError::ConnectionClosed => "421",
        }
    }

    /// Reply text sent to the client: the error kind followed by the reason
    pub fn to_response_message(&self) -> String {
        match self {
            SmtpError::Io(_) => "Service not available".to_string(),
            SmtpError::Timeout => "Idle timeout, closing connection".to_string(),
            SmtpError::Rejected { message, .. } => message.clone(),
            other => format!("{}: {other}", other.kind()),
        }
    }

    /// Whether the session can continue after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SmtpError::Io(_)
                | SmtpError::MalformedMessage(_)
                | SmtpError::Timeout
                | SmtpError::ConnectionClosed
        )
    }
}
