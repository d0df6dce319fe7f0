//! Configuration for the server, the mailbox store and the submission client.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::smtp::SmtpError;

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind (server) or connect to (client).
    #[serde(default = "default_host")]
    pub host: String,
    /// Port number.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Hostname announced in the greeting and HELO replies.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Idle timeout in seconds for a single read or write.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1025
}

fn default_hostname() -> String {
    "smtplab.local".to_string()
}

fn default_timeout() -> u64 {
    300
}

impl ServerConfig {
    /// `host:port` string suitable for binding or connecting.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            hostname: default_hostname(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Mailbox storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding one sub-directory per mailbox.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("mailboxes")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// Per-message limits enforced by both the client and the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageLimits {
    #[serde(default = "default_max_subject_length")]
    pub max_subject_length: usize,
    #[serde(default = "default_max_body_length")]
    pub max_body_length: usize,
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,
    #[serde(default = "default_max_attachments")]
    pub max_attachments: usize,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
}

fn default_max_subject_length() -> usize {
    200
}

fn default_max_body_length() -> usize {
    10_000
}

fn default_max_recipients() -> usize {
    50
}

fn default_max_attachments() -> usize {
    5
}

fn default_max_file_size_mb() -> u64 {
    10
}

impl MessageLimits {
    /// Maximum size of a single attachment in bytes.
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    /// Upper bound on the encoded size of a message that can still pass
    /// validation: base64 attachments, a body of 4-byte characters, and
    /// headroom for headers and part delimiters.
    pub fn max_data_size(&self) -> usize {
        let attachments = (self.max_attachments as u64)
            .saturating_mul(self.max_file_size_bytes())
            .saturating_mul(4)
            / 3;
        let attachments = usize::try_from(attachments).unwrap_or(usize::MAX);
        attachments
            .saturating_add(self.max_body_length.saturating_mul(8))
            .saturating_add(64 * 1024)
    }
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_subject_length: default_max_subject_length(),
            max_body_length: default_max_body_length(),
            max_recipients: default_max_recipients(),
            max_attachments: default_max_attachments(),
            max_file_size_mb: default_max_file_size_mb(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file, appended to alongside stderr.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Complete configuration, one field per TOML section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub limits: MessageLimits,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SmtpError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| SmtpError::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, SmtpError> {
        let config: Config =
            toml::from_str(content).map_err(|e| SmtpError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), SmtpError> {
        if self.limits.max_recipients == 0 {
            return Err(SmtpError::Config(
                "limits.max_recipients must be at least 1".to_string(),
            ));
        }
        if self.server.timeout_secs == 0 {
            return Err(SmtpError::Config(
                "server.timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
