//! SMTP session state management

use crate::smtp::commands::Command;
use crate::smtp::error::SmtpError;

/// Represents the current state of an SMTP session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    /// Greeting sent, no transaction in progress
    Greeting,
    /// MAIL FROM accepted - ready for RCPT commands
    SenderSet,
    /// At least one RCPT TO accepted - ready for DATA or more RCPT commands
    RecipientsSet,
    /// DATA accepted - collecting message lines until the end-of-data marker
    ReceivingData,
    /// Last transaction committed - a new MAIL starts the next one
    Complete,
    /// Fatal error - the connection is closed after the reply
    Aborted,
}

/// Envelope and data of a transaction that reached the end-of-data marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub sender: String,
    pub recipients: Vec<String>,
    /// Raw message bytes with lines joined by CRLF
    pub data: Vec<u8>,
}

/// Manages the state and data for a single SMTP session
#[derive(Debug)]
pub struct SmtpSession {
    /// Current state of the session
    pub state: SmtpState,
    /// Sender address from MAIL FROM command
    pub from: Option<String>,
    /// List of recipients from RCPT TO commands
    pub to: Vec<String>,
    /// Message lines collected during DATA, as received
    pub data: Vec<Vec<u8>>,
    /// Total size of data collected so far, CRLF included
    pub data_size: usize,
    /// Client domain from HELO command
    pub client_domain: Option<String>,
    max_data_size: usize,
    overflowed: bool,
}

impl SmtpSession {
    /// Create a new SMTP session
    pub fn new() -> Self {
        Self {
            state: SmtpState::Greeting,
            from: None,
            to: Vec::new(),
            data: Vec::new(),
            data_size: 0,
            client_domain: None,
            max_data_size: 0,
            overflowed: false,
        }
    }

    /// Drop the current transaction and return to the greeting state
    pub fn reset(&mut self) {
        self.state = SmtpState::Greeting;
        self.from = None;
        self.to.clear();
        self.clear_data();
        // client_domain survives, it belongs to the connection
    }

    /// Record the HELO domain. Any transaction in progress is discarded.
    pub fn set_client_domain(&mut self, domain: String) {
        self.client_domain = Some(domain);
        self.reset();
    }

    /// Start a transaction with the given sender
    pub fn set_sender(&mut self, sender: String) {
        self.reset();
        self.from = Some(sender);
        self.state = SmtpState::SenderSet;
    }

    /// Add a recipient address. The state is untouched when the limit is hit.
    pub fn add_recipient(&mut self, recipient: String, max: usize) -> Result<(), SmtpError> {
        if self.to.len() >= max {
            return Err(SmtpError::LimitExceeded(format!(
                "too many recipients (max {max})"
            )));
        }

        self.to.push(recipient);
        self.state = SmtpState::RecipientsSet;
        Ok(())
    }

    /// Start data collection mode
    pub fn start_data_mode(&mut self, max_data_size: usize) -> Result<(), SmtpError> {
        if self.state != SmtpState::RecipientsSet {
            return Err(SmtpError::BadSequence(
                "DATA command requires MAIL and RCPT first".to_string(),
            ));
        }

        self.clear_data();
        self.max_data_size = max_data_size;
        self.state = SmtpState::ReceivingData;
        Ok(())
    }

    /// Add a line of data during data collection.
    ///
    /// Once the size limit is crossed the remaining lines are discarded and
    /// the transaction fails at the end-of-data marker.
    pub fn add_data_line(&mut self, line: impl Into<Vec<u8>>) {
        if self.overflowed {
            return;
        }

        let line = line.into();
        let line_size = line.len() + 2; // +2 for CRLF
        if self.data_size + line_size > self.max_data_size {
            self.overflowed = true;
            self.data.clear();
            return;
        }

        self.data.push(line);
        self.data_size += line_size;
    }

    /// Finish data collection and hand out the transaction
    pub fn take_transaction(&mut self) -> Result<Transaction, SmtpError> {
        if self.state != SmtpState::ReceivingData {
            return Err(SmtpError::BadSequence(
                "not in data collection mode".to_string(),
            ));
        }
        if self.overflowed {
            return Err(SmtpError::LimitExceeded(format!(
                "message exceeds {} bytes",
                self.max_data_size
            )));
        }

        let sender = self
            .from
            .take()
            .ok_or_else(|| SmtpError::BadSequence("no sender specified".to_string()))?;
        let recipients = std::mem::take(&mut self.to);
        let data = self.data.join(&b"\r\n"[..]);
        self.clear_data();

        Ok(Transaction {
            sender,
            recipients,
            data,
        })
    }

    /// Mark the transaction as committed
    pub fn complete(&mut self) {
        self.from = None;
        self.to.clear();
        self.clear_data();
        self.state = SmtpState::Complete;
    }

    /// Mark the session as failed; the connection is closed after the reply
    pub fn abort(&mut self) {
        self.from = None;
        self.to.clear();
        self.clear_data();
        self.state = SmtpState::Aborted;
    }

    /// Whether incoming lines are message data rather than commands
    pub fn in_data_mode(&self) -> bool {
        self.state == SmtpState::ReceivingData
    }

    /// Whether the connection should be closed
    pub fn is_aborted(&self) -> bool {
        self.state == SmtpState::Aborted
    }

    /// Check if the session is ready for a specific command
    pub fn can_execute(&self, command: &Command) -> bool {
        use SmtpState::*;

        match (command, self.state) {
            (_, ReceivingData | Aborted) => false,
            #[cfg(feature = "ehlo")]
            (Command::Ehlo(_), _) => true,
            (Command::Helo(_), _) => true,
            (Command::Mail(_), Greeting | Complete) => true,
            (Command::Rcpt(_), SenderSet | RecipientsSet) => true,
            (Command::Data, RecipientsSet) => true,
            (Command::Rset | Command::Noop | Command::Quit, _) => true,
            _ => false,
        }
    }

    fn clear_data(&mut self) {
        self.data.clear();
        self.data_size = 0;
        self.overflowed = false;
    }
}

impl Default for SmtpSession {
    fn default() -> Self {
        Self::new()
    }
}
