//! Implementation of SMTP commands

use tracing::{debug, info, warn};

use crate::config::MessageLimits;
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::mailbox::MailboxStore;
use crate::smtp::message::{Message, check_address, now};
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::{SmtpSession, SmtpState};

/// A parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `HELO <domain>`
    Helo(String),
    /// `EHLO <domain>`
    #[cfg(feature = "ehlo")]
    Ehlo(String),
    /// `MAIL FROM:<address>`
    Mail(String),
    /// `RCPT TO:<address>`
    Rcpt(String),
    Data,
    Rset,
    Noop,
    Quit,
}

impl Command {
    /// Parse one command line (without its line terminator)
    pub fn parse(command_line: &str) -> Result<Self, SmtpError> {
        if command_line.len() > SmtpLimits::COMMAND_LINE_MAX_LENGTH {
            return Err(SmtpError::LineTooLong {
                max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
            });
        }

        let parts: Vec<&str> = command_line.split_whitespace().collect();
        let Some(verb) = parts.first() else {
            return Err(SmtpError::UnknownCommand(String::new()));
        };

        match verb.to_uppercase().as_str() {
            "HELO" => Ok(Command::Helo(domain_argument("HELO", &parts)?)),
            #[cfg(feature = "ehlo")]
            "EHLO" => Ok(Command::Ehlo(domain_argument("EHLO", &parts)?)),
            "MAIL" => Ok(Command::Mail(path_argument("MAIL", "FROM:", &parts)?)),
            "RCPT" => Ok(Command::Rcpt(path_argument("RCPT", "TO:", &parts)?)),
            "DATA" => no_argument("DATA", &parts, Command::Data),
            "RSET" => no_argument("RSET", &parts, Command::Rset),
            "NOOP" => Ok(Command::Noop),
            "QUIT" => Ok(Command::Quit),
            _ => Err(SmtpError::UnknownCommand(verb.to_string())),
        }
    }
}

fn domain_argument(verb: &str, parts: &[&str]) -> Result<String, SmtpError> {
    match parts.get(1) {
        Some(domain) if domain.len() <= SmtpLimits::DOMAIN_MAX_LENGTH => Ok(domain.to_string()),
        Some(_) => Err(SmtpError::InvalidSyntax(format!(
            "domain name too long (max {} characters)",
            SmtpLimits::DOMAIN_MAX_LENGTH
        ))),
        None => Err(SmtpError::InvalidSyntax(format!(
            "{verb} requires domain argument"
        ))),
    }
}

fn no_argument(verb: &str, parts: &[&str], command: Command) -> Result<Command, SmtpError> {
    if parts.len() > 1 {
        return Err(SmtpError::InvalidSyntax(format!(
            "{verb} command takes no arguments"
        )));
    }
    Ok(command)
}

/// Extract the address from `FROM:<address> [params]` or `TO:<address>`
fn path_argument(verb: &str, keyword: &str, parts: &[&str]) -> Result<String, SmtpError> {
    let argument = parts[1..].join(" ");
    let has_keyword = argument
        .get(..keyword.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(keyword));
    if !has_keyword {
        return Err(SmtpError::InvalidSyntax(format!(
            "{verb} command must be '{verb} {keyword}<address>'"
        )));
    }

    let path = argument[keyword.len()..].trim_start();
    let Some(rest) = path.strip_prefix('<') else {
        return Err(SmtpError::InvalidSyntax(
            "address must be enclosed in angle brackets".to_string(),
        ));
    };
    let Some(end) = rest.find('>') else {
        return Err(SmtpError::InvalidSyntax(
            "address must be enclosed in angle brackets".to_string(),
        ));
    };

    // ESMTP parameters after the closing bracket are accepted and ignored
    Ok(rest[..end].to_string())
}

/// Handles SMTP commands and returns appropriate responses
#[derive(Debug)]
pub struct SmtpCommandHandler<'a> {
    hostname: &'a str,
    limits: &'a MessageLimits,
    store: &'a MailboxStore,
}

impl<'a> SmtpCommandHandler<'a> {
    /// Create a new command handler
    pub fn new(hostname: &'a str, limits: &'a MessageLimits, store: &'a MailboxStore) -> Self {
        Self {
            hostname,
            limits,
            store,
        }
    }

    /// Process a command line and return a response
    pub fn process_command(
        &self,
        command_line: &str,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        let command = Command::parse(command_line)?;
        if !session.can_execute(&command) {
            return Err(SmtpError::BadSequence(sequence_hint(&command, &session.state)));
        }

        match command {
            Command::Helo(domain) => {
                session.set_client_domain(domain.clone());
                Ok(SmtpResponse::helo(self.hostname, &domain))
            }
            #[cfg(feature = "ehlo")]
            Command::Ehlo(domain) => {
                session.set_client_domain(domain.clone());
                Ok(SmtpResponse::ehlo(
                    self.hostname,
                    &domain,
                    self.limits.max_data_size(),
                ))
            }
            Command::Mail(addr) => {
                check_address(&addr).map_err(SmtpError::InvalidAddress)?;
                session.set_sender(addr);
                Ok(SmtpResponse::ok())
            }
            Command::Rcpt(addr) => {
                check_address(&addr).map_err(SmtpError::InvalidAddress)?;
                session.add_recipient(addr, self.limits.max_recipients)?;
                Ok(SmtpResponse::ok())
            }
            Command::Data => {
                session.start_data_mode(self.limits.max_data_size())?;
                Ok(SmtpResponse::data_start())
            }
            Command::Rset => {
                session.reset();
                Ok(SmtpResponse::ok())
            }
            Command::Noop => Ok(SmtpResponse::ok()),
            Command::Quit => Ok(SmtpResponse::quit()),
        }
    }

    /// Handle the end-of-data marker: decode, validate and commit the
    /// message.
    ///
    /// Any failure leaves the session aborted. A commit that fails for some
    /// recipients is reported with a 451 reply listing every recipient.
    pub fn finish_data(&self, session: &mut SmtpSession) -> Result<SmtpResponse, SmtpError> {
        let transaction = match session.take_transaction() {
            Ok(transaction) => transaction,
            Err(e) => {
                session.abort();
                return Err(e);
            }
        };

        let mut message = match Message::decode(&transaction.data) {
            Ok(message) => message,
            Err(e) => {
                session.abort();
                return Err(e);
            }
        };
        message.timestamp = now();

        if let Err(e) = message.validate(self.limits) {
            debug!(error = %e, "message failed validation");
            session.abort();
            return Err(e);
        }

        let deliveries = self.store.commit(&message, &transaction.recipients);
        let response = SmtpResponse::delivered(&deliveries);
        if response.is_success() {
            info!(
                sender = %transaction.sender,
                recipients = deliveries.len(),
                subject = %message.subject,
                "message delivered"
            );
            session.complete();
        } else {
            warn!(sender = %transaction.sender, "delivery failed for some recipients");
            session.abort();
        }
        Ok(response)
    }
}

fn sequence_hint(command: &Command, state: &SmtpState) -> String {
    match (command, state) {
        (Command::Mail(_), SmtpState::SenderSet | SmtpState::RecipientsSet) => {
            "sender already specified, use RSET to start over".to_string()
        }
        (Command::Mail(_), _) => "MAIL command not allowed now".to_string(),
        (Command::Rcpt(_), _) => "RCPT command requires MAIL first".to_string(),
        (Command::Data, SmtpState::SenderSet) => {
            "DATA command requires at least one recipient".to_string()
        }
        (Command::Data, _) => "DATA command requires MAIL and RCPT first".to_string(),
        _ => format!("command not allowed in state {state:?}"),
    }
}
