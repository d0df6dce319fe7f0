use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use smtplab::{
    Attachment, Config, MailboxStore, Message, SmtpClient, SmtpError, SmtpServer, StoredMessage,
};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "smtplab")]
#[command(about = "Educational SMTP server and client with per-recipient mailboxes")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the SMTP server
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Mailbox storage directory
        #[arg(long)]
        mailboxes: Option<PathBuf>,
    },

    /// Compose and submit a message
    Send {
        /// Sender address
        #[arg(long)]
        from: String,

        /// Recipient address (repeatable or comma-separated)
        #[arg(long, required = true, value_delimiter = ',')]
        to: Vec<String>,

        /// Subject line
        #[arg(long, default_value = "")]
        subject: String,

        /// Message body; read from stdin when omitted
        #[arg(long)]
        body: Option<String>,

        /// File to attach (repeatable)
        #[arg(long)]
        attach: Vec<PathBuf>,
    },

    /// List the messages in a mailbox
    List {
        /// Mailbox address
        address: String,
    },

    /// Show a single message
    Read {
        /// Mailbox address
        address: String,

        /// Message id
        id: u64,
    },

    /// List every known mailbox
    Mailboxes,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = smtplab::logging::init(&config.logging) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run(&args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = e.kind(), "{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, mut config: Config) -> Result<(), SmtpError> {
    match &args.command {
        Command::Serve {
            host,
            port,
            mailboxes,
        } => {
            if let Some(host) = host {
                config.server.host = host.clone();
            }
            if let Some(port) = port {
                config.server.port = *port;
            }
            if let Some(mailboxes) = mailboxes {
                config.storage.path = mailboxes.clone();
            }
            cmd_serve(config)
        }
        Command::Send {
            from,
            to,
            subject,
            body,
            attach,
        } => cmd_send(&config, from, to, subject, body.as_deref(), attach),
        Command::List { address } => cmd_list(&config, args.json, address),
        Command::Read { address, id } => cmd_read(&config, args.json, address, *id),
        Command::Mailboxes => cmd_mailboxes(&config, args.json),
    }
}

fn cmd_serve(config: Config) -> Result<(), SmtpError> {
    info!(
        addr = %config.server.addr(),
        hostname = %config.server.hostname,
        "starting smtplab server"
    );
    SmtpServer::new(config)?.start()
}

fn cmd_send(
    config: &Config,
    from: &str,
    to: &[String],
    subject: &str,
    body: Option<&str>,
    attach: &[PathBuf],
) -> Result<(), SmtpError> {
    let body = match body {
        Some(body) => body.to_string(),
        None => {
            let mut body = String::new();
            std::io::stdin().read_to_string(&mut body)?;
            body
        }
    };

    let recipients = to
        .iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();
    let mut message = Message::new(from, recipients, subject, body);
    for path in attach {
        message = message.with_attachment(Attachment::from_path(path)?);
    }

    let receipts = SmtpClient::from_config(config).submit(&message)?;
    for receipt in receipts {
        println!("{} id={}", receipt.recipient, receipt.id);
    }
    Ok(())
}

fn cmd_list(config: &Config, json: bool, address: &str) -> Result<(), SmtpError> {
    let summaries = MailboxStore::open(&config.storage.path)?.list(address)?;

    if json {
        let out = serde_json::to_string_pretty(&summaries)
            .map_err(|e| SmtpError::Store(e.to_string()))?;
        println!("{out}");
        return Ok(());
    }

    if summaries.is_empty() {
        println!("No messages for {address}");
        return Ok(());
    }
    for summary in summaries {
        println!(
            "{:>5}  {}  {:<30}  {}{}",
            summary.id,
            summary.timestamp.format("%Y-%m-%d %H:%M:%S"),
            summary.sender,
            summary.subject,
            if summary.has_attachments { "  [+]" } else { "" }
        );
    }
    Ok(())
}

/// `read --json` output; attachments are listed without their content
#[derive(Serialize)]
struct MessageView<'a> {
    id: u64,
    committed_at: DateTime<Utc>,
    sender: &'a str,
    recipients: &'a [String],
    subject: &'a str,
    timestamp: DateTime<Utc>,
    body: &'a str,
    attachments: Vec<AttachmentView<'a>>,
}

#[derive(Serialize)]
struct AttachmentView<'a> {
    filename: &'a str,
    content_type: &'a str,
    size: usize,
}

impl<'a> From<&'a StoredMessage> for MessageView<'a> {
    fn from(stored: &'a StoredMessage) -> Self {
        let message = &stored.message;
        Self {
            id: stored.id,
            committed_at: stored.committed_at,
            sender: &message.sender,
            recipients: &message.recipients,
            subject: &message.subject,
            timestamp: message.timestamp,
            body: &message.body,
            attachments: message
                .attachments
                .iter()
                .map(|attachment| AttachmentView {
                    filename: &attachment.filename,
                    content_type: &attachment.content_type,
                    size: attachment.size(),
                })
                .collect(),
        }
    }
}

fn cmd_read(config: &Config, json: bool, address: &str, id: u64) -> Result<(), SmtpError> {
    let stored = MailboxStore::open(&config.storage.path)?.read(address, id)?;

    if json {
        let out = serde_json::to_string_pretty(&MessageView::from(&stored))
            .map_err(|e| SmtpError::Store(e.to_string()))?;
        println!("{out}");
        return Ok(());
    }

    let message = &stored.message;

    println!("Id:      {}", stored.id);
    println!("From:    {}", message.sender);
    println!("To:      {}", message.recipients.join(", "));
    println!("Subject: {}", message.subject);
    println!("Date:    {}", message.timestamp.to_rfc2822());
    for attachment in &message.attachments {
        println!(
            "Attachment: {} ({}, {} bytes)",
            attachment.filename,
            attachment.content_type,
            attachment.size()
        );
    }
    println!();
    println!("{}", message.body);
    Ok(())
}

fn cmd_mailboxes(config: &Config, json: bool) -> Result<(), SmtpError> {
    let addresses = MailboxStore::open(&config.storage.path)?.mailboxes()?;

    if json {
        let out = serde_json::to_string_pretty(&addresses)
            .map_err(|e| SmtpError::Store(e.to_string()))?;
        println!("{out}");
    } else {
        for address in addresses {
            println!("{address}");
        }
    }
    Ok(())
}
