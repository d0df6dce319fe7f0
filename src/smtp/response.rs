//! SMTP response handling

use std::io::BufRead;

use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::mailbox::{Delivery, DeliveryReceipt};

/// Represents an SMTP response that can be sent to a client
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    /// The SMTP response code (e.g., "250", "354", "500")
    pub code: String,
    /// The human-readable message
    pub message: String,
    /// Additional lines of a multiline response
    pub multiline: Option<Vec<String>>,
}

impl SmtpResponse {
    /// Create a new SMTP response
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            multiline: None,
        }
    }

    /// Create a new multiline SMTP response
    pub fn new_multiline(code: &str, message: &str, lines: Vec<String>) -> Self {
        Self {
            code: code.to_owned(),
            message: message.to_owned(),
            multiline: if lines.is_empty() { None } else { Some(lines) },
        }
    }

    /// Create a success response (250 OK)
    pub fn ok() -> Self {
        Self::new("250", "OK")
    }

    /// Create a greeting response (220)
    pub fn greeting(hostname: &str) -> Self {
        Self::new("220", &format!("{hostname} SMTP lab service ready"))
    }

    /// Create a HELO response (250)
    pub fn helo(hostname: &str, client_domain: &str) -> Self {
        Self::new("250", &format!("{hostname} Hello {client_domain}"))
    }

    /// Create an EHLO response (250) with capabilities
    #[cfg(feature = "ehlo")]
    pub fn ehlo(hostname: &str, client_domain: &str, max_size: usize) -> Self {
        let capabilities = vec!["8BITMIME".to_owned(), format!("SIZE {max_size}")];
        Self::new_multiline(
            "250",
            &format!("{hostname} Hello {client_domain}"),
            capabilities,
        )
    }

    /// Create a DATA intermediate response (354)
    pub fn data_start() -> Self {
        Self::new("354", "End data with <CR><LF>.<CR><LF>")
    }

    /// Create a QUIT response (221)
    pub fn quit() -> Self {
        Self::new("221", "Bye")
    }

    /// Create an error response from an error
    pub fn error(code: &str, message: &str) -> Self {
        Self::new(code, message)
    }

    /// Create the reply to END_DATA: one line per recipient with either the
    /// assigned id or the reason the commit failed
    pub fn delivered(deliveries: &[Delivery]) -> Self {
        let lines = deliveries.iter().map(Delivery::describe).collect();
        if deliveries.iter().all(|delivery| delivery.result.is_ok()) {
            Self::new_multiline("250", "Message accepted for delivery", lines)
        } else {
            Self::new_multiline("451", "Delivery failed for some recipients", lines)
        }
    }

    /// Recipient ids reported by a [`SmtpResponse::delivered`] reply
    pub fn receipts(&self) -> Vec<DeliveryReceipt> {
        self.multiline
            .iter()
            .flatten()
            .filter_map(|line| DeliveryReceipt::parse(line))
            .collect()
    }

    /// Full reply text, one line per response line
    pub fn text(&self) -> String {
        let mut text = self.message.clone();
        for line in self.multiline.iter().flatten() {
            text.push('\n');
            text.push_str(line);
        }
        text
    }

    /// Format the response for sending over the wire
    pub fn format(&self) -> String {
        if let Some(ref lines) = self.multiline {
            let mut result = format!("{}-{}\r\n", self.code, self.message);
            for (i, line) in lines.iter().enumerate() {
                if i == lines.len() - 1 {
                    // Last line uses space instead of dash
                    result.push_str(&format!("{} {}\r\n", self.code, line));
                } else {
                    result.push_str(&format!("{}-{}\r\n", self.code, line));
                }
            }
            result
        } else {
            format!("{} {}\r\n", self.code, self.message)
        }
    }

    /// Clip every line so the formatted reply respects the reply line limit
    pub fn truncated(&self) -> Self {
        // code, separator and CRLF
        let max = SmtpLimits::REPLY_LINE_MAX_LENGTH - 6;
        Self {
            code: self.code.clone(),
            message: clip(&self.message, max),
            multiline: self
                .multiline
                .as_ref()
                .map(|lines| lines.iter().map(|line| clip(line, max)).collect()),
        }
    }

    /// Read one (possibly multiline) reply from a server
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Self, SmtpError> {
        let mut code = String::new();
        let mut texts = Vec::new();

        loop {
            let mut raw = String::new();
            if reader.read_line(&mut raw).map_err(SmtpError::from_io)? == 0 {
                return Err(SmtpError::ConnectionClosed);
            }
            let line = raw.trim_end_matches(['\r', '\n']);

            let valid_code = line.len() >= 3
                && line.is_char_boundary(3)
                && line[..3].bytes().all(|b| b.is_ascii_digit());
            if !valid_code {
                return Err(SmtpError::InvalidSyntax(format!("malformed reply {line:?}")));
            }

            code.clear();
            code.push_str(&line[..3]);
            let continued = line[3..].starts_with('-');
            texts.push(line.get(4..).unwrap_or_default().to_string());
            if !continued {
                break;
            }
        }

        let mut texts = texts.into_iter();
        let message = texts.next().unwrap_or_default();
        Ok(Self::new_multiline(&code, &message, texts.collect()))
    }

    /// Check if this is a success response (2xx)
    pub fn is_success(&self) -> bool {
        self.code.starts_with('2')
    }

    /// Check if this is an intermediate response (3xx)
    pub fn is_intermediate(&self) -> bool {
        self.code.starts_with('3')
    }
}

fn clip(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
