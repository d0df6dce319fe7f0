//! Message model and its MIME encoding

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Datelike, SubsecRound, Timelike, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use std::fs;
use std::path::Path;

use crate::config::MessageLimits;
use crate::smtp::encoding::{
    decode_charset, decode_header_text, encode_words, needs_encoded_words, qp_decode,
    rfc2231_decode,
};
use crate::smtp::error::{SmtpError, SmtpLimits};

/// Column at which base64 content and the `To` header are wrapped
const BASE64_LINE_LENGTH: usize = 76;
const HEADER_FOLD_COLUMN: usize = 78;

/// Longest text line that may be sent verbatim (1000 minus CRLF and a
/// possible dot-stuffing prefix)
const MAX_VERBATIM_LINE: usize = SmtpLimits::TEXT_LINE_MAX_LENGTH - 3;

const MAX_FILENAME_LENGTH: usize = 255;
const BOUNDARY_TOKEN_LENGTH: usize = 24;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const DEFAULT_CHARSET: &str = "utf-8";

/// Years an RFC 2822 `Date` header can carry
const DATE_YEARS: std::ops::RangeInclusive<i32> = 1900..=9999;

type Headers = Vec<(String, String)>;

/// A file attached to a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
    pub content_type: String,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, content: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content,
            content_type: content_type.into(),
        }
    }

    /// Read an attachment from disk, guessing its content type from the
    /// file extension
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, SmtpError> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| SmtpError::Validation {
                field: "attachments",
                reason: format!("{} has no file name", path.display()),
            })?;
        let content = fs::read(path)?;
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Ok(Self::new(filename, content, content_type))
    }

    /// Size of the attachment content in bytes
    pub fn size(&self) -> usize {
        self.content.len()
    }
}

/// An email message: envelope, headers, body and attachments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The sender's email address
    pub sender: String,

    /// Recipient addresses, in the order they were given
    pub recipients: Vec<String>,

    pub subject: String,

    pub body: String,

    pub attachments: Vec<Attachment>,

    /// When the message was finalized, in whole seconds
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message without attachments, timestamped now
    pub fn new(
        sender: impl Into<String>,
        recipients: Vec<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipients,
            subject: subject.into(),
            body: body.into(),
            attachments: Vec::new(),
            timestamp: now(),
        }
    }

    /// Add an attachment
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Check addresses, field lengths and attachment limits.
    ///
    /// Fields are checked in a fixed order (sender, recipients, subject,
    /// body, attachments, timestamp) and the first violation is returned.
    /// The timestamp must fit the `Date` header exactly: whole seconds
    /// within years 1900 to 9999.
    pub fn validate(&self, limits: &MessageLimits) -> Result<(), SmtpError> {
        check_address(&self.sender).map_err(|reason| SmtpError::Validation {
            field: "sender",
            reason,
        })?;

        if self.recipients.is_empty() {
            return Err(SmtpError::Validation {
                field: "recipients",
                reason: "at least one recipient is required".to_string(),
            });
        }
        if self.recipients.len() > limits.max_recipients {
            return Err(SmtpError::LimitExceeded(format!(
                "too many recipients ({}, max {})",
                self.recipients.len(),
                limits.max_recipients
            )));
        }
        for recipient in &self.recipients {
            check_address(recipient).map_err(|reason| SmtpError::Validation {
                field: "recipients",
                reason: format!("{recipient}: {reason}"),
            })?;
        }

        let subject_length = self.subject.chars().count();
        if subject_length > limits.max_subject_length {
            return Err(SmtpError::Validation {
                field: "subject",
                reason: format!(
                    "{subject_length} characters exceeds the maximum of {}",
                    limits.max_subject_length
                ),
            });
        }
        if self.subject.contains(['\r', '\n']) {
            return Err(SmtpError::Validation {
                field: "subject",
                reason: "must not contain line breaks".to_string(),
            });
        }

        let body_length = self.body.chars().count();
        if body_length > limits.max_body_length {
            return Err(SmtpError::Validation {
                field: "body",
                reason: format!(
                    "{body_length} characters exceeds the maximum of {}",
                    limits.max_body_length
                ),
            });
        }

        if self.attachments.len() > limits.max_attachments {
            return Err(SmtpError::Validation {
                field: "attachments",
                reason: format!(
                    "{} attachments exceeds the maximum of {}",
                    self.attachments.len(),
                    limits.max_attachments
                ),
            });
        }
        for attachment in &self.attachments {
            check_attachment(attachment, limits).map_err(|reason| SmtpError::Validation {
                field: "attachments",
                reason: format!("{}: {reason}", attachment.filename),
            })?;
        }

        if self.timestamp.nanosecond() != 0 {
            return Err(SmtpError::Validation {
                field: "timestamp",
                reason: "must be in whole seconds".to_string(),
            });
        }
        if !DATE_YEARS.contains(&self.timestamp.year()) {
            return Err(SmtpError::Validation {
                field: "timestamp",
                reason: format!("year {} is outside 1900-9999", self.timestamp.year()),
            });
        }

        Ok(())
    }

    /// Encode the message as CRLF-delimited MIME text
    pub fn encode(&self) -> String {
        let mut out = String::new();
        push_header(&mut out, "From", &self.sender);
        push_address_list(&mut out, "To", &self.recipients);
        if needs_encoded_words(&self.subject) {
            push_header(&mut out, "Subject", &encode_words(&self.subject).join("\r\n "));
        } else {
            push_header(&mut out, "Subject", &self.subject);
        }
        push_header(&mut out, "Date", &self.timestamp.to_rfc2822());
        push_header(&mut out, "MIME-Version", "1.0");

        let (body_encoding, body_text) = encode_body(&self.body);

        if self.attachments.is_empty() {
            push_header(&mut out, "Content-Type", "text/plain; charset=utf-8");
            push_header(&mut out, "Content-Transfer-Encoding", body_encoding);
            out.push_str("\r\n");
            out.push_str(&body_text);
            return out;
        }

        let boundary = self.boundary(&body_text);
        push_header(
            &mut out,
            "Content-Type",
            &format!("multipart/mixed; boundary=\"{boundary}\""),
        );
        out.push_str("\r\n");

        out.push_str(&format!("--{boundary}\r\n"));
        push_header(&mut out, "Content-Type", "text/plain; charset=utf-8");
        push_header(&mut out, "Content-Transfer-Encoding", body_encoding);
        out.push_str("\r\n");
        out.push_str(&body_text);
        out.push_str("\r\n");

        for attachment in &self.attachments {
            out.push_str(&format!("--{boundary}\r\n"));
            push_header(&mut out, "Content-Type", &attachment.content_type);
            push_header(
                &mut out,
                "Content-Disposition",
                &format!("attachment; filename=\"{}\"", attachment.filename),
            );
            push_header(&mut out, "Content-Transfer-Encoding", "base64");
            out.push_str("\r\n");
            out.push_str(&wrap_base64(&attachment.content));
            out.push_str("\r\n");
        }

        out.push_str(&format!("--{boundary}--\r\n"));
        out
    }

    /// Decode a message produced by [`Message::encode`] or by another MIME
    /// writer.
    ///
    /// RFC 2047 encoded words in the subject, `base64` and
    /// `quoted-printable` content, declared charsets and RFC 2231 file names
    /// are all decoded. Input that is not UTF-8, or content that is invalid
    /// in its charset, is rejected rather than repaired.
    pub fn decode(data: &[u8]) -> Result<Self, SmtpError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| SmtpError::MalformedMessage("message is not valid UTF-8".to_string()))?;

        let (header_block, rest) = split_header_block(text).ok_or_else(|| {
            SmtpError::MalformedMessage("unterminated header block".to_string())
        })?;
        let headers = parse_headers(header_block)?;

        let sender = header(&headers, "From")
            .map(extract_address)
            .ok_or_else(|| SmtpError::MalformedMessage("missing From header".to_string()))?;
        let recipients = header(&headers, "To")
            .map(|value| {
                value
                    .split(',')
                    .map(extract_address)
                    .filter(|addr| !addr.is_empty())
                    .collect::<Vec<_>>()
            })
            .ok_or_else(|| SmtpError::MalformedMessage("missing To header".to_string()))?;
        let subject = header(&headers, "Subject")
            .map(decode_header_text)
            .unwrap_or_default();
        let timestamp = header(&headers, "Date")
            .and_then(|date| DateTime::parse_from_rfc2822(date.trim()).ok())
            .map(|date| date.with_timezone(&Utc))
            .unwrap_or_else(now);

        let content_type = header(&headers, "Content-Type").unwrap_or("text/plain");
        let (body, attachments) = if media_type(content_type)
            .to_ascii_lowercase()
            .starts_with("multipart/")
        {
            let boundary = header_param(content_type, "boundary").ok_or_else(|| {
                SmtpError::MalformedMessage("multipart message without boundary".to_string())
            })?;
            decode_multipart(rest, &boundary)?
        } else {
            let body = decode_text(
                rest,
                header(&headers, "Content-Transfer-Encoding"),
                Some(content_type),
            )?;
            (body, Vec::new())
        };

        Ok(Self {
            sender,
            recipients,
            subject,
            body,
            attachments,
            timestamp,
        })
    }

    /// Pick a random boundary that does not occur in any literal content
    fn boundary(&self, body_text: &str) -> String {
        loop {
            let token: String = rand::rng()
                .sample_iter(&Alphanumeric)
                .take(BOUNDARY_TOKEN_LENGTH)
                .map(char::from)
                .collect();
            let boundary = format!("=_smtplab_{token}");

            let collides = body_text.contains(&boundary)
                || self.subject.contains(&boundary)
                || self.attachments.iter().any(|attachment| {
                    attachment.filename.contains(&boundary)
                        || attachment.content_type.contains(&boundary)
                });
            if !collides {
                return boundary;
            }
        }
    }
}

/// Current time truncated to whole seconds, the precision of the `Date` header
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Case-normalized form of an address, used as the mailbox key
pub fn normalize_address(addr: &str) -> String {
    addr.trim().to_lowercase()
}

/// Check that an address has the `local@domain` shape.
///
/// Returns the reason on failure so callers can wrap it in the error kind
/// that fits their context.
pub fn check_address(addr: &str) -> Result<(), String> {
    if addr.is_empty() {
        return Err("address cannot be empty".to_string());
    }
    if addr.len() > SmtpLimits::PATH_MAX_LENGTH {
        return Err(format!(
            "address too long (max {} characters)",
            SmtpLimits::PATH_MAX_LENGTH
        ));
    }
    if let Some(c) = addr.chars().find(|c| {
        c.is_whitespace() || c.is_control() || matches!(c, '<' | '>' | ',' | '"' | ';' | '\\')
    }) {
        return Err(format!("address contains invalid character {c:?}"));
    }

    let (user, domain) = addr
        .split_once('@')
        .ok_or_else(|| "address must contain @ symbol".to_string())?;
    if user.is_empty() || domain.is_empty() {
        return Err("address must have the form local@domain".to_string());
    }
    if domain.contains('@') {
        return Err("address must contain exactly one @ symbol".to_string());
    }
    if user.len() > SmtpLimits::USER_MAX_LENGTH {
        return Err(format!(
            "user name too long (max {} characters)",
            SmtpLimits::USER_MAX_LENGTH
        ));
    }
    if domain.len() > SmtpLimits::DOMAIN_MAX_LENGTH {
        return Err(format!(
            "domain name too long (max {} characters)",
            SmtpLimits::DOMAIN_MAX_LENGTH
        ));
    }
    if !domain.contains('.') || domain.split('.').any(str::is_empty) {
        return Err(format!("domain {domain} is not a dotted domain name"));
    }

    Ok(())
}

fn check_attachment(attachment: &Attachment, limits: &MessageLimits) -> Result<(), String> {
    let filename = &attachment.filename;
    if filename.is_empty() {
        return Err("file name cannot be empty".to_string());
    }
    if filename.len() > MAX_FILENAME_LENGTH {
        return Err(format!(
            "file name too long (max {MAX_FILENAME_LENGTH} bytes)"
        ));
    }
    if filename.contains(['"', ';', '\\', '\r', '\n']) {
        return Err("file name contains quotes, semicolons or line breaks".to_string());
    }

    let valid_token = |token: &str| {
        !token.is_empty()
            && token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "!#$&-^_.+".contains(c))
    };
    match attachment.content_type.split_once('/') {
        Some((kind, subtype)) if valid_token(kind) && valid_token(subtype) => {}
        _ => {
            return Err(format!(
                "content type {:?} is not of the form type/subtype",
                attachment.content_type
            ));
        }
    }

    if attachment.size() as u64 > limits.max_file_size_bytes() {
        return Err(format!(
            "{} bytes exceeds the {} MB limit",
            attachment.size(),
            limits.max_file_size_mb
        ));
    }

    Ok(())
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

/// Write a comma-separated address header, folded before it passes the
/// fold column
fn push_address_list(out: &mut String, name: &str, addresses: &[String]) {
    out.push_str(name);
    out.push(':');
    let mut column = name.len() + 1;

    for (i, addr) in addresses.iter().enumerate() {
        if i > 0 {
            out.push(',');
            column += 1;
            if column + 1 + addr.len() > HEADER_FOLD_COLUMN {
                out.push_str("\r\n");
                column = 0;
            }
        }
        out.push(' ');
        out.push_str(addr);
        column += 1 + addr.len();
    }

    out.push_str("\r\n");
}

/// Returns the transfer encoding and the encoded body text
fn encode_body(body: &str) -> (&'static str, String) {
    let verbatim = !body.contains('\r')
        && body.split('\n').all(|line| line.len() <= MAX_VERBATIM_LINE);
    if verbatim {
        ("8bit", body.replace('\n', "\r\n"))
    } else {
        ("base64", wrap_base64(body.as_bytes()))
    }
}

fn wrap_base64(content: &[u8]) -> String {
    let encoded = STANDARD.encode(content);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE_LENGTH * 2);
    for (i, c) in encoded.chars().enumerate() {
        if i > 0 && i % BASE64_LINE_LENGTH == 0 {
            out.push_str("\r\n");
        }
        out.push(c);
    }
    out
}

fn decode_base64(text: &str) -> Result<Vec<u8>, SmtpError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| SmtpError::MalformedMessage(format!("invalid base64 content: {e}")))
}

fn transfer_encoding_name(transfer_encoding: Option<&str>) -> Option<String> {
    transfer_encoding.map(|cte| cte.trim().to_ascii_lowercase())
}

/// Decode a text part. Line breaks come back as `\n` except in `base64`
/// content, which carries its line endings verbatim.
fn decode_text(
    content: &str,
    transfer_encoding: Option<&str>,
    content_type: Option<&str>,
) -> Result<String, SmtpError> {
    let charset = content_type
        .and_then(|ct| header_param(ct, "charset"))
        .unwrap_or_else(|| DEFAULT_CHARSET.to_string());
    let in_charset = |bytes: &[u8]| {
        decode_charset(&charset, bytes).ok_or_else(|| {
            SmtpError::MalformedMessage(format!("body is not valid {charset}"))
        })
    };

    match transfer_encoding_name(transfer_encoding).as_deref() {
        Some("base64") => in_charset(&decode_base64(content)?),
        Some("quoted-printable") => {
            Ok(in_charset(&qp_decode(content.as_bytes()))?.replace("\r\n", "\n"))
        }
        _ => Ok(content.replace("\r\n", "\n")),
    }
}

fn split_header_block(text: &str) -> Option<(&str, &str)> {
    if let Some(rest) = text.strip_prefix("\r\n") {
        return Some(("", rest));
    }
    text.find("\r\n\r\n")
        .map(|end| (&text[..end], &text[end + 4..]))
}

/// Parse a header block, unfolding continuation lines
fn parse_headers(block: &str) -> Result<Headers, SmtpError> {
    let mut headers: Headers = Vec::new();
    if block.is_empty() {
        return Ok(headers);
    }

    for line in block.split("\r\n") {
        if line.starts_with([' ', '\t']) {
            let (_, value) = headers.last_mut().ok_or_else(|| {
                SmtpError::MalformedMessage("continuation line without a header".to_string())
            })?;
            value.push_str(line);
            continue;
        }

        let (name, value) = line.split_once(':').ok_or_else(|| {
            SmtpError::MalformedMessage(format!("invalid header line {line:?}"))
        })?;
        let value = value.strip_prefix(' ').unwrap_or(value);
        headers.push((name.trim().to_string(), value.to_string()));
    }

    Ok(headers)
}

fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// `type/subtype` part of a Content-Type value
fn media_type(value: &str) -> &str {
    value.split(';').next().unwrap_or_default().trim()
}

/// A parameter value, preferring the RFC 2231 `name*` form when present
fn param_value(value: &str, name: &str) -> Option<String> {
    header_param(value, &format!("{name}*"))
        .and_then(|extended| rfc2231_decode(&extended))
        .or_else(|| header_param(value, name))
}

fn header_param(value: &str, name: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (key, val) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case(name) {
            return None;
        }
        let val = val.trim();
        let val = val
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(val);
        Some(val.to_string())
    })
}

/// Strip an optional display name: `Alice <alice@example.com>`
fn extract_address(value: &str) -> String {
    let value = value.trim();
    match (value.rfind('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].trim().to_string(),
        _ => value.to_string(),
    }
}

fn decode_multipart(section: &str, boundary: &str) -> Result<(String, Vec<Attachment>), SmtpError> {
    let delimiter = format!("--{boundary}");
    let close = format!("--{boundary}--");

    let mut parts: Vec<Vec<&str>> = Vec::new();
    let mut closed = false;
    for line in section.split("\r\n") {
        let marker = line.trim_end();
        if marker == close {
            closed = true;
            break;
        }
        if marker == delimiter {
            parts.push(Vec::new());
            continue;
        }
        // Lines before the first delimiter are preamble
        if let Some(part) = parts.last_mut() {
            part.push(line);
        }
    }
    if !closed {
        return Err(SmtpError::MalformedMessage(format!(
            "boundary {boundary:?} is never closed"
        )));
    }

    let mut body = None;
    let mut attachments = Vec::new();
    for lines in parts {
        let blank = lines.iter().position(|line| line.is_empty()).ok_or_else(|| {
            SmtpError::MalformedMessage("unterminated part header block".to_string())
        })?;
        let headers = parse_headers(&lines[..blank].join("\r\n"))?;
        let content = lines[blank + 1..].join("\r\n");
        let transfer_encoding = header(&headers, "Content-Transfer-Encoding");
        let content_type = header(&headers, "Content-Type");

        let filename = header(&headers, "Content-Disposition")
            .and_then(|disposition| param_value(disposition, "filename"))
            .or_else(|| content_type.and_then(|ct| param_value(ct, "name")))
            .filter(|name| !name.is_empty());

        match filename {
            None if body.is_none() => {
                body = Some(decode_text(&content, transfer_encoding, content_type)?);
            }
            None => {
                return Err(SmtpError::MalformedMessage(
                    "attachment part lacks a filename".to_string(),
                ));
            }
            Some(filename) => {
                let data = match transfer_encoding_name(transfer_encoding).as_deref() {
                    Some("base64") => decode_base64(&content)?,
                    Some("quoted-printable") => qp_decode(content.as_bytes()),
                    _ => content.into_bytes(),
                };
                let content_type = content_type
                    .map(media_type)
                    .filter(|ct| !ct.is_empty())
                    .unwrap_or(DEFAULT_CONTENT_TYPE);
                attachments.push(Attachment::new(filename, data, content_type));
            }
        }
    }

    Ok((body.unwrap_or_default(), attachments))
}
