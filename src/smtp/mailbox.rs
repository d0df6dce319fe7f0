//! Durable per-recipient mailbox storage
//!
//! Every mailbox is a directory under the store root named after the
//! normalized recipient address. Each committed message is one JSON entry
//! file named after its id, written to a temporary file first and renamed
//! into place, so readers only ever see complete entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::smtp::error::SmtpError;
use crate::smtp::message::{Message, normalize_address};

const ENTRY_SUFFIX: &str = ".json";

/// Outcome of committing a message to one recipient's mailbox
#[derive(Debug)]
pub struct Delivery {
    pub recipient: String,
    pub result: Result<u64, SmtpError>,
}

impl Delivery {
    /// One-line description used in the END_DATA reply
    pub fn describe(&self) -> String {
        match &self.result {
            Ok(id) => format!("{} id={id}", self.recipient),
            Err(e) => format!("{} error: {e}", self.recipient),
        }
    }
}

/// Id assigned to a message in one recipient's mailbox, as reported to the
/// submitting client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub recipient: String,
    pub id: u64,
}

impl DeliveryReceipt {
    /// Parse a `recipient id=N` reply line
    pub fn parse(line: &str) -> Option<Self> {
        let (recipient, id) = line.trim().rsplit_once(" id=")?;
        Some(Self {
            recipient: recipient.to_string(),
            id: id.parse().ok()?,
        })
    }
}

/// Summary of a stored message, as shown in a mailbox listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageSummary {
    pub id: u64,
    pub sender: String,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub has_attachments: bool,
}

/// A committed message together with its store metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: u64,
    pub committed_at: DateTime<Utc>,
    pub message: Message,
}

/// On-disk entry format
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    id: u64,
    committed_at: DateTime<Utc>,
    recipient: String,
    sender: String,
    subject: String,
    has_attachments: bool,
    /// The message in its MIME encoding
    message: String,
}

#[derive(Debug, Default)]
struct MailboxState {
    /// Recovered from disk the first time the mailbox is written to
    next_id: Option<u64>,
}

/// Concurrency-safe store of committed messages, one mailbox per recipient.
///
/// Writes to one mailbox are serialized by a per-mailbox lock; reads take no
/// lock and see either the state before or after a write.
#[derive(Debug)]
pub struct MailboxStore {
    root: PathBuf,
    mailboxes: Mutex<HashMap<String, Arc<Mutex<MailboxState>>>>,
}

impl MailboxStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<Self, SmtpError> {
        let root = root.into();
        if !root.exists() {
            fs::create_dir_all(&root).map_err(store_error)?;
            info!(path = %root.display(), "created mailbox directory");
        }

        Ok(Self {
            root,
            mailboxes: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append `message` to the mailbox of every distinct recipient.
    ///
    /// Each recipient succeeds or fails on its own; a failure for one does
    /// not undo the writes to the others.
    pub fn commit(&self, message: &Message, recipients: &[String]) -> Vec<Delivery> {
        let data = message.encode();
        let mut seen = HashSet::new();

        recipients
            .iter()
            .map(|recipient| normalize_address(recipient))
            .filter(|address| seen.insert(address.clone()))
            .map(|address| {
                let result = self.commit_one(message, &data, &address);
                match &result {
                    Ok(id) => info!(recipient = %address, id, "message committed"),
                    Err(e) => warn!(recipient = %address, error = %e, "commit failed"),
                }
                Delivery {
                    recipient: address,
                    result,
                }
            })
            .collect()
    }

    fn commit_one(&self, message: &Message, data: &str, address: &str) -> Result<u64, SmtpError> {
        let lock = self.mailbox_lock(address);
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let dir = self.mailbox_dir(address);
        fs::create_dir_all(&dir).map_err(store_error)?;
        let id = match state.next_id {
            Some(id) => id,
            None => entry_ids(&dir)?.last().copied().unwrap_or(0) + 1,
        };

        let entry = StoredEntry {
            id,
            committed_at: Utc::now(),
            recipient: address.to_string(),
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            has_attachments: message.has_attachments(),
            message: data.to_string(),
        };
        let json = serde_json::to_vec_pretty(&entry).map_err(|e| SmtpError::Store(e.to_string()))?;

        let mut file = NamedTempFile::new_in(&dir).map_err(store_error)?;
        file.write_all(&json).map_err(store_error)?;
        file.as_file().sync_all().map_err(store_error)?;
        file.persist_noclobber(dir.join(entry_file_name(id)))
            .map_err(|e| store_error(e.error))?;

        state.next_id = Some(id + 1);
        debug!(path = %dir.display(), id, "entry written");
        Ok(id)
    }

    /// Summaries of every message in a mailbox, in delivery order. An
    /// unknown mailbox is empty.
    pub fn list(&self, recipient: &str) -> Result<Vec<MessageSummary>, SmtpError> {
        let dir = self.mailbox_dir(&normalize_address(recipient));
        let mut summaries = Vec::new();

        for id in entry_ids(&dir)? {
            match read_entry(&dir, id) {
                Ok(entry) => summaries.push(MessageSummary {
                    id: entry.id,
                    sender: entry.sender,
                    subject: entry.subject,
                    timestamp: entry.committed_at,
                    has_attachments: entry.has_attachments,
                }),
                Err(e) => warn!(path = %dir.display(), id, error = %e, "skipping unreadable entry"),
            }
        }

        Ok(summaries)
    }

    /// Read one complete message
    pub fn read(&self, recipient: &str, id: u64) -> Result<StoredMessage, SmtpError> {
        let address = normalize_address(recipient);
        let entry = read_entry(&self.mailbox_dir(&address), id).map_err(|e| match e {
            SmtpError::NotFound(_) => {
                SmtpError::NotFound(format!("no message {id} in mailbox {address}"))
            }
            other => other,
        })?;

        Ok(StoredMessage {
            id: entry.id,
            committed_at: entry.committed_at,
            message: Message::decode(entry.message.as_bytes())?,
        })
    }

    /// Addresses of every mailbox in the store, sorted
    pub fn mailboxes(&self) -> Result<Vec<String>, SmtpError> {
        let mut addresses = Vec::new();
        for dir_entry in fs::read_dir(&self.root).map_err(store_error)? {
            let dir_entry = dir_entry.map_err(store_error)?;
            if !dir_entry.path().is_dir() {
                continue;
            }
            if let Some(address) = decode_dir_name(&dir_entry.file_name().to_string_lossy()) {
                addresses.push(address);
            }
        }
        addresses.sort();
        Ok(addresses)
    }

    fn mailbox_lock(&self, address: &str) -> Arc<Mutex<MailboxState>> {
        let mut mailboxes = self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(mailboxes.entry(address.to_string()).or_default())
    }

    fn mailbox_dir(&self, address: &str) -> PathBuf {
        self.root.join(encode_dir_name(address))
    }
}

fn store_error(error: io::Error) -> SmtpError {
    SmtpError::Store(error.to_string())
}

fn entry_file_name(id: u64) -> String {
    format!("{id:010}{ENTRY_SUFFIX}")
}

/// Ids of the entries in a mailbox directory, ascending
fn entry_ids(dir: &Path) -> Result<Vec<u64>, SmtpError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(store_error(e)),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let name = entry.map_err(store_error)?.file_name();
        // Temporary files from in-flight writes don't carry the suffix
        if let Some(id) = name
            .to_str()
            .and_then(|name| name.strip_suffix(ENTRY_SUFFIX))
            .and_then(|stem| stem.parse::<u64>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn read_entry(dir: &Path, id: u64) -> Result<StoredEntry, SmtpError> {
    let path = dir.join(entry_file_name(id));
    let bytes = fs::read(&path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SmtpError::NotFound(path.display().to_string()),
        _ => store_error(e),
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| SmtpError::Store(format!("corrupt entry {}: {e}", path.display())))
}

/// Directory name for an address; bytes outside a safe set are
/// percent-escaped
fn encode_dir_name(address: &str) -> String {
    let mut name = String::with_capacity(address.len());
    for b in address.bytes() {
        if b.is_ascii_lowercase() || b.is_ascii_digit() || b"._+@-".contains(&b) {
            name.push(char::from(b));
        } else {
            name.push_str(&format!("%{b:02X}"));
        }
    }
    name
}

fn decode_dir_name(name: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(name.len());
    let mut iter = name.bytes();
    while let Some(b) = iter.next() {
        if b == b'%' {
            let hex = [iter.next()?, iter.next()?];
            let hex = std::str::from_utf8(&hex).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smtp::message::Attachment;
    use std::thread;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, MailboxStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MailboxStore::open(dir.path().join("mailboxes")).unwrap();
        (dir, store)
    }

    fn message(subject: &str) -> Message {
        Message::new(
            "alice@example.com",
            vec!["bob@example.com".to_string(), "carol@example.com".to_string()],
            subject,
            "Hello",
        )
    }

    fn ids(deliveries: &[Delivery]) -> Vec<u64> {
        deliveries
            .iter()
            .map(|delivery| *delivery.result.as_ref().unwrap())
            .collect()
    }

    #[test]
    fn test_commit_to_each_recipient() {
        let (_dir, store) = open_store();
        let message = message("Test");

        let deliveries = store.commit(&message, &message.recipients);
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].recipient, "bob@example.com");
        assert_eq!(deliveries[1].recipient, "carol@example.com");
        assert_eq!(ids(&deliveries), vec![1, 1]);

        for recipient in ["bob@example.com", "carol@example.com"] {
            let stored = store.read(recipient, 1).unwrap();
            assert_eq!(stored.message, message);
        }
    }

    #[test]
    fn test_ids_are_gapless_per_mailbox() {
        let (_dir, store) = open_store();
        let bob = vec!["bob@example.com".to_string()];

        let first = store.commit(&message("one"), &bob);
        let second = store.commit(&message("two"), &bob);
        let both = store.commit(&message("three"), &message("three").recipients);

        assert_eq!(ids(&first), vec![1]);
        assert_eq!(ids(&second), vec![2]);
        assert_eq!(ids(&both), vec![3, 1]);
    }

    #[test]
    fn test_duplicate_recipients_get_one_entry() {
        let (_dir, store) = open_store();
        let recipients = vec![
            "bob@example.com".to_string(),
            "Bob@Example.com".to_string(),
            "bob@example.com".to_string(),
        ];

        let deliveries = store.commit(&message("dup"), &recipients);
        assert_eq!(deliveries.len(), 1);
        assert_eq!(store.list("bob@example.com").unwrap().len(), 1);
    }

    #[test]
    fn test_list_summaries_in_order() {
        let (_dir, store) = open_store();
        let bob = vec!["bob@example.com".to_string()];
        store.commit(&message("first"), &bob);
        store.commit(
            &message("second").with_attachment(Attachment::new("a.txt", b"a".to_vec(), "text/plain")),
            &bob,
        );

        let summaries = store.list("BOB@example.com").unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, 1);
        assert_eq!(summaries[0].subject, "first");
        assert!(!summaries[0].has_attachments);
        assert_eq!(summaries[1].id, 2);
        assert_eq!(summaries[1].sender, "alice@example.com");
        assert!(summaries[1].has_attachments);
    }

    #[test]
    fn test_list_unknown_mailbox_is_empty() {
        let (_dir, store) = open_store();
        assert!(store.list("nobody@example.com").unwrap().is_empty());
    }

    #[test]
    fn test_read_unknown() {
        let (_dir, store) = open_store();
        store.commit(&message("x"), &["bob@example.com".to_string()]);

        assert!(matches!(
            store.read("nobody@example.com", 1),
            Err(SmtpError::NotFound(_))
        ));
        assert!(matches!(
            store.read("bob@example.com", 2),
            Err(SmtpError::NotFound(_))
        ));
    }

    #[test]
    fn test_ids_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let bob = vec!["bob@example.com".to_string()];

        let store = MailboxStore::open(dir.path()).unwrap();
        store.commit(&message("one"), &bob);
        store.commit(&message("two"), &bob);
        drop(store);

        let store = MailboxStore::open(dir.path()).unwrap();
        assert_eq!(ids(&store.commit(&message("three"), &bob)), vec![3]);
        assert_eq!(store.read("bob@example.com", 2).unwrap().message.subject, "two");
    }

    #[test]
    fn test_failure_is_reported_per_recipient() {
        let (_dir, store) = open_store();
        // A plain file where carol's mailbox directory belongs
        fs::write(store.root().join("carol@example.com"), b"in the way").unwrap();

        let deliveries = store.commit(&message("Test"), &message("Test").recipients);
        assert!(deliveries[0].result.is_ok());
        assert!(matches!(deliveries[1].result, Err(SmtpError::Store(_))));
        assert_eq!(store.list("bob@example.com").unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_commits_to_same_mailbox() {
        let (_dir, store) = open_store();
        let store = Arc::new(store);
        let bob = vec!["bob@example.com".to_string()];

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let bob = bob.clone();
                thread::spawn(move || {
                    let body = format!("{i}").repeat(2000);
                    let message = Message::new("alice@example.com", bob.clone(), format!("m{i}"), body);
                    for _ in 0..5 {
                        store.commit(&message, &bob);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let summaries = store.list("bob@example.com").unwrap();
        let ids: Vec<u64> = summaries.iter().map(|summary| summary.id).collect();
        assert_eq!(ids, (1..=40).collect::<Vec<_>>());

        for id in ids {
            let stored = store.read("bob@example.com", id).unwrap();
            let expected = stored.message.subject[1..].repeat(2000);
            assert_eq!(stored.message.body, expected);
        }
    }

    #[test]
    fn test_mailboxes() {
        let (_dir, store) = open_store();
        store.commit(&message("x"), &message("x").recipients);
        store.commit(&message("y"), &["o'neil@example.com".to_string()]);

        assert_eq!(
            store.mailboxes().unwrap(),
            vec!["bob@example.com", "carol@example.com", "o'neil@example.com"]
        );
    }

    #[test]
    fn test_corrupt_entry_is_skipped_in_list() {
        let (_dir, store) = open_store();
        let bob = vec!["bob@example.com".to_string()];
        store.commit(&message("good"), &bob);
        fs::write(
            store.mailbox_dir("bob@example.com").join(entry_file_name(2)),
            b"{not json",
        )
        .unwrap();

        let summaries = store.list("bob@example.com").unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(matches!(
            store.read("bob@example.com", 2),
            Err(SmtpError::Store(_))
        ));
    }

    #[test]
    fn test_dir_name_round_trip() {
        for address in ["bob@example.com", "o'neil/x@example.com", "名前@example.jp"] {
            let name = encode_dir_name(address);
            assert!(!name.contains('/'));
            assert_eq!(decode_dir_name(&name).as_deref(), Some(address));
        }
    }

    #[test]
    fn test_receipt_parse() {
        assert_eq!(
            DeliveryReceipt::parse("bob@example.com id=12"),
            Some(DeliveryReceipt {
                recipient: "bob@example.com".to_string(),
                id: 12
            })
        );
        assert_eq!(DeliveryReceipt::parse("bob@example.com error: nope"), None);
    }
}
