//! Integration tests: protocol limits, submission scenarios and mailbox
//! persistence over real TCP connections

use smtplab::{
    Attachment, Config, Message, ServerHandle, SmtpError, SmtpLimits, SmtpResponse, list_mailbox,
    mailboxes, read_message, start_server, stop_server, submit,
};
use std::io::{BufReader, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

struct TestServer {
    _dir: TempDir,
    config: Config,
    handle: ServerHandle,
}

impl TestServer {
    fn start() -> Self {
        Self::start_with(|_| {})
    }

    fn start_with(configure: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.hostname = "test.local".to_string();
        config.server.port = 0;
        config.storage.path = dir.path().to_path_buf();
        configure(&mut config);

        let handle = start_server(&config).unwrap();
        config.server.port = handle.local_addr().port();

        Self {
            _dir: dir,
            config,
            handle,
        }
    }

    fn connect(&self) -> RawClient {
        RawClient::connect(&self.config.server.addr())
    }

    fn stop(self) {
        stop_server(self.handle);
    }
}

struct RawClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl RawClient {
    fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let greeting = SmtpResponse::read_from(&mut reader).unwrap();
        assert!(greeting.message.starts_with("test.local"));
        Self { stream, reader }
    }

    fn send_line(&mut self, line: &str) {
        write!(self.stream, "{line}\r\n").unwrap();
        self.stream.flush().unwrap();
    }

    fn send_command(&mut self, command: &str) -> SmtpResponse {
        self.send_line(command);
        SmtpResponse::read_from(&mut self.reader).unwrap()
    }
}

fn recipients(addresses: &[&str]) -> Vec<String> {
    addresses.iter().map(|a| a.to_string()).collect()
}

#[test]
fn test_command_line_length_limit() {
    let server = TestServer::start();
    let mut client = server.connect();

    let long_command = "HELO ".to_string() + &"a".repeat(SmtpLimits::COMMAND_LINE_MAX_LENGTH);
    let response = client.send_command(&long_command);
    assert_eq!(response.code, "500"); // Line too long

    // The session is still usable
    assert_eq!(client.send_command("HELO client.local").code, "250");
    client.send_command("QUIT");
    server.stop();
}

#[test]
fn test_domain_name_length_limit() {
    let server = TestServer::start();
    let mut client = server.connect();

    let long_domain = "a".repeat(SmtpLimits::DOMAIN_MAX_LENGTH + 1);
    let response = client.send_command(&format!("HELO {long_domain}"));
    assert_eq!(response.code, "501");

    client.send_command("QUIT");
    server.stop();
}

#[test]
fn test_address_component_limits() {
    let server = TestServer::start();
    let mut client = server.connect();

    let long_user = "a".repeat(SmtpLimits::USER_MAX_LENGTH + 1);
    let response = client.send_command(&format!("MAIL FROM:<{long_user}@example.com>"));
    assert_eq!(response.code, "553");
    assert!(response.message.starts_with("InvalidAddressError"));

    let long_domain = "b".repeat(SmtpLimits::DOMAIN_MAX_LENGTH) + ".com";
    let response = client.send_command(&format!("MAIL FROM:<user@{long_domain}>"));
    assert_eq!(response.code, "553");

    // Still in the greeting state, a valid sender is accepted
    assert_eq!(
        client.send_command("MAIL FROM:<user@example.com>").code,
        "250"
    );
    client.send_command("QUIT");
    server.stop();
}

#[test]
fn test_alice_sends_to_bob_and_carol() {
    let server = TestServer::start();

    let message = Message::new(
        "alice@example.com",
        recipients(&["bob@example.com", "carol@example.com"]),
        "Test",
        "Hello",
    );
    let receipts = submit(&server.config, &message).unwrap();
    assert_eq!(receipts.len(), 2);
    assert_eq!(receipts[0].recipient, "bob@example.com");
    assert_eq!(receipts[1].recipient, "carol@example.com");

    for receipt in &receipts {
        let summaries = list_mailbox(&server.config, &receipt.recipient).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, receipt.id);

        let stored = read_message(&server.config, &receipt.recipient, receipt.id).unwrap();
        assert_eq!(stored.message.sender, "alice@example.com");
        assert_eq!(stored.message.subject, "Test");
        assert_eq!(stored.message.body, "Hello");
        assert_eq!(stored.message.recipients, message.recipients);
    }
    server.stop();
}

#[test]
fn test_too_many_recipients_touches_no_mailbox() {
    let server = TestServer::start();

    let addresses: Vec<String> = (0..51).map(|i| format!("user{i}@example.com")).collect();
    let message = Message::new("alice@example.com", addresses, "Test", "Hello");

    let result = submit(&server.config, &message);
    assert!(matches!(result, Err(SmtpError::LimitExceeded(_))));
    assert!(mailboxes(&server.config).unwrap().is_empty());
    server.stop();
}

#[test]
fn test_recipient_limit_on_the_wire() {
    let server = TestServer::start_with(|config| config.limits.max_recipients = 3);
    let mut client = server.connect();

    client.send_command("MAIL FROM:<alice@example.com>");
    for i in 0..3 {
        let response = client.send_command(&format!("RCPT TO:<user{i}@example.com>"));
        assert_eq!(response.code, "250");
    }
    let response = client.send_command("RCPT TO:<extra@example.com>");
    assert_eq!(response.code, "552");
    assert!(response.message.starts_with("LimitExceededError"));

    // The accepted recipients remain and DATA is allowed
    assert_eq!(client.send_command("DATA").code, "354");
    server.stop();
}

#[test]
fn test_zero_recipients() {
    let server = TestServer::start();

    let message = Message::new("alice@example.com", Vec::new(), "Test", "Hello");
    assert!(matches!(
        submit(&server.config, &message),
        Err(SmtpError::BadSequence(_))
    ));

    let mut client = server.connect();
    client.send_command("MAIL FROM:<alice@example.com>");
    let response = client.send_command("DATA");
    assert_eq!(response.code, "503");
    assert!(response.message.starts_with("BadSequenceError"));

    // The session stays alive
    assert_eq!(client.send_command("NOOP").code, "250");
    server.stop();
}

#[test]
fn test_oversized_attachment_is_rejected() {
    let server = TestServer::start_with(|config| config.limits.max_file_size_mb = 1);

    let message = Message::new(
        "alice@example.com",
        recipients(&["bob@example.com"]),
        "Big",
        "see attachment",
    )
    .with_attachment(Attachment::new(
        "big.bin",
        vec![0; 1024 * 1024 + 1],
        "application/octet-stream",
    ));

    let result = submit(&server.config, &message);
    assert!(matches!(
        result,
        Err(SmtpError::Validation {
            field: "attachments",
            ..
        })
    ));
    assert!(list_mailbox(&server.config, "bob@example.com")
        .unwrap()
        .is_empty());
    server.stop();
}

#[test]
fn test_closing_mid_data_commits_nothing() {
    let server = TestServer::start();

    {
        let mut client = server.connect();
        client.send_command("MAIL FROM:<alice@example.com>");
        client.send_command("RCPT TO:<bob@example.com>");
        client.send_command("RCPT TO:<carol@example.com>");
        assert_eq!(client.send_command("DATA").code, "354");
        client.send_line("From: alice@example.com");
        client.send_line("To: bob@example.com, carol@example.com");
        client.send_line("Subject: cut short");
        client.send_line("");
        client.send_line("Hello");
        // Dropped without the end-of-data marker
    }

    // A later submission still works
    let message = Message::new(
        "alice@example.com",
        recipients(&["dave@example.com"]),
        "After",
        "Still running",
    );
    submit(&server.config, &message).unwrap();

    assert!(list_mailbox(&server.config, "bob@example.com")
        .unwrap()
        .is_empty());
    assert!(list_mailbox(&server.config, "carol@example.com")
        .unwrap()
        .is_empty());
    assert_eq!(mailboxes(&server.config).unwrap(), vec!["dave@example.com"]);
    server.stop();
}

#[test]
fn test_concurrent_submissions_to_one_mailbox() {
    let server = TestServer::start();

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let config = server.config.clone();
            thread::spawn(move || {
                let message = Message::new(
                    format!("sender{i}@example.com"),
                    recipients(&["shared@example.com"]),
                    format!("message {i}"),
                    format!("{i}").repeat(3000),
                );
                submit(&config, &message).unwrap()
            })
        })
        .collect();

    let mut ids: Vec<u64> = workers
        .into_iter()
        .flat_map(|worker| worker.join().unwrap())
        .map(|receipt| receipt.id)
        .collect();
    ids.sort();
    assert_eq!(ids, (1..=8).collect::<Vec<u64>>());

    for summary in list_mailbox(&server.config, "shared@example.com").unwrap() {
        let stored = read_message(&server.config, "shared@example.com", summary.id).unwrap();
        let i = stored.message.subject.trim_start_matches("message ");
        assert_eq!(stored.message.body, i.repeat(3000));
        assert_eq!(stored.message.sender, format!("sender{i}@example.com"));
    }
    server.stop();
}

#[test]
fn test_attachments_survive_delivery() {
    let server = TestServer::start();

    let binary: Vec<u8> = (0..=255).cycle().take(5000).collect();
    let message = Message::new(
        "alice@example.com",
        recipients(&["bob@example.com"]),
        "Report ✓",
        "Line one\n.line starting with a dot\n\nÜnïcödé body",
    )
    .with_attachment(Attachment::new("data.bin", binary, "application/octet-stream"))
    .with_attachment(Attachment::new(
        "notes.txt",
        b"plain notes\r\n".to_vec(),
        "text/plain",
    ));

    let receipts = submit(&server.config, &message).unwrap();
    let stored = read_message(&server.config, "bob@example.com", receipts[0].id).unwrap();

    assert_eq!(stored.message.subject, message.subject);
    assert_eq!(stored.message.body, message.body);
    assert_eq!(stored.message.attachments, message.attachments);

    let summaries = list_mailbox(&server.config, "bob@example.com").unwrap();
    assert!(summaries[0].has_attachments);
    server.stop();
}

#[test]
fn test_duplicate_recipients_get_one_entry() {
    let server = TestServer::start();

    let message = Message::new(
        "alice@example.com",
        recipients(&["bob@example.com", "Bob@Example.com"]),
        "Twice",
        "Once is enough",
    );
    let receipts = submit(&server.config, &message).unwrap();
    assert_eq!(receipts.len(), 1);
    assert_eq!(
        list_mailbox(&server.config, "bob@example.com")
            .unwrap()
            .len(),
        1
    );
    server.stop();
}

#[test]
fn test_ids_continue_after_restart() {
    let server = TestServer::start();
    let message = Message::new(
        "alice@example.com",
        recipients(&["bob@example.com"]),
        "First",
        "1",
    );
    submit(&server.config, &message).unwrap();

    let TestServer {
        _dir: dir,
        mut config,
        handle,
    } = server;
    stop_server(handle);

    config.server.port = 0;
    let handle = start_server(&config).unwrap();
    config.server.port = handle.local_addr().port();

    let receipts = submit(&config, &message).unwrap();
    assert_eq!(receipts[0].id, 2);
    stop_server(handle);
    drop(dir);
}

#[test]
fn test_read_unknown_message() {
    let server = TestServer::start();

    assert!(matches!(
        read_message(&server.config, "nobody@example.com", 1),
        Err(SmtpError::NotFound(_))
    ));
    assert!(list_mailbox(&server.config, "nobody@example.com")
        .unwrap()
        .is_empty());
    server.stop();
}

#[test]
fn test_failed_session_does_not_affect_others() {
    let server = TestServer::start();

    let mut idle = server.connect();
    idle.send_command("MAIL FROM:<alice@example.com>");

    let mut broken = server.connect();
    broken.send_command("MAIL FROM:<alice@example.com>");
    broken.send_command("RCPT TO:<bob@example.com>");
    broken.send_command("DATA");
    broken.send_line("garbage without headers");
    assert_eq!(broken.send_command(".").code, "554");

    // The other session keeps its transaction
    assert_eq!(idle.send_command("RCPT TO:<carol@example.com>").code, "250");
    assert_eq!(idle.send_command("QUIT").code, "221");
    server.stop();
}
