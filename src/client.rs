//! Submission client: drives a session from the client side

use std::io::{BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{Config, MessageLimits};
use crate::smtp::{DeliveryReceipt, Message, SmtpError, SmtpResponse};

/// Client that submits messages to an SMTP server
#[derive(Debug, Clone)]
pub struct SmtpClient {
    host: String,
    port: u16,
    timeout: Duration,
    limits: MessageLimits,
    client_domain: String,
}

impl SmtpClient {
    /// Create a client for `host:port` with default limits
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_secs(30),
            limits: MessageLimits::default(),
            client_domain: "localhost".to_string(),
        }
    }

    /// Create a client for the server described by `config`
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            timeout: config.server.timeout(),
            limits: config.limits.clone(),
            client_domain: "localhost".to_string(),
        }
    }

    /// Domain announced with HELO
    pub fn client_domain(mut self, domain: impl Into<String>) -> Self {
        self.client_domain = domain.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate and send a message, returning the id each recipient's
    /// mailbox assigned to it.
    ///
    /// Validation runs before any connection is opened. A non-success reply
    /// from the server is returned as [`SmtpError::Rejected`] carrying the
    /// server's code and text unchanged.
    pub fn submit(&self, message: &Message) -> Result<Vec<DeliveryReceipt>, SmtpError> {
        if message.recipients.is_empty() {
            return Err(SmtpError::BadSequence(
                "DATA requires at least one recipient".to_string(),
            ));
        }
        message.validate(&self.limits)?;

        let mut connection = Connection::open(&self.host, self.port, self.timeout)?;
        let result = connection.transaction(&self.client_domain, message);

        // QUIT is a courtesy; the server may already have closed an aborted
        // session.
        if let Err(e) = connection.command("QUIT") {
            debug!(error = %e, "QUIT failed");
        }

        let receipts = result?;
        info!(
            sender = %message.sender,
            recipients = receipts.len(),
            "message submitted"
        );
        Ok(receipts)
    }
}

struct Connection {
    writer: BufWriter<TcpStream>,
    reader: BufReader<TcpStream>,
}

impl Connection {
    fn open(host: &str, port: u16, timeout: Duration) -> Result<Self, SmtpError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SmtpError::Config(format!("cannot resolve {host}:{port}")))?;

        debug!(%addr, "connecting");
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(SmtpError::from_io)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let mut connection = Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        };
        connection.expect_reply("220")?;
        Ok(connection)
    }

    fn transaction(
        &mut self,
        client_domain: &str,
        message: &Message,
    ) -> Result<Vec<DeliveryReceipt>, SmtpError> {
        self.send(&format!("HELO {client_domain}"), "250")?;
        self.send(&format!("MAIL FROM:<{}>", message.sender), "250")?;
        for recipient in &message.recipients {
            self.send(&format!("RCPT TO:<{recipient}>"), "250")?;
        }
        let reply = self.command("DATA")?;
        if !reply.is_intermediate() {
            return Err(rejected(reply));
        }

        for line in message.encode().split("\r\n") {
            if line.starts_with('.') {
                self.writer.write_all(b".")?;
            }
            self.writer.write_all(line.as_bytes())?;
            self.writer.write_all(b"\r\n")?;
        }
        let reply = self.command(".")?;
        if !reply.is_success() {
            return Err(rejected(reply));
        }
        Ok(reply.receipts())
    }

    /// Send a command and require the given reply code
    fn send(&mut self, command: &str, code: &str) -> Result<SmtpResponse, SmtpError> {
        let reply = self.command(command)?;
        if reply.code != code {
            return Err(rejected(reply));
        }
        Ok(reply)
    }

    fn command(&mut self, command: &str) -> Result<SmtpResponse, SmtpError> {
        self.writer.write_all(command.as_bytes())?;
        self.writer.write_all(b"\r\n")?;
        self.writer.flush().map_err(SmtpError::from_io)?;
        SmtpResponse::read_from(&mut self.reader)
    }

    fn expect_reply(&mut self, code: &str) -> Result<SmtpResponse, SmtpError> {
        let reply = SmtpResponse::read_from(&mut self.reader)?;
        if reply.code != code {
            return Err(rejected(reply));
        }
        Ok(reply)
    }
}

fn rejected(reply: SmtpResponse) -> SmtpError {
    SmtpError::Rejected {
        message: reply.text(),
        code: reply.code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Accept one connection and answer each command line with the next
    /// scripted reply
    fn scripted_server(replies: &'static [&'static str]) -> (u16, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            stream.write_all(b"220 scripted ready\r\n").unwrap();

            let mut received = Vec::new();
            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    break;
                }
                received.push(line.trim_end().to_string());
                stream.write_all(reply.as_bytes()).unwrap();
                stream.write_all(b"\r\n").unwrap();
            }
            received
        });
        (port, server)
    }

    #[test]
    fn test_zero_recipients_fail_before_connecting() {
        // Nothing listens on this port
        let client = SmtpClient::new("127.0.0.1", 9);
        let message = Message::new("alice@example.com", Vec::new(), "Test", "Hello");
        assert!(matches!(
            client.submit(&message),
            Err(SmtpError::BadSequence(_))
        ));
    }

    #[test]
    fn test_validation_fails_before_connecting() {
        let mut client = SmtpClient::new("127.0.0.1", 9);
        client.limits.max_recipients = 1;
        let message = Message::new(
            "alice@example.com",
            vec!["bob@example.com".to_string(), "carol@example.com".to_string()],
            "Test",
            "Hello",
        );
        assert!(matches!(
            client.submit(&message),
            Err(SmtpError::LimitExceeded(_))
        ));

        let message = Message::new("alice", vec!["bob@example.com".to_string()], "Test", "Hello");
        assert!(matches!(
            client.submit(&message),
            Err(SmtpError::Validation { field: "sender", .. })
        ));
    }

    #[test]
    fn test_rejected_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"554 No service\r\n").unwrap();
        });

        let client = SmtpClient::new("127.0.0.1", port).timeout(Duration::from_secs(5));
        let message = Message::new(
            "alice@example.com",
            vec!["bob@example.com".to_string()],
            "Test",
            "Hello",
        );
        match client.submit(&message) {
            Err(SmtpError::Rejected { code, message }) => {
                assert_eq!(code, "554");
                assert_eq!(message, "No service");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn test_data_must_get_an_intermediate_reply() {
        let (port, server) = scripted_server(&[
            "250 hello",
            "250 OK",
            "250 OK",
            "250 DATA would be accepted",
            "221 Bye",
        ]);

        let client = SmtpClient::new("127.0.0.1", port).timeout(Duration::from_secs(5));
        let message = Message::new(
            "alice@example.com",
            vec!["bob@example.com".to_string()],
            "Test",
            "Hello",
        );
        match client.submit(&message) {
            Err(SmtpError::Rejected { code, message }) => {
                assert_eq!(code, "250");
                assert_eq!(message, "DATA would be accepted");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let received = server.join().unwrap();
        assert_eq!(received[3], "DATA");
        assert_eq!(received[4], "QUIT");
    }
}
