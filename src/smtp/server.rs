//! SMTP server implementation

use crate::config::Config;
use crate::smtp::commands::SmtpCommandHandler;
use crate::smtp::error::SmtpError;
use crate::smtp::mailbox::MailboxStore;
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::SmtpSession;

use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, info_span, warn};

/// How long `stop` waits for the connection that wakes the accept loop
const WAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// SMTP server that commits every accepted message to the mailbox store
#[derive(Debug, Clone)]
pub struct SmtpServer {
    config: Arc<Config>,
    store: Arc<MailboxStore>,
}

/// A server running on a background thread
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    ///
    /// Sessions already in progress run to completion on their own threads.
    /// If the accept loop cannot be woken, the loop is left to exit on the
    /// next incoming connection and `stop` returns without waiting.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the blocking accept
        match TcpStream::connect_timeout(&wake_addr(self.local_addr), WAKE_TIMEOUT) {
            Ok(_) => self.join(),
            Err(e) => warn!(
                error = %e,
                addr = %self.local_addr,
                "could not wake the accept loop, not waiting for it"
            ),
        }
    }

    /// Block until the accept loop exits
    pub fn join(self) {
        if self.thread.join().is_err() {
            error!("server thread panicked");
        }
    }
}

fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

impl SmtpServer {
    /// Create a server, opening the mailbox store configured in `config`
    pub fn new(config: Config) -> Result<Self, SmtpError> {
        let store = MailboxStore::open(&config.storage.path)?;
        Ok(Self::with_store(config, store))
    }

    /// Create a server on top of an already opened store
    pub fn with_store(config: Config, store: MailboxStore) -> Self {
        Self {
            config: Arc::new(config),
            store: Arc::new(store),
        }
    }

    /// The store messages are committed to
    pub fn store(&self) -> &MailboxStore {
        &self.store
    }

    /// Start the server on the configured address (blocking)
    pub fn start(&self) -> Result<(), SmtpError> {
        let listener = TcpListener::bind(self.config.server.addr())?;
        self.start_with_listener(listener, &AtomicBool::new(false))
    }

    /// Start the server with an existing listener (blocking).
    ///
    /// Returns once `shutdown` is set and the next connection attempt wakes
    /// the accept loop.
    pub fn start_with_listener(
        &self,
        listener: TcpListener,
        shutdown: &AtomicBool,
    ) -> Result<(), SmtpError> {
        info!(
            addr = %listener.local_addr()?,
            mailboxes = %self.store.root().display(),
            "SMTP server listening"
        );

        for stream in listener.incoming() {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let server = self.clone();
                    thread::spawn(move || server.serve_connection(stream));
                }
                Err(e) => {
                    warn!(error = %e, "error accepting connection");
                }
            }
        }

        info!("SMTP server stopped");
        Ok(())
    }

    /// Bind the configured address and run the server on a background thread
    pub fn spawn(self) -> Result<ServerHandle, SmtpError> {
        let listener = TcpListener::bind(self.config.server.addr())?;
        self.spawn_with_listener(listener)
    }

    /// Run the server on a background thread with an existing listener
    pub fn spawn_with_listener(self, listener: TcpListener) -> Result<ServerHandle, SmtpError> {
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let thread = thread::spawn(move || {
            if let Err(e) = self.start_with_listener(listener, &flag) {
                error!(error = %e, "server stopped with an error");
            }
        });

        Ok(ServerHandle {
            local_addr,
            shutdown,
            thread,
        })
    }

    fn serve_connection(&self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let span = info_span!("session", %peer);
        let _guard = span.enter();

        debug!("connection opened");
        match self.handle_client(stream) {
            Ok(()) => debug!("connection closed"),
            Err(e) => warn!(error = %e, "error handling client"),
        }
    }

    /// Handle a client connection
    fn handle_client(&self, mut stream: TcpStream) -> Result<(), SmtpError> {
        stream.set_read_timeout(Some(self.config.server.timeout()))?;

        let handler = SmtpCommandHandler::new(
            &self.config.server.hostname,
            &self.config.limits,
            &self.store,
        );
        let mut session = SmtpSession::new();
        let mut reader = BufReader::new(stream.try_clone()?);

        // Send greeting
        self.send_response(
            &mut stream,
            &SmtpResponse::greeting(&self.config.server.hostname),
        )?;

        let mut line_buffer = Vec::new();
        loop {
            line_buffer.clear();

            match reader.read_until(b'\n', &mut line_buffer) {
                Ok(0) => {
                    if session.in_data_mode() {
                        info!("client disconnected during DATA, message discarded");
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => match SmtpError::from_io(e) {
                    SmtpError::Timeout => {
                        info!("idle timeout, closing connection");
                        let timeout = SmtpError::Timeout;
                        let response = SmtpResponse::error(
                            timeout.to_response_code(),
                            &timeout.to_response_message(),
                        );
                        // The client may already be gone
                        let _ = self.send_response(&mut stream, &response);
                        break;
                    }
                    other => return Err(other),
                },
            }

            let line = line_buffer.strip_suffix(b"\n").unwrap_or(&line_buffer);
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            if session.in_data_mode() {
                if line == b"." {
                    let response = match handler.finish_data(&mut session) {
                        Ok(response) => response,
                        Err(e) => SmtpResponse::error(e.to_response_code(), &e.to_response_message()),
                    };
                    self.send_response(&mut stream, &response)?;
                    if session.is_aborted() {
                        break;
                    }
                } else {
                    // Undo dot-stuffing; the bytes are kept as sent
                    let line = line.strip_prefix(b".").unwrap_or(line);
                    session.add_data_line(line);
                }
                continue;
            }

            let text = String::from_utf8_lossy(line);
            let command = text.trim();
            if command.is_empty() {
                continue;
            }

            match handler.process_command(command, &mut session) {
                Ok(response) => {
                    self.send_response(&mut stream, &response)?;
                    if response.code == "221" {
                        break; // QUIT command
                    }
                }
                Err(e) => {
                    debug!(error = %e, command, "command rejected");
                    let response =
                        SmtpResponse::error(e.to_response_code(), &e.to_response_message());
                    self.send_response(&mut stream, &response)?;
                    if session.is_aborted() || !e.is_recoverable() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Send a response to the client
    fn send_response(
        &self,
        stream: &mut TcpStream,
        response: &SmtpResponse,
    ) -> Result<(), SmtpError> {
        stream.write_all(response.truncated().format().as_bytes())?;
        stream.flush()?;
        Ok(())
    }
}
