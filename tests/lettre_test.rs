#![cfg(feature = "ehlo")]

use lettre::message::{Mailbox, Message};
use lettre::{SmtpTransport, Transport};
use smtplab::{Config, list_mailbox, read_message, start_server, stop_server};
use std::error::Error;

#[test]
fn basic_lettre_send() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut config = Config::default();
    config.server.hostname = "localhost".to_string();
    config.server.port = 0;
    config.storage.path = dir.path().to_path_buf();

    let handle = start_server(&config)?;
    config.server.port = handle.local_addr().port();

    let message = Message::builder()
        .from("花子 <hanako@example.com>".parse::<Mailbox>()?)
        .to("太郎 <tarou@example.com>".parse::<Mailbox>()?)
        .subject("件名")
        .body("本文".to_owned())?;

    let mailer = SmtpTransport::builder_dangerous("127.0.0.1")
        .port(config.server.port)
        .build();

    mailer.send(&message)?;

    let summaries = list_mailbox(&config, "tarou@example.com")?;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].sender, "hanako@example.com");
    assert_eq!(summaries[0].subject, "件名");

    let stored = read_message(&config, "tarou@example.com", summaries[0].id)?;
    assert_eq!(stored.message.recipients, vec!["tarou@example.com"]);
    assert_eq!(stored.message.body.trim_end(), "本文");

    stop_server(handle);
    Ok(())
}
