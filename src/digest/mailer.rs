//! Digest delivery over SMTP with implicit TLS.

use lettre::address::{AddressError, Envelope};
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::config::MailCredentials;

const SMTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum MailError {
    #[error("Invalid mail address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: AddressError,
    },
    #[error("Failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("SMTP delivery failed: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

/// Delivers one rendered digest.
///
/// A failed send is final for the run. Redelivery happens on the next run
/// because the watermark stays where it was.
pub trait Mailer: Send + Sync {
    fn send(
        &self,
        credentials: &MailCredentials,
        recipient: &str,
        subject: &str,
        html_body: &str,
    ) -> impl Future<Output = Result<(), MailError>> + Send;
}

/// SMTP mailer. Opens one TLS session per digest, authenticates with PLAIN,
/// sends, and quits.
pub struct SmtpMailer {
    /// Header `From` mailbox. Falls back to the SMTP login.
    from: Option<String>,
}

impl SmtpMailer {
    #[must_use]
    pub const fn new(from: Option<String>) -> Self {
        Self { from }
    }

    /// Builds the message. The envelope sender is the SMTP login when it is
    /// an address, otherwise the header sender.
    pub fn build_message(
        &self,
        login: &str,
        recipient: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<Message, MailError> {
        let from_str = self.from.as_deref().unwrap_or(login);
        let from: Mailbox = parse_address(from_str)?;
        let to: Mailbox = parse_address(recipient)?;

        let sender = login
            .parse::<Address>()
            .unwrap_or_else(|_| from.email.clone());
        let envelope = Envelope::new(Some(sender), vec![to.email.clone()])?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .envelope(envelope)
            .header(ContentType::TEXT_HTML)
            .body(html_body.to_string())?;
        Ok(message)
    }
}

fn parse_address(address: &str) -> Result<Mailbox, MailError> {
    address.parse().map_err(|source| MailError::Address {
        address: address.to_string(),
        source,
    })
}

impl Mailer for SmtpMailer {
    async fn send(
        &self,
        credentials: &MailCredentials,
        recipient: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<(), MailError> {
        let message = self.build_message(&credentials.login, recipient, subject, html_body)?;

        let creds = Credentials::new(
            credentials.login.clone(),
            credentials.password.expose_secret().to_owned(),
        );

        // `relay` wraps the connection in TLS from the first byte (no STARTTLS).
        let transport: AsyncSmtpTransport<Tokio1Executor> =
            AsyncSmtpTransport::<Tokio1Executor>::relay(&credentials.host)?
                .port(credentials.port)
                .credentials(creds)
                .authentication(vec![Mechanism::Plain])
                .timeout(Some(SMTP_TIMEOUT))
                .build();

        transport.send(message).await?;

        tracing::info!(
            to = %recipient,
            subject = subject,
            "Digest mailed"
        );
        Ok(())
    }
}
