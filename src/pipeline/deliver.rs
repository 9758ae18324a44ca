//! Delivery: e-mail the final PDF.
//!
//! [`SmtpNotifier`] opens one authenticated SMTP session per message (lettre
//! is built without its `pool` feature), so the connection is closed on every
//! exit path, including timeouts. Port 465 uses implicit TLS; any other port
//! uses STARTTLS.
//!
//! The relay credential must be app-scoped (e.g. a Gmail app password).

use crate::config::EmailConfig;
use crate::error::{DeliveryError, DeliveryFailure, DocQrError};
use crate::output::PdfArtifact;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tracing::{debug, info};

/// A message to deliver alongside the PDF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub attachment_name: String,
}

/// Sends the final PDF to a recipient.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, pdf: &PdfArtifact, mail: &OutgoingMail) -> Result<(), DeliveryError>;
}

/// SMTP notifier built on lettre.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl std::fmt::Debug for SmtpNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpNotifier")
            .field("sender", &self.sender.to_string())
            .finish_non_exhaustive()
    }
}

impl SmtpNotifier {
    /// Build a notifier from the relay settings.
    ///
    /// Fails when the sender or password is missing or the sender address
    /// does not parse.
    pub fn new(config: &EmailConfig) -> Result<Self, DocQrError> {
        let not_configured = |hint: String| DocQrError::BackendNotConfigured {
            backend: "smtp".to_string(),
            hint,
        };
        let (Some(sender), Some(password)) = (config.sender.as_deref(), config.password.as_deref())
        else {
            return Err(not_configured(
                "Set email.sender and email.password (an app password) in config.json".into(),
            ));
        };
        let mailbox: Mailbox = sender
            .parse()
            .map_err(|e| not_configured(format!("invalid sender '{sender}': {e}")))?;

        let builder = if config.smtp_port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_server)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_server)
        }
        .map_err(|e| not_configured(format!("relay '{}': {e}", config.smtp_server)))?;

        let transport = builder
            .port(config.smtp_port)
            .credentials(Credentials::new(sender.to_string(), password.to_string()))
            .timeout(Some(Duration::from_secs(config.timeout_secs)))
            .build();

        Ok(Self {
            transport,
            sender: mailbox,
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, pdf: &PdfArtifact, mail: &OutgoingMail) -> Result<(), DeliveryError> {
        let recipient: Mailbox = mail.recipient.parse().map_err(|e| {
            DeliveryError::new(
                DeliveryFailure::RecipientInvalid,
                format!("'{}': {e}", mail.recipient),
            )
        })?;
        let message = build_message(self.sender.clone(), recipient, pdf, mail)?;
        debug!(
            "Sending {} ({} bytes) to {}",
            mail.attachment_name,
            pdf.bytes.len(),
            mail.recipient
        );

        self.transport
            .send(message)
            .await
            .map_err(|e| classify_smtp_error(&e))?;
        info!("Delivered {} to {}", mail.attachment_name, mail.recipient);
        Ok(())
    }
}

fn build_message(
    from: Mailbox,
    to: Mailbox,
    pdf: &PdfArtifact,
    mail: &OutgoingMail,
) -> Result<Message, DeliveryError> {
    let rejected = |detail: String| DeliveryError::new(DeliveryFailure::Rejected, detail);
    let pdf_type = ContentType::parse("application/pdf").map_err(|e| rejected(e.to_string()))?;
    Message::builder()
        .from(from)
        .to(to)
        .subject(mail.subject.clone())
        .multipart(
            MultiPart::mixed()
                .singlepart(SinglePart::plain(mail.body.clone()))
                .singlepart(
                    Attachment::new(mail.attachment_name.clone()).body(pdf.bytes.to_vec(), pdf_type),
                ),
        )
        .map_err(|e| rejected(e.to_string()))
}

/// Map an SMTP failure to a delivery reason.
fn classify_smtp_error(err: &lettre::transport::smtp::Error) -> DeliveryError {
    let detail = err.to_string();
    let reason = match err.status() {
        Some(code) => classify_smtp_code(&code.to_string(), err.is_transient()),
        None => DeliveryFailure::Network,
    };
    DeliveryError::new(reason, detail)
}

fn classify_smtp_code(code: &str, transient: bool) -> DeliveryFailure {
    match code {
        "530" | "534" | "535" | "538" => DeliveryFailure::Auth,
        "501" | "550" | "551" | "553" => DeliveryFailure::RecipientInvalid,
        _ if transient => DeliveryFailure::Network,
        _ => DeliveryFailure::Rejected,
    }
}
