//! Email delivery of transferred activity files.
//!
//! [`Notifier`] builds the message and enforces the size limit before any
//! connection is made; a [`Mailer`] only delivers. Two mailers exist: SMTP
//! over TLS for real runs and an `outbox/` writer for devmode.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{FileTransport, Message, SmtpTransport, Transport};
use thiserror::Error;

use crate::config::{MailTemplate, SmtpSettings};
use crate::error::WorkerError;
use crate::input_validation::Recipient;

/// Implicit TLS port; every other port negotiates STARTTLS.
const SMTPS_PORT: u16 = 465;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("authentication rejected by {server}")]
    AuthRejected { server: String },

    #[error("cannot reach {server}:{port}: {detail}")]
    ConnectFailure {
        server: String,
        port: u16,
        detail: String,
    },

    #[error("attachments total {total_bytes} bytes, limit {limit_bytes}")]
    AttachmentTooLarge { total_bytes: u64, limit_bytes: u64 },

    #[error("{0}")]
    Rejected(String),

    #[error("cannot build message: {0}")]
    Compose(String),
}

impl From<NotifyError> for WorkerError {
    fn from(err: NotifyError) -> Self {
        match err {
            NotifyError::AuthRejected { server } => WorkerError::AuthRejected { server },
            NotifyError::ConnectFailure { server, port, detail } => {
                WorkerError::SmtpConnectFailure { server, port, detail }
            }
            NotifyError::AttachmentTooLarge {
                total_bytes,
                limit_bytes,
            } => WorkerError::AttachmentTooLarge {
                total_bytes,
                limit_bytes,
            },
            NotifyError::Rejected(detail) => WorkerError::SendFailed { detail },
            NotifyError::Compose(detail) => WorkerError::SendFailed { detail },
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub to: Recipient,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<PathBuf>,
}

/// Delivery seam. Implementations block; call them off the async runtime.
pub trait Mailer: Send + Sync {
    fn deliver(&self, mail: &OutgoingMail) -> Result<(), NotifyError>;
}

/// Coarse SMTP failure classes, decided from the reply code alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpFailureClass {
    Auth,
    TooLarge,
    Rejected,
    Connect,
}

/// `53x` is an authentication problem, `552` a size limit. Any other
/// permanent reply is a rejection; no reply at all means the connection failed.
pub fn classify(code: Option<&str>, permanent: bool) -> SmtpFailureClass {
    match code {
        Some(c) if c.starts_with("53") => SmtpFailureClass::Auth,
        Some("552") => SmtpFailureClass::TooLarge,
        Some(_) if permanent => SmtpFailureClass::Rejected,
        _ => SmtpFailureClass::Connect,
    }
}

pub struct SmtpMailer {
    settings: SmtpSettings,
    timeout: Duration,
}

impl SmtpMailer {
    pub fn new(settings: SmtpSettings, timeout: Duration) -> Self {
        Self { settings, timeout }
    }

    fn transport(&self) -> Result<SmtpTransport, NotifyError> {
        let builder = if self.settings.smtp_port == SMTPS_PORT {
            SmtpTransport::relay(&self.settings.smtp_server)
        } else {
            SmtpTransport::starttls_relay(&self.settings.smtp_server)
        }
        .map_err(|e| self.connect_failure(e.to_string()))?;

        Ok(builder
            .port(self.settings.smtp_port)
            .credentials(Credentials::new(
                self.settings.username.clone(),
                self.settings.password.clone(),
            ))
            .timeout(Some(self.timeout))
            .build())
    }

    fn connect_failure(&self, detail: String) -> NotifyError {
        NotifyError::ConnectFailure {
            server: self.settings.smtp_server.clone(),
            port: self.settings.smtp_port,
            detail,
        }
    }
}

impl Mailer for SmtpMailer {
    fn deliver(&self, mail: &OutgoingMail) -> Result<(), NotifyError> {
        let message = compose_message(self.settings.sender(), mail)?;
        let transport = self.transport()?;

        tracing::debug!(
            "sending to {} via {}:{}",
            mail.to.email,
            self.settings.smtp_server,
            self.settings.smtp_port
        );
        transport.send(&message).map(|_| ()).map_err(|e| {
            let code = e.status().map(|c| c.to_string());
            match classify(code.as_deref(), e.is_permanent()) {
                SmtpFailureClass::Auth => NotifyError::AuthRejected {
                    server: self.settings.smtp_server.clone(),
                },
                SmtpFailureClass::TooLarge => NotifyError::Rejected(format!(
                    "{} refused the message size: {e}",
                    self.settings.smtp_server
                )),
                SmtpFailureClass::Rejected => NotifyError::Rejected(e.to_string()),
                SmtpFailureClass::Connect => self.connect_failure(e.to_string()),
            }
        })
    }
}

/// Writes `.eml` files instead of sending; used in devmode.
pub struct OutboxMailer {
    dir: PathBuf,
    from: String,
}

impl OutboxMailer {
    pub fn new(dir: PathBuf, from: impl Into<String>) -> Self {
        Self {
            dir,
            from: from.into(),
        }
    }
}

impl Mailer for OutboxMailer {
    fn deliver(&self, mail: &OutgoingMail) -> Result<(), NotifyError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| NotifyError::Rejected(format!("cannot create {}: {e}", self.dir.display())))?;
        let message = compose_message(&self.from, mail)?;
        let id = FileTransport::new(&self.dir)
            .send(&message)
            .map_err(|e| NotifyError::Rejected(e.to_string()))?;
        tracing::info!("devmode: mail written to {}/{id}.eml", self.dir.display());
        Ok(())
    }
}

pub fn compose_message(from: &str, mail: &OutgoingMail) -> Result<Message, NotifyError> {
    let from: Mailbox = from
        .parse()
        .map_err(|e| NotifyError::Compose(format!("invalid sender {from}: {e}")))?;
    let to = Mailbox::new(
        Some(mail.to.name.clone()),
        mail.to
            .email
            .parse()
            .map_err(|e| NotifyError::Compose(format!("invalid recipient {}: {e}", mail.to.email)))?,
    );

    let octet_stream = ContentType::parse("application/octet-stream")
        .map_err(|e| NotifyError::Compose(e.to_string()))?;
    let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(mail.body.clone()));
    for path in &mail.attachments {
        let bytes = std::fs::read(path)
            .map_err(|e| NotifyError::Compose(format!("cannot read {}: {e}", path.display())))?;
        parts = parts.singlepart(Attachment::new(attachment_name(path)).body(bytes, octet_stream.clone()));
    }

    Message::builder()
        .from(from)
        .to(to)
        .subject(mail.subject.clone())
        .multipart(parts)
        .map_err(|e| NotifyError::Compose(e.to_string()))
}

fn attachment_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "activity.fit".to_string())
}

pub fn subject_for(count: usize, day: NaiveDate) -> String {
    let day = day.format("%Y-%m-%d");
    if count == 1 {
        format!("Garmin FIT {day}")
    } else {
        format!("Garmin FIT activities ({count} files) – {day}")
    }
}

pub struct Notifier {
    mailer: Arc<dyn Mailer>,
    template: MailTemplate,
    max_attachment_bytes: u64,
}

impl Notifier {
    pub fn new(mailer: Arc<dyn Mailer>, template: MailTemplate, max_attachment_bytes: u64) -> Self {
        Self {
            mailer,
            template,
            max_attachment_bytes,
        }
    }

    /// Sends the successfully transferred files. Blocking.
    pub fn send(&self, recipient: &Recipient, attachments: &[PathBuf], day: NaiveDate) -> Result<(), NotifyError> {
        let mail = self.prepare(recipient, attachments, day)?;
        self.mailer.deliver(&mail)
    }

    /// Builds the mail and checks the size limit without touching the network.
    pub fn prepare(
        &self,
        recipient: &Recipient,
        attachments: &[PathBuf],
        day: NaiveDate,
    ) -> Result<OutgoingMail, NotifyError> {
        let mut total_bytes = 0u64;
        for path in attachments {
            let len = std::fs::metadata(path)
                .map_err(|e| NotifyError::Compose(format!("cannot read {}: {e}", path.display())))?
                .len();
            total_bytes += len;
        }
        if total_bytes > self.max_attachment_bytes {
            return Err(NotifyError::AttachmentTooLarge {
                total_bytes,
                limit_bytes: self.max_attachment_bytes,
            });
        }

        Ok(OutgoingMail {
            to: recipient.clone(),
            subject: subject_for(attachments.len(), day),
            body: self.template.render(&recipient.name),
            attachments: attachments.to_vec(),
        })
    }
}
