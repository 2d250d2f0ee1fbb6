//! Pluggable SMTP transport (spec section 1: "SMTP transport itself ...
//! treated as a pluggable sender"). Grounded on the teacher's
//! `email_sender.rs` `lettre` usage, stripped of the teacher's
//! personalization/templating and per-inbox credential lookup (out of scope
//! under the "no templating engine beyond string substitution" and
//! "no per-tenant isolation" non-goals) and reshaped behind a `Sender` trait
//! so the Delivery Worker never talks to `lettre` directly.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use lettre::message::{header::ContentType, Attachment as LettreAttachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Mutex;

use crate::models::campaign::Attachment;

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub to_email: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

/// Carries enough of the raw SMTP signal for `errors.rs`/`rate_governor.rs`
/// to classify it (spec sections 4.2 and 7).
#[derive(Debug, Clone)]
pub struct SendFailure {
    pub code: Option<u16>,
    pub message: String,
}

impl std::fmt::Display for SendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), SendFailure>;
}

pub struct LettreSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
}

impl LettreSender {
    pub fn new(
        host: &str,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        from_email: String,
        from_name: String,
    ) -> anyhow::Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?.port(port);
        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(Credentials::new(user, pass));
        }
        Ok(Self {
            transport: builder.build(),
            from_email,
            from_name,
        })
    }

    fn build_message(&self, message: &OutboundMessage) -> anyhow::Result<Message> {
        let mut multipart = MultiPart::alternative()
            .singlepart(SinglePart::builder().header(ContentType::TEXT_PLAIN).body(message.text.clone()))
            .singlepart(SinglePart::builder().header(ContentType::TEXT_HTML).body(message.html.clone()));

        if !message.attachments.is_empty() {
            let mut mixed = MultiPart::mixed().multipart(multipart);
            for att in &message.attachments {
                let bytes = STANDARD.decode(&att.content_base64)?;
                let content_type = ContentType::parse(&att.content_type)
                    .unwrap_or(ContentType::parse("application/octet-stream").unwrap());
                mixed = mixed.singlepart(LettreAttachment::new(att.filename.clone()).body(bytes, content_type));
            }
            multipart = mixed;
        }

        let builder = Message::builder()
            .from(format!("{} <{}>", self.from_name, self.from_email).parse()?)
            .to(message.to_email.parse()?)
            .subject(&message.subject);
        Ok(builder.multipart(multipart)?)
    }
}

#[async_trait]
impl Sender for LettreSender {
    async fn send(&self, message: &OutboundMessage) -> Result<(), SendFailure> {
        let built = self.build_message(message).map_err(|e| SendFailure {
            code: None,
            message: e.to_string(),
        })?;
        self.transport.send(built).await.map_err(|e| SendFailure {
            code: e.status().map(|c| c.code() as u16),
            message: e.to_string(),
        })?;
        Ok(())
    }
}

/// Test double: scripted outcomes consumed in order, defaulting to success
/// once the script is exhausted. Used by `delivery_worker.rs`'s unit tests
/// and the end-to-end scenario tests in `tests/`.
#[derive(Default)]
pub struct ScriptedSender {
    script: Mutex<Vec<Result<(), SendFailure>>>,
    pub sent: Mutex<Vec<OutboundMessage>>,
}

impl ScriptedSender {
    pub fn new(script: Vec<Result<(), SendFailure>>) -> Self {
        Self {
            script: Mutex::new(script),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn always_succeeds() -> Self {
        Self::new(Vec::new())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Sender for ScriptedSender {
    async fn send(&self, message: &OutboundMessage) -> Result<(), SendFailure> {
        self.sent.lock().unwrap().push(message.clone());
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            Ok(())
        } else {
            script.remove(0)
        }
    }
}
