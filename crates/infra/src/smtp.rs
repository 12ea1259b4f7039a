//! SMTP transport behind the mailer trait.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::debug;

use mailforge_delivery::{MailError, Mailer, OutboundEmail};

use crate::config::ConfigError;

/// SMTP connection settings.
#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    /// 25 plain, 465 TLS, 587 STARTTLS.
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: String,
    pub from_name: String,
    pub use_tls: bool,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("from_address", &self.from_address)
            .field("from_name", &self.from_name)
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

impl SmtpConfig {
    /// Load from `MAILFORGE_SMTP_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("MAILFORGE_SMTP_HOST")
            .map_err(|_| ConfigError::Missing("MAILFORGE_SMTP_HOST"))?;
        let port = match std::env::var("MAILFORGE_SMTP_PORT") {
            Err(_) => 587,
            Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: "MAILFORGE_SMTP_PORT",
                expected: "port number",
                value: raw,
            })?,
        };
        let from_address = std::env::var("MAILFORGE_SMTP_FROM_ADDRESS")
            .map_err(|_| ConfigError::Missing("MAILFORGE_SMTP_FROM_ADDRESS"))?;

        Ok(Self {
            host,
            port,
            username: std::env::var("MAILFORGE_SMTP_USERNAME").ok(),
            password: std::env::var("MAILFORGE_SMTP_PASSWORD").ok(),
            from_address,
            from_name: std::env::var("MAILFORGE_SMTP_FROM_NAME")
                .unwrap_or_else(|_| "Mailforge".to_string()),
            use_tls: std::env::var("MAILFORGE_SMTP_USE_TLS")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
        })
    }
}

/// Lettre-backed async SMTP mailer.
///
/// Sends multipart (HTML + plain text) messages. The transport keeps its own
/// connection pool; the actual connection is made lazily on the first send.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_mailbox: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Result<Self, MailError> {
        let from_mailbox: Mailbox = format!("{} <{}>", config.from_name, config.from_address)
            .parse()
            .map_err(|e| MailError::Config(format!("from address: {e}")))?;

        let builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| MailError::Config(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        let mut builder = builder.port(config.port);

        if let (Some(username), Some(password)) = (config.username, config.password) {
            builder = builder.credentials(Credentials::new(username, password));
        }

        debug!("smtp transport initialized");
        Ok(Self {
            transport: builder.build(),
            from_mailbox,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError> {
        let to_mailbox: Mailbox = match &email.to_name {
            Some(name) => format!("{} <{}>", name, email.to),
            None => email.to.clone(),
        }
        .parse()
        .map_err(|e| MailError::Transport(format!("recipient address: {e}")))?;

        let message = Message::builder()
            .from(self.from_mailbox.clone())
            .to(to_mailbox)
            .subject(&email.subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(email.body_text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(email.body_html.clone()),
                    ),
            )
            .map_err(|e| MailError::Transport(format!("building message: {e}")))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;
        debug!(to = %email.to, "message handed to smtp transport");
        Ok(())
    }
}
