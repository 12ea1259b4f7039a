//! Outbound mail transport boundary.

use async_trait::async_trait;
use thiserror::Error;

use mailforge_core::AccountId;

/// A fully-rendered message ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEmail {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    /// Outbound account the message is sent through.
    pub account: AccountId,
}

#[derive(Debug, Clone, Error)]
pub enum MailError {
    /// Transient transport failure; the queue entry is retried on the next
    /// cycle until the retry ceiling.
    #[error("transport error: {0}")]
    Transport(String),
    /// Account or transport misconfiguration; retrying will not help, but
    /// the entry is retried all the same so a fixed config picks it up.
    #[error("mailer configuration error: {0}")]
    Config(String),
}

/// Sends rendered messages. Implemented over SMTP in the infra crate and by
/// [`MockMailer`] in tests.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError>;
}

/// Recording mailer for tests; failures can be scripted per address.
#[derive(Default)]
pub struct MockMailer {
    inner: std::sync::Mutex<MockInner>,
}

#[derive(Default)]
struct MockInner {
    sent: Vec<OutboundEmail>,
    failing: std::collections::HashSet<String>,
}

impl MockMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send to `address` fail with a transport error.
    pub fn fail_for(&self, address: impl Into<String>) {
        self.inner
            .lock()
            .unwrap()
            .failing
            .insert(address.into().to_lowercase());
    }

    /// Clear scripted failures (the transport "recovered").
    pub fn recover(&self) {
        self.inner.lock().unwrap().failing.clear();
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.inner.lock().unwrap().sent.len()
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing.contains(&email.to.to_lowercase()) {
            return Err(MailError::Transport(format!(
                "scripted failure for {}",
                email.to
            )));
        }
        inner.sent.push(email.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(to: &str) -> OutboundEmail {
        OutboundEmail {
            to: to.to_string(),
            to_name: None,
            subject: "hello".to_string(),
            body_html: "<p>hi</p>".to_string(),
            body_text: "hi".to_string(),
            account: AccountId::new(),
        }
    }

    #[tokio::test]
    async fn records_sends_and_scripts_failures() {
        let mailer = MockMailer::new();
        mailer.fail_for("Bad@Example.com");

        assert!(mailer.send(&email("good@example.com")).await.is_ok());
        assert!(mailer.send(&email("bad@example.com")).await.is_err());

        mailer.recover();
        assert!(mailer.send(&email("bad@example.com")).await.is_ok());
        assert_eq!(mailer.sent_count(), 2);
    }
}
