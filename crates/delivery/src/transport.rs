//! Mail transport contract — the boundary to the outbound email provider.
//!
//! The engine only sees accept/transient/permanent outcomes here; actual
//! delivery, opens, and clicks arrive later through webhook or polling
//! collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// A fully-rendered email handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: String,
    pub from_email: String,
    pub from_name: String,
    pub subject: String,
    pub body: String,
    pub campaign_id: Uuid,
    pub step_id: Uuid,
    pub contact_id: Uuid,
}

/// Transport acceptance receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportReceipt {
    pub provider_message_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Transport failures split by retryability.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Provider throttling, timeouts, connection resets. Retried with backoff.
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// Invalid address, rejected sender, malformed message. Never retried.
    #[error("permanent transport failure: {0}")]
    Permanent(String),
}

/// Collaborator contract for outbound mail.
pub trait MailTransport: Send + Sync {
    fn send(&self, email: &OutboundEmail) -> Result<TransportReceipt, TransportError>;
}

/// Development transport: accepts everything and logs the send.
pub struct LoggingTransport;

impl MailTransport for LoggingTransport {
    fn send(&self, email: &OutboundEmail) -> Result<TransportReceipt, TransportError> {
        info!(
            to = %email.to,
            subject = %email.subject,
            campaign_id = %email.campaign_id,
            "Sending email"
        );
        metrics::counter!("outreach.emails_sent", "transport" => "logging").increment(1);
        Ok(TransportReceipt {
            provider_message_id: format!("mx-{}", Uuid::new_v4()),
            accepted_at: Utc::now(),
        })
    }
}

/// Scripted transport for tests: outcomes keyed by recipient address.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<OutboundEmail>>,
    transient_failures: Mutex<Vec<String>>,
    permanent_failures: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send to `address` fails transiently.
    pub fn fail_transient(&self, address: impl Into<String>) {
        self.transient_failures
            .lock()
            .expect("mock transport mutex poisoned")
            .push(address.into());
    }

    /// Every send to `address` fails permanently.
    pub fn fail_permanent(&self, address: impl Into<String>) {
        self.permanent_failures
            .lock()
            .expect("mock transport mutex poisoned")
            .push(address.into());
    }

    /// Stop failing sends to `address`.
    pub fn clear_failures(&self) {
        self.transient_failures
            .lock()
            .expect("mock transport mutex poisoned")
            .clear();
        self.permanent_failures
            .lock()
            .expect("mock transport mutex poisoned")
            .clear();
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().expect("mock transport mutex poisoned").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("mock transport mutex poisoned").len()
    }
}

impl MailTransport for MockTransport {
    fn send(&self, email: &OutboundEmail) -> Result<TransportReceipt, TransportError> {
        if self
            .transient_failures
            .lock()
            .expect("mock transport mutex poisoned")
            .contains(&email.to)
        {
            debug!(to = %email.to, "mock transport: transient failure");
            return Err(TransportError::Transient("provider timeout".into()));
        }
        if self
            .permanent_failures
            .lock()
            .expect("mock transport mutex poisoned")
            .contains(&email.to)
        {
            debug!(to = %email.to, "mock transport: permanent failure");
            return Err(TransportError::Permanent("invalid address".into()));
        }

        self.sent
            .lock()
            .expect("mock transport mutex poisoned")
            .push(email.clone());
        Ok(TransportReceipt {
            provider_message_id: format!("mock-{}", Uuid::new_v4()),
            accepted_at: Utc::now(),
        })
    }
}
