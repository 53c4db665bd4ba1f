//! Dispatch worker — claims due tasks, renders content, calls the mail
//! transport, and reports outcomes.
//!
//! Every outcome updates the task, the recipient record, and the campaign
//! and step aggregates in one call with no fallible operation between the
//! state transition and its counter increment.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{debug, warn};

use outreach_core::config::{AppConfig, DeliveryConfig, EngineConfig};
use outreach_core::event_bus::{make_event, EngineEventKind, EventSink};
use outreach_core::types::{CampaignStatus, StepStatus};
use outreach_delivery::{MailTransport, OutboundEmail, TemplateRenderer, TransportError};

use crate::queue::{DispatchQueue, DispatchTask};
use crate::recipient::{Advance, RecipientStore};
use crate::store::CampaignStore;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_attempts: u32,
    pub retry_backoff_secs: u64,
    pub from_email: String,
    pub from_name: String,
}

impl WorkerConfig {
    pub fn from_config(engine: &EngineConfig, delivery: &DeliveryConfig) -> Self {
        Self {
            max_attempts: engine.max_attempts,
            retry_backoff_secs: engine.retry_backoff_secs,
            from_email: delivery.from_email.clone(),
            from_name: delivery.from_name.clone(),
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self::from_config(&config.engine, &config.delivery)
    }
}

/// Outcome of processing one claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    Retrying { attempt: u32 },
    Failed,
}

pub struct DispatchWorker {
    store: Arc<CampaignStore>,
    recipients: Arc<RecipientStore>,
    queue: Arc<DispatchQueue>,
    renderer: Arc<dyn TemplateRenderer>,
    transport: Arc<dyn MailTransport>,
    events: Arc<dyn EventSink>,
    config: WorkerConfig,
}

impl DispatchWorker {
    pub fn new(
        store: Arc<CampaignStore>,
        recipients: Arc<RecipientStore>,
        queue: Arc<DispatchQueue>,
        renderer: Arc<dyn TemplateRenderer>,
        transport: Arc<dyn MailTransport>,
        events: Arc<dyn EventSink>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            recipients,
            queue,
            renderer,
            transport,
            events,
            config,
        }
    }

    /// Claim and process tasks until nothing due is left. Returns how many
    /// tasks were processed.
    pub fn process_available(&self, now: DateTime<Utc>) -> usize {
        let mut processed = 0;
        while self.process_one(now).is_some() {
            processed += 1;
        }
        processed
    }

    /// Claim and process a single task. `None` when nothing is claimable.
    pub fn process_one(&self, now: DateTime<Utc>) -> Option<DispatchOutcome> {
        let store = Arc::clone(&self.store);
        let task = self.queue.claim_next(now, |t| {
            store
                .get(t.campaign_id)
                .map(|c| c.status == CampaignStatus::Active)
                .unwrap_or(false)
        })?;

        Some(self.dispatch(&task, now))
    }

    fn dispatch(&self, task: &DispatchTask, now: DateTime<Utc>) -> DispatchOutcome {
        let email = match self.build_email(task) {
            Ok(email) => email,
            Err(reason) => {
                // Render/lookup failures repeat identically on retry.
                return self.record_failed(task, &reason, now);
            }
        };

        match self.transport.send(&email) {
            Ok(receipt) => {
                debug!(
                    task_id = %task.id,
                    provider_message_id = %receipt.provider_message_id,
                    "transport accepted send"
                );
                self.record_sent(task, now)
            }
            Err(TransportError::Transient(reason)) if task.attempt_count < self.config.max_attempts => {
                let retry_at = now + self.backoff_after(task.attempt_count);
                warn!(
                    task_id = %task.id,
                    attempt = task.attempt_count,
                    retry_at = %retry_at,
                    reason = %reason,
                    "transient dispatch failure, retrying"
                );
                self.queue.report_failure(task.id, reason, Some(retry_at));
                DispatchOutcome::Retrying {
                    attempt: task.attempt_count,
                }
            }
            Err(TransportError::Transient(reason)) => {
                warn!(task_id = %task.id, reason = %reason, "retry attempts exhausted");
                self.record_failed(task, &reason, now)
            }
            Err(TransportError::Permanent(reason)) => self.record_failed(task, &reason, now),
        }
    }

    fn build_email(&self, task: &DispatchTask) -> Result<OutboundEmail, String> {
        let campaign = self
            .store
            .get(task.campaign_id)
            .ok_or_else(|| format!("campaign {} disappeared", task.campaign_id))?;
        let step = campaign
            .step(task.step_id)
            .ok_or_else(|| format!("step {} not in campaign", task.step_id))?;
        let contact = self
            .store
            .contact(task.campaign_id, task.contact_id)
            .ok_or_else(|| format!("contact {} not on roster", task.contact_id))?;

        let mut variables: HashMap<String, String> = contact.attributes.clone();
        variables.insert("email".to_string(), contact.email.clone());

        let rendered = self
            .renderer
            .render(&step.template_id, &variables)
            .map_err(|e| e.to_string())?;

        Ok(OutboundEmail {
            to: contact.email,
            from_email: self.config.from_email.clone(),
            from_name: self.config.from_name.clone(),
            subject: rendered.subject,
            body: rendered.body,
            campaign_id: task.campaign_id,
            step_id: task.step_id,
            contact_id: task.contact_id,
        })
    }

    fn record_sent(&self, task: &DispatchTask, now: DateTime<Utc>) -> DispatchOutcome {
        self.queue.report_sent(task.id);
        let advance = self.recipients.apply(
            task.campaign_id,
            task.contact_id,
            task.step_order,
            StepStatus::Sent,
            now,
        );
        if advance == Advance::Applied {
            let _ = self
                .store
                .record_delivery(task.campaign_id, task.step_id, StepStatus::Sent);
        }
        metrics::counter!("outreach.dispatch_sent").increment(1);
        self.events.emit(make_event(
            EngineEventKind::EmailSent,
            Some(task.campaign_id),
            Some(task.step_id),
            Some(task.contact_id),
        ));
        DispatchOutcome::Sent
    }

    fn record_failed(
        &self,
        task: &DispatchTask,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        self.queue.report_failure(task.id, reason, None);
        let advance = self.recipients.apply(
            task.campaign_id,
            task.contact_id,
            task.step_order,
            StepStatus::Failed,
            now,
        );
        if advance == Advance::Applied {
            let _ = self
                .store
                .record_delivery(task.campaign_id, task.step_id, StepStatus::Failed);
        }
        metrics::counter!("outreach.dispatch_failed").increment(1);
        self.events.emit(make_event(
            EngineEventKind::EmailFailed,
            Some(task.campaign_id),
            Some(task.step_id),
            Some(task.contact_id),
        ));
        DispatchOutcome::Failed
    }

    /// Exponential backoff with jitter, based on how many attempts have
    /// been made.
    fn backoff_after(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff_secs;
        let backoff = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let jitter = rand::thread_rng().gen_range(0..=base.max(1) / 2);
        Duration::seconds((backoff + jitter) as i64)
    }
}
