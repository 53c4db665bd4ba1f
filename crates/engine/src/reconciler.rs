//! Event reconciler — applies externally-reported delivery events to
//! recipient state and cascades to aggregate counters.
//!
//! Counting is idempotent: a counter increments only on the first reach of
//! a (contact, step, state), so replayed webhooks and out-of-order
//! deliveries cannot drift the aggregates. Terminal events cascade: the
//! contact is closed out of the whole campaign and open tasks for later
//! steps are cancelled.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use outreach_core::error::{OutreachError, OutreachResult};
use outreach_core::event_bus::{make_event, EngineEventKind, EventSink};
use outreach_core::types::{DeliveryEvent, DeliveryEventType, StepStatus};

use crate::queue::DispatchQueue;
use crate::recipient::{Advance, RecipientStore};
use crate::scheduler::StepScheduler;
use crate::store::CampaignStore;
use crate::suppression::{SuppressionList, SuppressionReason};

/// What happened to a reported event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    /// Duplicate or absorbed by a terminal state; logged and dropped.
    Discarded,
}

pub struct EventReconciler {
    store: Arc<CampaignStore>,
    recipients: Arc<RecipientStore>,
    suppression: Arc<SuppressionList>,
    queue: Arc<DispatchQueue>,
    scheduler: Arc<StepScheduler>,
    events: Arc<dyn EventSink>,
}

impl EventReconciler {
    pub fn new(
        store: Arc<CampaignStore>,
        recipients: Arc<RecipientStore>,
        suppression: Arc<SuppressionList>,
        queue: Arc<DispatchQueue>,
        scheduler: Arc<StepScheduler>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            recipients,
            suppression,
            queue,
            scheduler,
            events,
        }
    }

    /// Apply one event. `now` drives dependent-step scheduling; the event's
    /// own timestamp is what gets persisted as the first-reach time.
    pub fn apply(
        &self,
        event: &DeliveryEvent,
        now: DateTime<Utc>,
    ) -> OutreachResult<ReconcileOutcome> {
        let campaign = self
            .store
            .get(event.campaign_id)
            .ok_or_else(|| OutreachError::not_found("campaign", event.campaign_id))?;
        let step = campaign
            .step(event.step_id)
            .ok_or_else(|| OutreachError::not_found("step", event.step_id))?;

        let status = event.event_type.step_status();
        let advance = self.recipients.apply(
            campaign.id,
            event.contact_id,
            step.step_order,
            status,
            event.timestamp,
        );

        if advance == Advance::Conflict {
            debug!(
                campaign_id = %campaign.id,
                contact_id = %event.contact_id,
                step_order = step.step_order,
                event_type = ?event.event_type,
                "reconciliation conflict, discarding"
            );
            metrics::counter!("outreach.events_discarded").increment(1);
            return Ok(ReconcileOutcome::Discarded);
        }

        // First reach: the matching counter increment, under the campaign
        // entry lock together with the step aggregate.
        self.store.record_delivery(campaign.id, step.id, status)?;
        metrics::counter!(
            "outreach.events_applied",
            "type" => format!("{:?}", event.event_type)
        )
        .increment(1);
        self.events.emit(make_event(
            EngineEventKind::DeliveryEventApplied,
            Some(campaign.id),
            Some(step.id),
            Some(event.contact_id),
        ));

        if status.is_campaign_terminal() {
            self.close_out_contact(&campaign, step.step_order, event, now)?;
        }

        // Push-style advancement for steps gated on this one.
        self.scheduler
            .schedule_dependents(campaign.id, step.id, event.contact_id, now);

        Ok(ReconcileOutcome::Applied)
    }

    /// Bounce/complaint/unsubscribe: cancel open tasks on later steps and,
    /// for complaint/unsubscribe, suppress the contact org-wide.
    fn close_out_contact(
        &self,
        campaign: &outreach_core::types::Campaign,
        step_order: u32,
        event: &DeliveryEvent,
        now: DateTime<Utc>,
    ) -> OutreachResult<()> {
        let cancelled =
            self.queue
                .cancel_open_for_contact(campaign.id, event.contact_id, step_order);
        for task in &cancelled {
            let advance = self.recipients.apply(
                campaign.id,
                event.contact_id,
                task.step_order,
                StepStatus::Cancelled,
                now,
            );
            if advance == Advance::Applied {
                self.store
                    .record_delivery(campaign.id, task.step_id, StepStatus::Cancelled)?;
            }
            self.events.emit(make_event(
                EngineEventKind::TaskCancelled,
                Some(campaign.id),
                Some(task.step_id),
                Some(event.contact_id),
            ));
        }

        let reason = match event.event_type {
            DeliveryEventType::Complained => Some(SuppressionReason::Complained),
            DeliveryEventType::Unsubscribed => Some(SuppressionReason::Unsubscribed),
            // Bounces are terminal for this campaign only.
            _ => None,
        };
        if let Some(reason) = reason {
            if self
                .suppression
                .add(campaign.organization_id, event.contact_id, reason)
            {
                self.events.emit(make_event(
                    EngineEventKind::ContactSuppressed,
                    Some(campaign.id),
                    None,
                    Some(event.contact_id),
                ));
            }
        }
        Ok(())
    }
}
