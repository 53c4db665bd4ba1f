//! Step scheduler — decides which contacts are due for which step and
//! enqueues exactly one dispatch task per (campaign, step, contact).
//!
//! A pass re-derives everything from absolute timestamps, so delayed or
//! repeated invocations converge on the same task set; the queue's
//! idempotency key absorbs the duplicates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use outreach_core::event_bus::{make_event, EngineEventKind, EventSink};
use outreach_core::types::{Campaign, CampaignStatus, CampaignStep, StepStatus};

use crate::eligibility::{Eligibility, EligibilityEvaluator};
use crate::queue::{DispatchQueue, DispatchTask, InsertOutcome};
use crate::quota::QuotaLedger;
use crate::recipient::RecipientStore;
use crate::store::CampaignStore;
use crate::suppression::SuppressionList;

/// What one scheduler pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerPassSummary {
    /// Tasks created and quota-granted this pass.
    pub enqueued: usize,
    /// Tasks created but left PENDING on quota exhaustion.
    pub deferred: usize,
    /// Previously deferred tasks promoted to QUEUED.
    pub promoted: usize,
}

pub struct StepScheduler {
    store: Arc<CampaignStore>,
    recipients: Arc<RecipientStore>,
    suppression: Arc<SuppressionList>,
    queue: Arc<DispatchQueue>,
    quota: Arc<QuotaLedger>,
    evaluator: Arc<EligibilityEvaluator>,
    events: Arc<dyn EventSink>,
}

impl StepScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<CampaignStore>,
        recipients: Arc<RecipientStore>,
        suppression: Arc<SuppressionList>,
        queue: Arc<DispatchQueue>,
        quota: Arc<QuotaLedger>,
        evaluator: Arc<EligibilityEvaluator>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            recipients,
            suppression,
            queue,
            quota,
            evaluator,
            events,
        }
    }

    /// One full pass: retry quota-deferred tasks, then evaluate every step
    /// of every active campaign.
    pub fn run_pass(&self, now: DateTime<Utc>) -> SchedulerPassSummary {
        let mut summary = SchedulerPassSummary::default();

        for task in self.queue.pending_tasks() {
            let active = self
                .store
                .get(task.campaign_id)
                .map(|c| c.status == CampaignStatus::Active)
                .unwrap_or(false);
            if !active {
                continue;
            }
            if self
                .quota
                .check_and_reserve(task.organization_id, 1, now.date_naive())
                .granted
                && self.queue.promote(task.id)
            {
                summary.promoted += 1;
            }
        }

        for campaign in self.store.list_by_status(CampaignStatus::Active) {
            self.schedule_campaign(&campaign, now, &mut summary);
        }

        debug!(
            enqueued = summary.enqueued,
            deferred = summary.deferred,
            promoted = summary.promoted,
            "scheduler pass complete"
        );
        summary
    }

    /// Push-style advancement: after an event on `source_step_id`, evaluate
    /// only the steps gated on it for that contact, instead of rescanning
    /// the whole campaign.
    pub fn schedule_dependents(
        &self,
        campaign_id: Uuid,
        source_step_id: Uuid,
        contact_id: Uuid,
        now: DateTime<Utc>,
    ) -> usize {
        let Some(campaign) = self.store.get(campaign_id) else {
            return 0;
        };
        if campaign.status != CampaignStatus::Active {
            return 0;
        }

        let mut summary = SchedulerPassSummary::default();
        for step in campaign.dependents_of(source_step_id) {
            self.consider(&campaign, step, contact_id, now, &mut summary);
        }
        summary.enqueued + summary.deferred
    }

    fn schedule_campaign(
        &self,
        campaign: &Campaign,
        now: DateTime<Utc>,
        summary: &mut SchedulerPassSummary,
    ) {
        let roster = self.store.roster(campaign.id);
        for step in &campaign.steps {
            for contact in &roster {
                self.consider(campaign, step, contact.id, now, summary);
            }
        }
    }

    fn consider(
        &self,
        campaign: &Campaign,
        step: &CampaignStep,
        contact_id: Uuid,
        now: DateTime<Utc>,
        summary: &mut SchedulerPassSummary,
    ) {
        if self
            .suppression
            .is_suppressed(campaign.organization_id, contact_id)
        {
            return;
        }

        let key = crate::queue::IdempotencyKey {
            campaign_id: campaign.id,
            step_id: step.id,
            contact_id,
        };
        if self.queue.contains_key(&key) {
            return;
        }

        let progress = self.recipients.progress(campaign.id, contact_id);
        match self
            .evaluator
            .evaluate_step(campaign, step, progress.as_ref(), now)
        {
            Eligibility::Ready(due) => self.enqueue(campaign, step, contact_id, due, now, summary),
            Eligibility::Waiting | Eligibility::Exhausted => {}
        }
    }

    fn enqueue(
        &self,
        campaign: &Campaign,
        step: &CampaignStep,
        contact_id: Uuid,
        due: DateTime<Utc>,
        now: DateTime<Utc>,
        summary: &mut SchedulerPassSummary,
    ) {
        let task = DispatchTask::new(
            campaign.organization_id,
            campaign.id,
            step.id,
            step.step_order,
            contact_id,
            due,
        );
        let id = match self.queue.insert(task) {
            // A concurrent pass won the race; nothing more to do.
            InsertOutcome::Duplicate(_) => return,
            InsertOutcome::Created(id) => id,
        };

        self.recipients
            .apply(campaign.id, contact_id, step.step_order, StepStatus::Queued, now);
        let _ = self.store.advance_current_step(campaign.id, step.step_order);

        let decision = self
            .quota
            .check_and_reserve(campaign.organization_id, 1, now.date_naive());
        if decision.granted {
            self.queue.promote(id);
            metrics::counter!("outreach.tasks_enqueued").increment(1);
            self.events.emit(make_event(
                EngineEventKind::TaskEnqueued,
                Some(campaign.id),
                Some(step.id),
                Some(contact_id),
            ));
            summary.enqueued += 1;
        } else {
            metrics::counter!("outreach.tasks_deferred").increment(1);
            self.events.emit(make_event(
                EngineEventKind::TaskDeferred,
                Some(campaign.id),
                Some(step.id),
                Some(contact_id),
            ));
            summary.deferred += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use outreach_core::event_bus::capture_sink;
    use outreach_core::types::{Contact, ReplyType, SequenceSettings};

    use crate::eligibility::EligibilityPolicy;
    use crate::quota::{StaticPlanSource, QuotaLedger};
    use crate::store::NewStep;
    use crate::suppression::SuppressionReason;

    struct Fixture {
        store: Arc<CampaignStore>,
        recipients: Arc<RecipientStore>,
        suppression: Arc<SuppressionList>,
        queue: Arc<DispatchQueue>,
        quota: Arc<QuotaLedger>,
        scheduler: StepScheduler,
        events: Arc<outreach_core::event_bus::CaptureSink>,
    }

    fn fixture(default_limit: Option<u64>) -> Fixture {
        let store = Arc::new(CampaignStore::new());
        let recipients = Arc::new(RecipientStore::new());
        let suppression = Arc::new(SuppressionList::new());
        let queue = Arc::new(DispatchQueue::new());
        let quota = Arc::new(QuotaLedger::new(Arc::new(StaticPlanSource::new(
            default_limit,
        ))));
        let evaluator = Arc::new(EligibilityEvaluator::new(EligibilityPolicy {
            replied_satisfies_engagement_gates: true,
            gate_window: Duration::hours(168),
        }));
        let events = capture_sink();
        let scheduler = StepScheduler::new(
            Arc::clone(&store),
            Arc::clone(&recipients),
            Arc::clone(&suppression),
            Arc::clone(&queue),
            Arc::clone(&quota),
            evaluator,
            events.clone(),
        );
        Fixture {
            store,
            recipients,
            suppression,
            queue,
            quota,
            scheduler,
            events,
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-02T10:00:00Z")
            .expect("fixed timestamp")
            .with_timezone(&Utc)
    }

    fn active_campaign(fixture: &Fixture, contacts: usize) -> (Campaign, Vec<Contact>) {
        let campaign =
            fixture
                .store
                .create_campaign(Uuid::new_v4(), "drip", SequenceSettings::default());
        fixture
            .store
            .add_step(campaign.id, NewStep::immediate(0.0, "welcome"))
            .unwrap();
        let roster: Vec<Contact> = (0..contacts)
            .map(|i| Contact::new(format!("contact{i}@example.com")))
            .collect();
        fixture.store.set_roster(campaign.id, roster.clone()).unwrap();
        fixture
            .store
            .with_campaign_mut(campaign.id, |c| {
                c.status = CampaignStatus::Active;
                c.activated_at = Some(t0());
            })
            .unwrap();
        (fixture.store.get(campaign.id).unwrap(), roster)
    }

    #[test]
    fn test_pass_enqueues_step1_once() {
        let fixture = fixture(None);
        let (campaign, _) = active_campaign(&fixture, 3);

        let summary = fixture.scheduler.run_pass(t0());
        assert_eq!(summary.enqueued, 3);

        // Re-running the pass adds nothing.
        let summary = fixture.scheduler.run_pass(t0() + Duration::minutes(5));
        assert_eq!(summary.enqueued, 0);
        assert_eq!(fixture.queue.tasks_for_campaign(campaign.id).len(), 3);
    }

    #[test]
    fn test_quota_exhaustion_defers() {
        let fixture = fixture(Some(2));
        let (campaign, _) = active_campaign(&fixture, 3);

        let summary = fixture.scheduler.run_pass(t0());
        assert_eq!(summary.enqueued, 2);
        assert_eq!(summary.deferred, 1);
        assert_eq!(
            fixture
                .events
                .count_kind(EngineEventKind::TaskDeferred),
            1
        );

        // Same period: the deferred task stays pending.
        let summary = fixture.scheduler.run_pass(t0() + Duration::hours(1));
        assert_eq!(summary.promoted, 0);

        // After the nightly reset the next pass promotes it.
        fixture.quota.reset_all((t0() + Duration::days(1)).date_naive());
        let summary = fixture.scheduler.run_pass(t0() + Duration::days(1));
        assert_eq!(summary.promoted, 1);
        assert_eq!(fixture.queue.pending_tasks().len(), 0);
        let _ = campaign;
    }

    #[test]
    fn test_suppressed_contact_excluded() {
        let fixture = fixture(None);
        let (campaign, roster) = active_campaign(&fixture, 2);
        fixture.suppression.add(
            campaign.organization_id,
            roster[0].id,
            SuppressionReason::Unsubscribed,
        );

        let summary = fixture.scheduler.run_pass(t0());
        assert_eq!(summary.enqueued, 1);
        let tasks = fixture.queue.tasks_for_campaign(campaign.id);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].contact_id, roster[1].id);
    }

    #[test]
    fn test_paused_campaign_is_frozen() {
        let fixture = fixture(None);
        let (campaign, _) = active_campaign(&fixture, 2);
        fixture
            .store
            .with_campaign_mut(campaign.id, |c| c.status = CampaignStatus::Paused)
            .unwrap();

        let summary = fixture.scheduler.run_pass(t0());
        assert_eq!(summary.enqueued, 0);
        assert!(fixture.queue.tasks_for_campaign(campaign.id).is_empty());
    }

    #[test]
    fn test_dependent_scheduling_carries_gate_timing() {
        let fixture = fixture(None);
        let campaign =
            fixture
                .store
                .create_campaign(Uuid::new_v4(), "gated", SequenceSettings::default());
        let s1 = fixture
            .store
            .add_step(campaign.id, NewStep::immediate(0.0, "step1"))
            .unwrap();
        let s2 = fixture
            .store
            .add_step(
                campaign.id,
                NewStep::immediate(60.0, "step2").gated_on(s1.id, ReplyType::Opened),
            )
            .unwrap();
        let contact = Contact::new("c@example.com");
        fixture
            .store
            .set_roster(campaign.id, vec![contact.clone()])
            .unwrap();
        fixture
            .store
            .with_campaign_mut(campaign.id, |c| {
                c.status = CampaignStatus::Active;
                c.activated_at = Some(t0());
            })
            .unwrap();

        // Step 1 sent at T0, opened at T0+10.
        fixture
            .recipients
            .apply(campaign.id, contact.id, 1, StepStatus::Queued, t0());
        fixture
            .recipients
            .apply(campaign.id, contact.id, 1, StepStatus::Sent, t0());
        fixture.recipients.apply(
            campaign.id,
            contact.id,
            1,
            StepStatus::Opened,
            t0() + Duration::minutes(10),
        );

        let scheduled = fixture.scheduler.schedule_dependents(
            campaign.id,
            s1.id,
            contact.id,
            t0() + Duration::minutes(10),
        );
        assert_eq!(scheduled, 1);

        let task = fixture
            .queue
            .task_for_key(&crate::queue::IdempotencyKey {
                campaign_id: campaign.id,
                step_id: s2.id,
                contact_id: contact.id,
            })
            .unwrap();
        assert_eq!(task.scheduled_for, t0() + Duration::minutes(70));
    }
}
