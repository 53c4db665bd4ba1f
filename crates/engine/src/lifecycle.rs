//! Campaign lifecycle — guards status transitions through an explicit
//! transition table and runs the periodic completion check.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use outreach_core::error::{OutreachError, OutreachResult};
use outreach_core::event_bus::{make_event, EngineEventKind, EventSink};
use outreach_core::types::{Campaign, CampaignStatus, StepStatus};

use crate::eligibility::{Eligibility, EligibilityEvaluator};
use crate::queue::DispatchQueue;
use crate::recipient::{Advance, RecipientStore};
use crate::store::CampaignStore;

/// Describes a single valid campaign status transition.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: CampaignStatus,
    pub to: CampaignStatus,
    pub trigger: &'static str,
}

/// Guards campaign lifecycle by enforcing a finite set of valid
/// state transitions.
#[derive(Debug, Clone)]
pub struct CampaignStateMachine {
    transitions: Vec<StateTransition>,
}

impl CampaignStateMachine {
    pub fn new() -> Self {
        let transitions = vec![
            StateTransition {
                from: CampaignStatus::Draft,
                to: CampaignStatus::Active,
                trigger: "activate",
            },
            StateTransition {
                from: CampaignStatus::Active,
                to: CampaignStatus::Paused,
                trigger: "pause",
            },
            StateTransition {
                from: CampaignStatus::Paused,
                to: CampaignStatus::Active,
                trigger: "resume",
            },
            StateTransition {
                from: CampaignStatus::Active,
                to: CampaignStatus::Cancelled,
                trigger: "cancel",
            },
            StateTransition {
                from: CampaignStatus::Paused,
                to: CampaignStatus::Cancelled,
                trigger: "cancel_while_paused",
            },
            StateTransition {
                from: CampaignStatus::Active,
                to: CampaignStatus::Completed,
                trigger: "completion_check",
            },
        ];
        Self { transitions }
    }

    pub fn can_transition(&self, from: CampaignStatus, to: CampaignStatus) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.to == to)
    }
}

impl Default for CampaignStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LifecycleController {
    store: Arc<CampaignStore>,
    recipients: Arc<RecipientStore>,
    queue: Arc<DispatchQueue>,
    evaluator: Arc<EligibilityEvaluator>,
    events: Arc<dyn EventSink>,
    machine: CampaignStateMachine,
}

impl LifecycleController {
    pub fn new(
        store: Arc<CampaignStore>,
        recipients: Arc<RecipientStore>,
        queue: Arc<DispatchQueue>,
        evaluator: Arc<EligibilityEvaluator>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            recipients,
            queue,
            evaluator,
            events,
            machine: CampaignStateMachine::new(),
        }
    }

    /// DRAFT → ACTIVE. Requires at least one step and a non-empty resolved
    /// roster; the step graph itself was validated at creation.
    pub fn activate(&self, campaign_id: Uuid, now: DateTime<Utc>) -> OutreachResult<()> {
        let campaign = self
            .store
            .get(campaign_id)
            .ok_or_else(|| OutreachError::not_found("campaign", campaign_id))?;

        self.guard(&campaign, CampaignStatus::Active)?;
        if campaign.steps.is_empty() {
            return Err(OutreachError::Validation(
                "campaign needs at least one step to activate".into(),
            ));
        }
        if self.store.roster(campaign_id).is_empty() {
            return Err(OutreachError::Validation(
                "campaign needs a non-empty recipient list to activate".into(),
            ));
        }

        self.store.with_campaign_mut(campaign_id, |c| {
            c.status = CampaignStatus::Active;
            c.activated_at = Some(now);
            c.current_step = 1;
        })?;
        info!(%campaign_id, "campaign activated");
        self.events.emit(make_event(
            EngineEventKind::CampaignActivated,
            Some(campaign_id),
            None,
            None,
        ));
        Ok(())
    }

    /// ACTIVE → PAUSED. Freezes scheduling and claiming; in-flight sends
    /// complete and reconcile on callback.
    pub fn pause(&self, campaign_id: Uuid) -> OutreachResult<()> {
        self.simple_transition(campaign_id, CampaignStatus::Paused, EngineEventKind::CampaignPaused)
    }

    /// PAUSED → ACTIVE.
    pub fn resume(&self, campaign_id: Uuid) -> OutreachResult<()> {
        self.simple_transition(campaign_id, CampaignStatus::Active, EngineEventKind::CampaignResumed)
    }

    /// ACTIVE/PAUSED → CANCELLED. Open tasks are cancelled and counted;
    /// claimed sends finish on their own.
    pub fn cancel(&self, campaign_id: Uuid, now: DateTime<Utc>) -> OutreachResult<()> {
        let campaign = self
            .store
            .get(campaign_id)
            .ok_or_else(|| OutreachError::not_found("campaign", campaign_id))?;
        self.guard(&campaign, CampaignStatus::Cancelled)?;

        self.store.with_campaign_mut(campaign_id, |c| {
            c.status = CampaignStatus::Cancelled;
        })?;

        let cancelled = self.queue.cancel_open_for_campaign(campaign_id);
        for task in &cancelled {
            let advance = self.recipients.apply(
                campaign_id,
                task.contact_id,
                task.step_order,
                StepStatus::Cancelled,
                now,
            );
            if advance == Advance::Applied {
                self.store
                    .record_delivery(campaign_id, task.step_id, StepStatus::Cancelled)?;
            }
        }

        info!(%campaign_id, cancelled = cancelled.len(), "campaign cancelled");
        self.events.emit(make_event(
            EngineEventKind::CampaignCancelled,
            Some(campaign_id),
            None,
            None,
        ));
        Ok(())
    }

    /// Completion check: every task terminal and every (contact, step)
    /// exhausted. Re-entrant: anything but ACTIVE is a no-op returning
    /// `false`.
    pub fn check_completion(&self, campaign_id: Uuid, now: DateTime<Utc>) -> OutreachResult<bool> {
        let campaign = self
            .store
            .get(campaign_id)
            .ok_or_else(|| OutreachError::not_found("campaign", campaign_id))?;
        if campaign.status != CampaignStatus::Active {
            return Ok(false);
        }

        if self.queue.live_count_for_campaign(campaign_id) > 0 {
            return Ok(false);
        }

        for contact in self.store.roster(campaign_id) {
            let progress = self.recipients.progress(campaign_id, contact.id);
            for step in &campaign.steps {
                match self
                    .evaluator
                    .evaluate_step(&campaign, step, progress.as_ref(), now)
                {
                    Eligibility::Exhausted => {}
                    // Still due or still awaiting a possible trigger.
                    Eligibility::Ready(_) | Eligibility::Waiting => return Ok(false),
                }
            }
        }

        self.store.with_campaign_mut(campaign_id, |c| {
            c.status = CampaignStatus::Completed;
            c.completed_at = Some(now);
        })?;
        info!(%campaign_id, "campaign completed");
        self.events.emit(make_event(
            EngineEventKind::CampaignCompleted,
            Some(campaign_id),
            None,
            None,
        ));
        Ok(true)
    }

    /// Run the completion check over every active campaign. Returns how
    /// many completed this sweep.
    pub fn completion_sweep(&self, now: DateTime<Utc>) -> usize {
        let mut completed = 0;
        for campaign in self.store.list_by_status(CampaignStatus::Active) {
            match self.check_completion(campaign.id, now) {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(campaign_id = %campaign.id, error = %e, "completion check failed");
                }
            }
        }
        completed
    }

    fn simple_transition(
        &self,
        campaign_id: Uuid,
        to: CampaignStatus,
        kind: EngineEventKind,
    ) -> OutreachResult<()> {
        let campaign = self
            .store
            .get(campaign_id)
            .ok_or_else(|| OutreachError::not_found("campaign", campaign_id))?;
        self.guard(&campaign, to)?;
        self.store
            .with_campaign_mut(campaign_id, |c| c.status = to)?;
        info!(%campaign_id, ?to, "campaign status changed");
        self.events
            .emit(make_event(kind, Some(campaign_id), None, None));
        Ok(())
    }

    fn guard(&self, campaign: &Campaign, to: CampaignStatus) -> OutreachResult<()> {
        if !self.machine.can_transition(campaign.status, to) {
            return Err(OutreachError::InvalidTransition {
                from: format!("{:?}", campaign.status),
                to: format!("{to:?}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use outreach_core::event_bus::capture_sink;
    use outreach_core::types::{Contact, ReplyType, SequenceSettings};

    use crate::eligibility::EligibilityPolicy;
    use crate::queue::DispatchTask;
    use crate::store::NewStep;

    struct Fixture {
        store: Arc<CampaignStore>,
        recipients: Arc<RecipientStore>,
        queue: Arc<DispatchQueue>,
        controller: LifecycleController,
        events: Arc<outreach_core::event_bus::CaptureSink>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(CampaignStore::new());
        let recipients = Arc::new(RecipientStore::new());
        let queue = Arc::new(DispatchQueue::new());
        let evaluator = Arc::new(EligibilityEvaluator::new(EligibilityPolicy {
            replied_satisfies_engagement_gates: true,
            gate_window: Duration::hours(168),
        }));
        let events = capture_sink();
        let controller = LifecycleController::new(
            Arc::clone(&store),
            Arc::clone(&recipients),
            Arc::clone(&queue),
            evaluator,
            events.clone(),
        );
        Fixture {
            store,
            recipients,
            queue,
            controller,
            events,
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-02T10:00:00Z")
            .expect("fixed timestamp")
            .with_timezone(&Utc)
    }

    fn draft_with_step_and_roster(fixture: &Fixture) -> (Uuid, Vec<Contact>) {
        let campaign =
            fixture
                .store
                .create_campaign(Uuid::new_v4(), "drip", SequenceSettings::default());
        fixture
            .store
            .add_step(campaign.id, NewStep::immediate(0.0, "welcome"))
            .unwrap();
        let roster = vec![Contact::new("a@example.com"), Contact::new("b@example.com")];
        fixture.store.set_roster(campaign.id, roster.clone()).unwrap();
        (campaign.id, roster)
    }

    #[test]
    fn test_activate_requires_steps_and_roster() {
        let fixture = fixture();
        let empty = fixture
            .store
            .create_campaign(Uuid::new_v4(), "empty", SequenceSettings::default());
        assert!(matches!(
            fixture.controller.activate(empty.id, t0()),
            Err(OutreachError::Validation(_))
        ));

        fixture
            .store
            .add_step(empty.id, NewStep::immediate(0.0, "welcome"))
            .unwrap();
        // Still no roster.
        assert!(fixture.controller.activate(empty.id, t0()).is_err());

        fixture
            .store
            .set_roster(empty.id, vec![Contact::new("a@example.com")])
            .unwrap();
        assert!(fixture.controller.activate(empty.id, t0()).is_ok());

        let stored = fixture.store.get(empty.id).unwrap();
        assert_eq!(stored.status, CampaignStatus::Active);
        assert_eq!(stored.activated_at, Some(t0()));
        assert_eq!(
            fixture.events.count_kind(EngineEventKind::CampaignActivated),
            1
        );
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let fixture = fixture();
        let (campaign_id, _) = draft_with_step_and_roster(&fixture);

        // Draft cannot pause or resume.
        assert!(matches!(
            fixture.controller.pause(campaign_id),
            Err(OutreachError::InvalidTransition { .. })
        ));
        assert!(fixture.controller.resume(campaign_id).is_err());

        fixture.controller.activate(campaign_id, t0()).unwrap();
        assert!(fixture.controller.pause(campaign_id).is_ok());
        assert!(fixture.controller.resume(campaign_id).is_ok());

        fixture.controller.cancel(campaign_id, t0()).unwrap();
        // Terminal: nothing further.
        assert!(fixture.controller.pause(campaign_id).is_err());
        assert!(fixture.controller.activate(campaign_id, t0()).is_err());
    }

    #[test]
    fn test_cancel_cancels_open_tasks() {
        let fixture = fixture();
        let (campaign_id, roster) = draft_with_step_and_roster(&fixture);
        fixture.controller.activate(campaign_id, t0()).unwrap();

        let campaign = fixture.store.get(campaign_id).unwrap();
        for contact in &roster {
            let task = DispatchTask::new(
                campaign.organization_id,
                campaign_id,
                campaign.steps[0].id,
                1,
                contact.id,
                t0(),
            );
            fixture.queue.insert(task.clone());
            fixture.queue.promote(task.id);
            fixture
                .recipients
                .apply(campaign_id, contact.id, 1, StepStatus::Queued, t0());
        }

        fixture.controller.cancel(campaign_id, t0()).unwrap();

        let stored = fixture.store.get(campaign_id).unwrap();
        assert_eq!(stored.status, CampaignStatus::Cancelled);
        assert_eq!(stored.counters.emails_cancelled, 2);
        assert_eq!(fixture.queue.live_count_for_campaign(campaign_id), 0);
    }

    #[test]
    fn test_completion_waits_for_gate_window() {
        let fixture = fixture();
        let campaign =
            fixture
                .store
                .create_campaign(Uuid::new_v4(), "gated", SequenceSettings::default());
        let s1 = fixture
            .store
            .add_step(campaign.id, NewStep::immediate(0.0, "step1"))
            .unwrap();
        fixture
            .store
            .add_step(
                campaign.id,
                NewStep::immediate(60.0, "step2").gated_on(s1.id, ReplyType::Opened),
            )
            .unwrap();
        let contact = Contact::new("d@example.com");
        fixture
            .store
            .set_roster(campaign.id, vec![contact.clone()])
            .unwrap();
        fixture.controller.activate(campaign.id, t0()).unwrap();

        // Step 1 sent and delivered; the contact never opens.
        fixture
            .recipients
            .apply(campaign.id, contact.id, 1, StepStatus::Queued, t0());
        fixture
            .recipients
            .apply(campaign.id, contact.id, 1, StepStatus::Sent, t0());

        // Gate window still open: not complete.
        assert!(!fixture
            .controller
            .check_completion(campaign.id, t0() + Duration::hours(1))
            .unwrap());

        // Window expired: the contact counts toward completion without a
        // step-2 task ever existing.
        assert!(fixture
            .controller
            .check_completion(campaign.id, t0() + Duration::hours(169))
            .unwrap());

        let stored = fixture.store.get(campaign.id).unwrap();
        assert_eq!(stored.status, CampaignStatus::Completed);
        assert_eq!(stored.completed_at, Some(t0() + Duration::hours(169)));

        // Re-entrant: checking a completed campaign is a no-op.
        assert!(!fixture
            .controller
            .check_completion(campaign.id, t0() + Duration::hours(170))
            .unwrap());
    }

    #[test]
    fn test_completion_blocked_by_live_tasks() {
        let fixture = fixture();
        let (campaign_id, roster) = draft_with_step_and_roster(&fixture);
        fixture.controller.activate(campaign_id, t0()).unwrap();

        let campaign = fixture.store.get(campaign_id).unwrap();
        let task = DispatchTask::new(
            campaign.organization_id,
            campaign_id,
            campaign.steps[0].id,
            1,
            roster[0].id,
            t0(),
        );
        fixture.queue.insert(task.clone());
        fixture.queue.promote(task.id);
        fixture
            .recipients
            .apply(campaign_id, roster[0].id, 1, StepStatus::Queued, t0());
        fixture
            .recipients
            .apply(campaign_id, roster[1].id, 1, StepStatus::Queued, t0());
        fixture
            .recipients
            .apply(campaign_id, roster[1].id, 1, StepStatus::Sent, t0());

        assert!(!fixture
            .controller
            .check_completion(campaign_id, t0() + Duration::hours(1))
            .unwrap());

        // Task finishes; everything is exhausted now.
        fixture.queue.claim_next(t0() + Duration::hours(1), |_| true);
        fixture.queue.report_sent(task.id);
        fixture
            .recipients
            .apply(campaign_id, roster[0].id, 1, StepStatus::Sent, t0());

        assert!(fixture
            .controller
            .check_completion(campaign_id, t0() + Duration::hours(2))
            .unwrap());
    }

    #[test]
    fn test_completion_sweep_counts() {
        let fixture = fixture();
        let (campaign_id, roster) = draft_with_step_and_roster(&fixture);
        fixture.controller.activate(campaign_id, t0()).unwrap();
        for contact in &roster {
            fixture
                .recipients
                .apply(campaign_id, contact.id, 1, StepStatus::Queued, t0());
            fixture
                .recipients
                .apply(campaign_id, contact.id, 1, StepStatus::Sent, t0());
        }

        assert_eq!(fixture.controller.completion_sweep(t0() + Duration::hours(1)), 1);
        // Idempotent.
        assert_eq!(fixture.controller.completion_sweep(t0() + Duration::hours(2)), 0);
    }
}
