//! Eligibility evaluation — pure due-time and reply-gate logic, separated
//! from the scheduler so the lifecycle controller's completion sweep can
//! reuse it.
//!
//! Everything here works from absolute persisted timestamps (activation
//! time, first-reach times), so a delayed scheduler run reaches the same
//! conclusions as an on-time one.

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use outreach_core::config::EngineConfig;
use outreach_core::types::{Campaign, CampaignStep, ReplyType, StepStatus, TriggerType};

use crate::recipient::{RecipientProgress, StepProgress};

/// Policy knobs affecting gate evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EligibilityPolicy {
    /// REPLIED counts as OPENED/CLICKED for gate purposes.
    pub replied_satisfies_engagement_gates: bool,
    /// How long a gate waits for its qualifying event after the referenced
    /// step was sent.
    pub gate_window: Duration,
}

impl EligibilityPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            replied_satisfies_engagement_gates: config.replied_satisfies_engagement_gates,
            gate_window: Duration::hours(i64::from(config.gate_window_hours)),
        }
    }
}

/// What a (contact, step) pair needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// The due time is known; a task should exist with this `scheduled_for`.
    Ready(DateTime<Utc>),
    /// Prerequisites unmet, and the qualifying transition can still occur.
    Waiting,
    /// Nothing further can or should happen for this contact and step:
    /// already dispatched, permanently disqualified, window expired, or the
    /// predecessor chain is itself dead.
    Exhausted,
}

/// Evaluates step eligibility for one contact's progress record.
#[derive(Debug, Clone)]
pub struct EligibilityEvaluator {
    policy: EligibilityPolicy,
}

impl EligibilityEvaluator {
    pub fn new(policy: EligibilityPolicy) -> Self {
        Self { policy }
    }

    /// Evaluate `step` for a contact given their progress row (`None` if no
    /// row exists yet) at time `now`.
    pub fn evaluate_step(
        &self,
        campaign: &Campaign,
        step: &CampaignStep,
        progress: Option<&RecipientProgress>,
        now: DateTime<Utc>,
    ) -> Eligibility {
        if progress.map(|p| p.terminal).unwrap_or(false) {
            return Eligibility::Exhausted;
        }

        // A step that already left PENDING has a task (or a terminal
        // outcome); there is nothing for the scheduler to add.
        if let Some(own) = progress.and_then(|p| p.step(step.step_order)) {
            if own.status != StepStatus::Pending {
                return Eligibility::Exhausted;
            }
        }

        let base = match self.baseline(campaign, step, progress, now) {
            Baseline::At(base) => base,
            Baseline::Waiting => return Eligibility::Waiting,
            Baseline::Dead => return Eligibility::Exhausted,
        };

        let due = match step.trigger_type {
            // Absolute time is authoritative; never clamped.
            TriggerType::Schedule => step
                .schedule_time
                .expect("SCHEDULE step validated at creation"),
            TriggerType::Immediate => {
                let due = base + step.delay.as_duration();
                if step.same_day_window {
                    self.clamp_same_day(base, due, &step.timezone)
                } else {
                    due
                }
            }
        };

        Eligibility::Ready(due)
    }

    /// The timestamp a step's delay counts from: activation for step 1, the
    /// predecessor's send for ungated steps, the qualifying engagement for
    /// reply-gated steps.
    fn baseline(
        &self,
        campaign: &Campaign,
        step: &CampaignStep,
        progress: Option<&RecipientProgress>,
        now: DateTime<Utc>,
    ) -> Baseline {
        if let (Some(reference), Some(reply_type)) = (step.reply_to_step_id, step.reply_type) {
            let Some(referenced) = campaign.step(reference) else {
                // Creation-time validation makes this unreachable.
                return Baseline::Dead;
            };
            return match progress.and_then(|p| p.step(referenced.step_order)) {
                Some(gate_progress) => self.gate_baseline(gate_progress, reply_type, now),
                None => self.cascade(campaign, referenced, progress, now),
            };
        }

        if step.step_order == 1 {
            return match campaign.activated_at {
                Some(at) => Baseline::At(at),
                None => Baseline::Waiting,
            };
        }

        let Some(prev) = campaign.step_by_order(step.step_order - 1) else {
            return Baseline::Dead;
        };
        match progress.and_then(|p| p.step(prev.step_order)) {
            Some(prev_progress) => match prev_progress.sent_at() {
                Some(sent) => Baseline::At(sent),
                // Terminal without a send: the predecessor will never send.
                None if prev_progress.status.is_terminal() => Baseline::Dead,
                None => Baseline::Waiting,
            },
            None => self.cascade(campaign, prev, progress, now),
        }
    }

    /// A dependency step with no progress row yet: waiting if the
    /// dependency itself can still run, dead if it cannot.
    fn cascade(
        &self,
        campaign: &Campaign,
        dependency: &CampaignStep,
        progress: Option<&RecipientProgress>,
        now: DateTime<Utc>,
    ) -> Baseline {
        match self.evaluate_step(campaign, dependency, progress, now) {
            Eligibility::Exhausted => Baseline::Dead,
            Eligibility::Ready(_) | Eligibility::Waiting => Baseline::Waiting,
        }
    }

    fn gate_baseline(
        &self,
        gate_progress: &StepProgress,
        reply_type: ReplyType,
        now: DateTime<Utc>,
    ) -> Baseline {
        if let Some(at) = self.qualifying_time(gate_progress, reply_type) {
            return Baseline::At(at);
        }
        // Terminal without qualifying: permanently disqualified.
        if gate_progress.status.is_terminal() {
            return Baseline::Dead;
        }
        // The window opens when the referenced step is sent.
        match gate_progress.sent_at() {
            Some(sent) if now > sent + self.policy.gate_window => Baseline::Dead,
            _ => Baseline::Waiting,
        }
    }

    /// Earliest first-reach time of a state satisfying the gate.
    fn qualifying_time(
        &self,
        gate_progress: &StepProgress,
        reply_type: ReplyType,
    ) -> Option<DateTime<Utc>> {
        let mut qualifying: Vec<StepStatus> = match reply_type {
            ReplyType::Opened => vec![StepStatus::Opened, StepStatus::Clicked],
            ReplyType::Clicked => vec![StepStatus::Clicked],
            ReplyType::Sent => vec![
                StepStatus::Sent,
                StepStatus::Delivered,
                StepStatus::Opened,
                StepStatus::Clicked,
            ],
        };
        if self.policy.replied_satisfies_engagement_gates
            && matches!(reply_type, ReplyType::Opened | ReplyType::Clicked)
        {
            qualifying.push(StepStatus::Replied);
        }

        qualifying
            .into_iter()
            .filter_map(|status| gate_progress.reached_at(status))
            .min()
    }

    /// Clamp a delay-derived due time to the last second of the base time's
    /// local day in the step timezone.
    fn clamp_same_day(
        &self,
        base: DateTime<Utc>,
        due: DateTime<Utc>,
        timezone: &str,
    ) -> DateTime<Utc> {
        let tz: Tz = match timezone.parse() {
            Ok(tz) => tz,
            Err(_) => {
                // Validated at creation; tolerate drift in stored data.
                warn!(timezone, "unparseable step timezone, skipping day clamp");
                return due;
            }
        };

        let base_day = base.with_timezone(&tz).date_naive();
        if due.with_timezone(&tz).date_naive() <= base_day {
            return due;
        }
        let end_of_day = base_day
            .and_hms_opt(23, 59, 59)
            .expect("23:59:59 is a valid wall clock time");
        match tz.from_local_datetime(&end_of_day).latest() {
            Some(local) => local.with_timezone(&Utc),
            None => due,
        }
    }
}

enum Baseline {
    At(DateTime<Utc>),
    Waiting,
    Dead,
}
