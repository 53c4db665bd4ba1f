//! In-memory campaign store backed by DashMap.
//!
//! Production: replace with an ACID store behind the same API surface. Step
//! graphs are validated here, at creation time, so malformed references
//! never reach the scheduler. Counter updates go through the campaign's
//! entry lock, which keeps campaign and step aggregates in step with each
//! other under concurrent worker completions.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use outreach_core::error::{OutreachError, OutreachResult};
use outreach_core::types::{
    Campaign, CampaignStatus, CampaignStep, Contact, ReplyType, SequenceSettings, StepDelay,
    StepStatus, TriggerType,
};

/// Request to append a step to a draft campaign.
#[derive(Debug, Clone)]
pub struct NewStep {
    pub trigger_type: TriggerType,
    pub schedule_time: Option<DateTime<Utc>>,
    /// Decimal minutes at the API boundary; stored as whole seconds.
    pub delay_minutes: f64,
    /// IANA timezone name; `None` defaults to UTC.
    pub timezone: Option<String>,
    pub same_day_window: bool,
    pub reply_to_step_id: Option<Uuid>,
    pub reply_type: Option<ReplyType>,
    pub template_id: String,
}

impl NewStep {
    /// An IMMEDIATE step with the given delay and no reply gate.
    pub fn immediate(delay_minutes: f64, template_id: impl Into<String>) -> Self {
        Self {
            trigger_type: TriggerType::Immediate,
            schedule_time: None,
            delay_minutes,
            timezone: None,
            same_day_window: false,
            reply_to_step_id: None,
            reply_type: None,
            template_id: template_id.into(),
        }
    }

    pub fn gated_on(mut self, step_id: Uuid, reply_type: ReplyType) -> Self {
        self.reply_to_step_id = Some(step_id);
        self.reply_type = Some(reply_type);
        self
    }
}

/// Thread-safe in-memory store for campaigns and their resolved rosters.
pub struct CampaignStore {
    campaigns: DashMap<Uuid, Campaign>,
    rosters: DashMap<Uuid, Vec<Contact>>,
}

impl CampaignStore {
    pub fn new() -> Self {
        Self {
            campaigns: DashMap::new(),
            rosters: DashMap::new(),
        }
    }

    pub fn create_campaign(
        &self,
        organization_id: Uuid,
        name: impl Into<String>,
        settings: SequenceSettings,
    ) -> Campaign {
        let campaign = Campaign::new(organization_id, name, settings);
        info!(campaign_id = %campaign.id, name = %campaign.name, "Creating campaign");
        self.campaigns.insert(campaign.id, campaign.clone());
        campaign
    }

    /// Append a step, enforcing the step-graph invariants: contiguous
    /// 1-based ordering, schedule_time iff SCHEDULE, backward-only reply
    /// references with a reply_type, and a parseable timezone.
    pub fn add_step(&self, campaign_id: Uuid, new: NewStep) -> OutreachResult<CampaignStep> {
        let mut campaign = self
            .campaigns
            .get_mut(&campaign_id)
            .ok_or_else(|| OutreachError::not_found("campaign", campaign_id))?;

        if !matches!(campaign.status, CampaignStatus::Draft | CampaignStatus::Paused) {
            return Err(OutreachError::Validation(format!(
                "steps can only be edited in draft or paused campaigns, status is {:?}",
                campaign.status
            )));
        }

        let delay = StepDelay::from_minutes(new.delay_minutes)?;

        match new.trigger_type {
            TriggerType::Schedule if new.schedule_time.is_none() => {
                return Err(OutreachError::Validation(
                    "schedule_time is required for SCHEDULE steps".into(),
                ));
            }
            TriggerType::Immediate if new.schedule_time.is_some() => {
                return Err(OutreachError::Validation(
                    "schedule_time is only valid for SCHEDULE steps".into(),
                ));
            }
            _ => {}
        }

        let timezone = new.timezone.unwrap_or_else(|| "UTC".to_string());
        if timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(OutreachError::Validation(format!(
                "unknown IANA timezone '{timezone}'"
            )));
        }

        let step_order = campaign.steps.len() as u32 + 1;

        match (new.reply_to_step_id, new.reply_type) {
            (Some(reference), Some(_)) => {
                let referenced = campaign.step(reference).ok_or_else(|| {
                    OutreachError::Validation(format!(
                        "reply_to_step_id {reference} does not exist in campaign {campaign_id}"
                    ))
                })?;
                // Existing steps all precede the new one, so a forward or
                // self reference can only appear as a dangling id; the
                // order check guards future edit paths.
                if referenced.step_order >= step_order {
                    return Err(OutreachError::Validation(
                        "reply_to_step_id must reference an earlier step".into(),
                    ));
                }
            }
            (Some(_), None) => {
                return Err(OutreachError::Validation(
                    "reply_type is required when reply_to_step_id is set".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(OutreachError::Validation(
                    "reply_type without reply_to_step_id".into(),
                ));
            }
            (None, None) => {}
        }

        let step = CampaignStep {
            id: Uuid::new_v4(),
            campaign_id,
            step_order,
            trigger_type: new.trigger_type,
            schedule_time: new.schedule_time,
            delay,
            timezone,
            same_day_window: new.same_day_window,
            reply_to_step_id: new.reply_to_step_id,
            reply_type: new.reply_type,
            template_id: new.template_id,
            counters: Default::default(),
            created_at: Utc::now(),
        };

        campaign.steps.push(step.clone());
        campaign.total_steps = campaign.steps.len() as u32;
        campaign.version += 1;
        campaign.updated_at = Utc::now();

        Ok(step)
    }

    pub fn set_roster(&self, campaign_id: Uuid, contacts: Vec<Contact>) -> OutreachResult<()> {
        let campaign = self
            .campaigns
            .get(&campaign_id)
            .ok_or_else(|| OutreachError::not_found("campaign", campaign_id))?;
        if !matches!(campaign.status, CampaignStatus::Draft | CampaignStatus::Paused) {
            return Err(OutreachError::Validation(
                "roster can only be replaced in draft or paused campaigns".into(),
            ));
        }
        self.rosters.insert(campaign_id, contacts);
        Ok(())
    }

    pub fn roster(&self, campaign_id: Uuid) -> Vec<Contact> {
        self.rosters
            .get(&campaign_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn contact(&self, campaign_id: Uuid, contact_id: Uuid) -> Option<Contact> {
        self.rosters
            .get(&campaign_id)
            .and_then(|r| r.iter().find(|c| c.id == contact_id).cloned())
    }

    pub fn get(&self, campaign_id: Uuid) -> Option<Campaign> {
        self.campaigns.get(&campaign_id).map(|c| c.clone())
    }

    pub fn list(&self) -> Vec<Campaign> {
        let mut campaigns: Vec<Campaign> =
            self.campaigns.iter().map(|c| c.value().clone()).collect();
        campaigns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        campaigns
    }

    pub fn list_by_status(&self, status: CampaignStatus) -> Vec<Campaign> {
        self.campaigns
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.value().clone())
            .collect()
    }

    /// Mutate a campaign under its entry lock, bumping the optimistic
    /// version counter.
    pub fn with_campaign_mut<R>(
        &self,
        campaign_id: Uuid,
        f: impl FnOnce(&mut Campaign) -> R,
    ) -> OutreachResult<R> {
        let mut campaign = self
            .campaigns
            .get_mut(&campaign_id)
            .ok_or_else(|| OutreachError::not_found("campaign", campaign_id))?;
        let result = f(&mut campaign);
        campaign.version += 1;
        campaign.updated_at = Utc::now();
        Ok(result)
    }

    /// Record a first reach of `status` on both the campaign and the owning
    /// step aggregates, in one locked update.
    pub fn record_delivery(
        &self,
        campaign_id: Uuid,
        step_id: Uuid,
        status: StepStatus,
    ) -> OutreachResult<()> {
        self.with_campaign_mut(campaign_id, |campaign| {
            campaign.counters.record(status);
            if let Some(step) = campaign.steps.iter_mut().find(|s| s.id == step_id) {
                step.counters.record(status);
            }
        })
    }

    /// Advance the campaign's current-step pointer to `step_order` if it is
    /// ahead of the stored value.
    pub fn advance_current_step(&self, campaign_id: Uuid, step_order: u32) -> OutreachResult<()> {
        self.with_campaign_mut(campaign_id, |campaign| {
            if step_order > campaign.current_step && step_order <= campaign.total_steps {
                campaign.current_step = step_order;
            }
        })
    }
}

impl Default for CampaignStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft_campaign(store: &CampaignStore) -> Campaign {
        store.create_campaign(Uuid::new_v4(), "Test Campaign", SequenceSettings::default())
    }

    #[test]
    fn test_contiguous_step_orders() {
        let store = CampaignStore::new();
        let campaign = draft_campaign(&store);

        let s1 = store
            .add_step(campaign.id, NewStep::immediate(0.0, "welcome"))
            .unwrap();
        let s2 = store
            .add_step(campaign.id, NewStep::immediate(60.0, "follow_up"))
            .unwrap();

        assert_eq!(s1.step_order, 1);
        assert_eq!(s2.step_order, 2);
        assert_eq!(store.get(campaign.id).unwrap().total_steps, 2);
    }

    #[test]
    fn test_reply_gate_requires_reply_type() {
        let store = CampaignStore::new();
        let campaign = draft_campaign(&store);
        let s1 = store
            .add_step(campaign.id, NewStep::immediate(0.0, "welcome"))
            .unwrap();

        let mut gated = NewStep::immediate(60.0, "follow_up");
        gated.reply_to_step_id = Some(s1.id);
        assert!(store.add_step(campaign.id, gated).is_err());

        let gated = NewStep::immediate(60.0, "follow_up").gated_on(s1.id, ReplyType::Opened);
        assert!(store.add_step(campaign.id, gated).is_ok());
    }

    #[test]
    fn test_dangling_reply_reference_rejected() {
        let store = CampaignStore::new();
        let campaign = draft_campaign(&store);
        store
            .add_step(campaign.id, NewStep::immediate(0.0, "welcome"))
            .unwrap();

        let gated =
            NewStep::immediate(60.0, "follow_up").gated_on(Uuid::new_v4(), ReplyType::Opened);
        let err = store.add_step(campaign.id, gated).unwrap_err();
        assert!(matches!(err, OutreachError::Validation(_)));
    }

    #[test]
    fn test_schedule_step_requires_time() {
        let store = CampaignStore::new();
        let campaign = draft_campaign(&store);

        let mut step = NewStep::immediate(0.0, "launch");
        step.trigger_type = TriggerType::Schedule;
        assert!(store.add_step(campaign.id, step).is_err());
    }

    #[test]
    fn test_unknown_timezone_rejected() {
        let store = CampaignStore::new();
        let campaign = draft_campaign(&store);

        let mut step = NewStep::immediate(0.0, "welcome");
        step.timezone = Some("Mars/Olympus_Mons".into());
        assert!(store.add_step(campaign.id, step).is_err());

        let mut step = NewStep::immediate(0.0, "welcome");
        step.timezone = Some("America/New_York".into());
        assert!(store.add_step(campaign.id, step).is_ok());
    }

    #[test]
    fn test_steps_frozen_while_active() {
        let store = CampaignStore::new();
        let campaign = draft_campaign(&store);
        store
            .add_step(campaign.id, NewStep::immediate(0.0, "welcome"))
            .unwrap();

        store
            .with_campaign_mut(campaign.id, |c| c.status = CampaignStatus::Active)
            .unwrap();
        assert!(store
            .add_step(campaign.id, NewStep::immediate(0.0, "late"))
            .is_err());

        store
            .with_campaign_mut(campaign.id, |c| c.status = CampaignStatus::Paused)
            .unwrap();
        assert!(store
            .add_step(campaign.id, NewStep::immediate(0.0, "late"))
            .is_ok());
    }

    #[test]
    fn test_record_delivery_updates_both_aggregates() {
        let store = CampaignStore::new();
        let campaign = draft_campaign(&store);
        let step = store
            .add_step(campaign.id, NewStep::immediate(0.0, "welcome"))
            .unwrap();

        let before = store.get(campaign.id).unwrap().version;
        store
            .record_delivery(campaign.id, step.id, StepStatus::Sent)
            .unwrap();

        let stored = store.get(campaign.id).unwrap();
        assert_eq!(stored.counters.emails_sent, 1);
        assert_eq!(stored.steps[0].counters.emails_sent, 1);
        assert!(stored.version > before);
    }
}
