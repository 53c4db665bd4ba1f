use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OutreachError, OutreachResult};

/// Lifecycle status of a campaign. Transitions are owned by the lifecycle
/// controller; nothing else mutates this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Cancelled,
    Completed,
}

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed)
    }
}

/// How a step's due time is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Due time is the predecessor baseline plus the step delay.
    Immediate,
    /// Due time is the absolute `schedule_time`.
    Schedule,
}

/// Engagement state a reply-gated step requires of its referenced step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyType {
    Opened,
    Clicked,
    Sent,
}

/// Per-recipient-per-step delivery status. A high-water mark: the linear
/// chain PENDING → QUEUED → SENT → DELIVERED → OPENED → CLICKED only moves
/// forward, and the terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Queued,
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Failed,
    Complained,
    Replied,
    Unsubscribed,
    Cancelled,
}

impl StepStatus {
    /// Position on the linear delivery chain; `None` for terminal states.
    pub fn chain_rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Queued => Some(1),
            Self::Sent => Some(2),
            Self::Delivered => Some(3),
            Self::Opened => Some(4),
            Self::Clicked => Some(5),
            _ => None,
        }
    }

    /// Terminal states absorb all later events for the step.
    pub fn is_terminal(&self) -> bool {
        self.chain_rank().is_none()
    }

    /// States that end a recipient's participation in the whole campaign.
    pub fn is_campaign_terminal(&self) -> bool {
        matches!(self, Self::Bounced | Self::Complained | Self::Unsubscribed)
    }
}

/// Monotonically non-decreasing delivery counters, kept both per campaign
/// and per step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCounters {
    pub emails_sent: u64,
    pub emails_delivered: u64,
    pub emails_opened: u64,
    pub emails_clicked: u64,
    pub emails_bounced: u64,
    pub emails_failed: u64,
    pub emails_cancelled: u64,
    pub emails_complained: u64,
    pub emails_replied: u64,
    pub emails_unsubscribed: u64,
}

impl DeliveryCounters {
    /// Record the first reach of `status` for some (contact, step) pair.
    /// PENDING and QUEUED are bookkeeping states and are not counted.
    pub fn record(&mut self, status: StepStatus) {
        match status {
            StepStatus::Sent => self.emails_sent += 1,
            StepStatus::Delivered => self.emails_delivered += 1,
            StepStatus::Opened => self.emails_opened += 1,
            StepStatus::Clicked => self.emails_clicked += 1,
            StepStatus::Bounced => self.emails_bounced += 1,
            StepStatus::Failed => self.emails_failed += 1,
            StepStatus::Cancelled => self.emails_cancelled += 1,
            StepStatus::Complained => self.emails_complained += 1,
            StepStatus::Replied => self.emails_replied += 1,
            StepStatus::Unsubscribed => self.emails_unsubscribed += 1,
            StepStatus::Pending | StepStatus::Queued => {}
        }
    }
}

/// Step delay stored as whole seconds. The API boundary accepts decimal
/// minutes; converting once at creation avoids floating-point drift when
/// chaining due times across steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepDelay {
    seconds: i64,
}

impl StepDelay {
    pub const ZERO: StepDelay = StepDelay { seconds: 0 };

    pub fn from_minutes(minutes: f64) -> OutreachResult<Self> {
        if !minutes.is_finite() || minutes < 0.0 {
            return Err(OutreachError::Validation(format!(
                "step delay must be a non-negative number of minutes, got {minutes}"
            )));
        }
        Ok(Self {
            seconds: (minutes * 60.0).round() as i64,
        })
    }

    pub fn from_seconds(seconds: i64) -> OutreachResult<Self> {
        if seconds < 0 {
            return Err(OutreachError::Validation(format!(
                "step delay must be non-negative, got {seconds}s"
            )));
        }
        Ok(Self { seconds })
    }

    pub fn as_seconds(&self) -> i64 {
        self.seconds
    }

    pub fn as_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.seconds)
    }
}

/// Tracking settings for a campaign. Explicit struct rather than an open
/// JSON map; unknown keys are rejected at the deserialization boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SequenceSettings {
    pub open_tracking: bool,
    pub click_tracking: bool,
    pub unsubscribe_link: bool,
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            open_tracking: true,
            click_tracking: true,
            unsubscribe_link: true,
        }
    }
}

/// One templated send within a campaign's ordered sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignStep {
    pub id: Uuid,
    pub campaign_id: Uuid,
    /// 1-based, contiguous, unique per campaign.
    pub step_order: u32,
    pub trigger_type: TriggerType,
    /// Required iff `trigger_type` is `Schedule`.
    pub schedule_time: Option<DateTime<Utc>>,
    pub delay: StepDelay,
    /// IANA timezone governing day-boundary clamping.
    pub timezone: String,
    /// Clamp delay-derived due times to the base local day when set.
    pub same_day_window: bool,
    /// Back-reference to an earlier step; never forward or self.
    pub reply_to_step_id: Option<Uuid>,
    /// Required iff `reply_to_step_id` is set.
    pub reply_type: Option<ReplyType>,
    pub template_id: String,
    pub counters: DeliveryCounters,
    pub created_at: DateTime<Utc>,
}

/// A multi-step drip campaign owned by one organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub status: CampaignStatus,
    /// Highest step the scheduler has begun dispatching, 1-based.
    pub current_step: u32,
    pub total_steps: u32,
    pub settings: SequenceSettings,
    pub counters: DeliveryCounters,
    pub steps: Vec<CampaignStep>,
    /// Optimistic-concurrency counter, bumped on every mutation.
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn new(organization_id: Uuid, name: impl Into<String>, settings: SequenceSettings) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id,
            name: name.into(),
            status: CampaignStatus::Draft,
            current_step: 1,
            total_steps: 0,
            settings,
            counters: DeliveryCounters::default(),
            steps: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
            activated_at: None,
            completed_at: None,
        }
    }

    pub fn step(&self, step_id: Uuid) -> Option<&CampaignStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_by_order(&self, step_order: u32) -> Option<&CampaignStep> {
        self.steps.iter().find(|s| s.step_order == step_order)
    }

    /// Steps gated on the given step via `reply_to_step_id`.
    pub fn dependents_of(&self, step_id: Uuid) -> Vec<&CampaignStep> {
        self.steps
            .iter()
            .filter(|s| s.reply_to_step_id == Some(step_id))
            .collect()
    }
}

/// A member of a campaign's resolved recipient list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub email: String,
    /// Attribute map used for template variable substitution.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Contact {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            attributes: HashMap::new(),
        }
    }
}

/// Externally-reported delivery or engagement event, normalized for the
/// reconciler by the webhook/polling collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub contact_id: Uuid,
    pub campaign_id: Uuid,
    pub step_id: Uuid,
    pub event_type: DeliveryEventType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEventType {
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Replied,
    Complained,
    Unsubscribed,
}

impl DeliveryEventType {
    pub fn step_status(&self) -> StepStatus {
        match self {
            Self::Delivered => StepStatus::Delivered,
            Self::Opened => StepStatus::Opened,
            Self::Clicked => StepStatus::Clicked,
            Self::Bounced => StepStatus::Bounced,
            Self::Replied => StepStatus::Replied,
            Self::Complained => StepStatus::Complained,
            Self::Unsubscribed => StepStatus::Unsubscribed,
        }
    }
}
