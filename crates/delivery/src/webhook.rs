//! Provider webhook normalization — maps raw email-provider events onto the
//! reconciler's `DeliveryEvent` vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use outreach_core::types::{DeliveryEvent, DeliveryEventType};

/// Raw webhook event as the provider reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailWebhookEvent {
    pub event: EmailEventType,
    pub email: String,
    pub timestamp: DateTime<Utc>,
    /// Custom args echoed back by the provider from the original send.
    pub campaign_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailEventType {
    Processed,
    Delivered,
    Open,
    Click,
    Bounce,
    Dropped,
    SpamReport,
    Unsubscribe,
    GroupUnsubscribe,
}

impl EmailEventType {
    fn delivery_event_type(&self) -> Option<DeliveryEventType> {
        match self {
            Self::Delivered => Some(DeliveryEventType::Delivered),
            Self::Open => Some(DeliveryEventType::Opened),
            Self::Click => Some(DeliveryEventType::Clicked),
            Self::Bounce | Self::Dropped => Some(DeliveryEventType::Bounced),
            Self::SpamReport => Some(DeliveryEventType::Complained),
            Self::Unsubscribe | Self::GroupUnsubscribe => Some(DeliveryEventType::Unsubscribed),
            // Provider-internal processing milestone, not a recipient state.
            Self::Processed => None,
        }
    }
}

/// Normalize a provider webhook into a reconciler event. Returns `None` for
/// events that carry no recipient state or lack the custom args linking
/// them back to a (campaign, step, contact).
pub fn normalize(event: &EmailWebhookEvent) -> Option<DeliveryEvent> {
    let event_type = event.event.delivery_event_type()?;

    let (Some(campaign_id), Some(step_id), Some(contact_id)) =
        (event.campaign_id, event.step_id, event.contact_id)
    else {
        warn!(
            event = ?event.event,
            email = %event.email,
            "webhook event missing custom args, skipping"
        );
        return None;
    };

    metrics::counter!(
        "outreach.webhook_events",
        "type" => format!("{:?}", event.event)
    )
    .increment(1);

    Some(DeliveryEvent {
        contact_id,
        campaign_id,
        step_id,
        event_type,
        timestamp: event.timestamp,
    })
}
