//! Recipient state store — per (campaign, contact) progress records.
//!
//! Each step's status is a high-water mark with first-reach timestamps per
//! status. The reconciler owns writes; the scheduler and lifecycle
//! controller read. Rows are created lazily on first eligibility and never
//! deleted while the campaign exists.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use outreach_core::types::StepStatus;

/// Outcome of applying a status to a recipient-step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// First reach of this status; the caller must record the matching
    /// counter increment.
    Applied,
    /// Duplicate or absorbed event; state unchanged, nothing to count.
    Conflict,
}

/// Progress of one contact through one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProgress {
    pub status: StepStatus,
    /// First-reach timestamp per status ever observed for this step. Feeds
    /// due-time chaining and keeps counting idempotent under replays.
    pub reached: HashMap<StepStatus, DateTime<Utc>>,
}

impl StepProgress {
    fn new() -> Self {
        Self {
            status: StepStatus::Pending,
            reached: HashMap::new(),
        }
    }

    pub fn has_reached(&self, status: StepStatus) -> bool {
        self.reached.contains_key(&status)
    }

    pub fn reached_at(&self, status: StepStatus) -> Option<DateTime<Utc>> {
        self.reached.get(&status).copied()
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.reached_at(StepStatus::Sent)
    }

    /// Apply `status` as of `at`. State advances monotonically: the linear
    /// chain never regresses, terminal states absorb everything after them,
    /// and a status already reached is a conflict regardless of ordering.
    /// An out-of-order chain event behind the high-water mark (DELIVERED
    /// after OPENED) is still recorded and counted once without moving the
    /// mark backward.
    pub fn apply(&mut self, status: StepStatus, at: DateTime<Utc>) -> Advance {
        if self.has_reached(status) {
            return Advance::Conflict;
        }
        if self.status.is_terminal() {
            return Advance::Conflict;
        }

        match (status.chain_rank(), self.status.chain_rank()) {
            (Some(rank), Some(current_rank)) => {
                self.reached.insert(status, at);
                if rank > current_rank {
                    self.status = status;
                }
                Advance::Applied
            }
            (None, _) => {
                self.reached.insert(status, at);
                self.status = status;
                Advance::Applied
            }
            // Unreachable: a terminal current state already returned above.
            (Some(_), None) => Advance::Conflict,
        }
    }
}

/// Progress of one contact through one campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientProgress {
    pub campaign_id: Uuid,
    pub contact_id: Uuid,
    /// Highest step this contact has entered, 1-based.
    pub current_step_order: u32,
    /// Set on bounce/complaint/unsubscribe: no further steps of this
    /// campaign for this contact.
    pub terminal: bool,
    pub steps: HashMap<u32, StepProgress>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecipientProgress {
    fn new(campaign_id: Uuid, contact_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            campaign_id,
            contact_id,
            current_step_order: 0,
            terminal: false,
            steps: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, step_order: u32) -> Option<&StepProgress> {
        self.steps.get(&step_order)
    }
}

/// Thread-safe store of recipient progress rows keyed by (campaign, contact).
pub struct RecipientStore {
    rows: DashMap<(Uuid, Uuid), RecipientProgress>,
}

impl RecipientStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }

    /// Apply `status` to the (campaign, contact, step) record, creating the
    /// row lazily. The row's entry lock serializes concurrent updates for
    /// the same recipient.
    pub fn apply(
        &self,
        campaign_id: Uuid,
        contact_id: Uuid,
        step_order: u32,
        status: StepStatus,
        at: DateTime<Utc>,
    ) -> Advance {
        let mut row = self
            .rows
            .entry((campaign_id, contact_id))
            .or_insert_with(|| RecipientProgress::new(campaign_id, contact_id));

        let advance = row
            .steps
            .entry(step_order)
            .or_insert_with(StepProgress::new)
            .apply(status, at);

        if advance == Advance::Applied {
            row.current_step_order = row.current_step_order.max(step_order);
            row.updated_at = Utc::now();
            if status.is_campaign_terminal() {
                row.terminal = true;
            }
        }
        advance
    }

    /// Mark the contact terminal for the campaign without touching any
    /// step record.
    pub fn mark_terminal(&self, campaign_id: Uuid, contact_id: Uuid) {
        let mut row = self
            .rows
            .entry((campaign_id, contact_id))
            .or_insert_with(|| RecipientProgress::new(campaign_id, contact_id));
        row.terminal = true;
        row.updated_at = Utc::now();
    }

    pub fn is_terminal(&self, campaign_id: Uuid, contact_id: Uuid) -> bool {
        self.rows
            .get(&(campaign_id, contact_id))
            .map(|r| r.terminal)
            .unwrap_or(false)
    }

    pub fn progress(&self, campaign_id: Uuid, contact_id: Uuid) -> Option<RecipientProgress> {
        self.rows.get(&(campaign_id, contact_id)).map(|r| r.clone())
    }

    pub fn step_progress(
        &self,
        campaign_id: Uuid,
        contact_id: Uuid,
        step_order: u32,
    ) -> Option<StepProgress> {
        self.rows
            .get(&(campaign_id, contact_id))
            .and_then(|r| r.step(step_order).cloned())
    }

    pub fn rows_for_campaign(&self, campaign_id: Uuid) -> Vec<RecipientProgress> {
        self.rows
            .iter()
            .filter(|r| r.key().0 == campaign_id)
            .map(|r| r.value().clone())
            .collect()
    }
}

impl Default for RecipientStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(offset_mins: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .expect("fixed timestamp")
            .with_timezone(&Utc)
            + Duration::minutes(offset_mins)
    }

    #[test]
    fn test_monotonic_advance() {
        let mut progress = StepProgress::new();
        assert_eq!(progress.apply(StepStatus::Queued, at(0)), Advance::Applied);
        assert_eq!(progress.apply(StepStatus::Sent, at(1)), Advance::Applied);
        assert_eq!(progress.apply(StepStatus::Delivered, at(2)), Advance::Applied);
        assert_eq!(progress.status, StepStatus::Delivered);

        // Replay is a conflict.
        assert_eq!(progress.apply(StepStatus::Delivered, at(3)), Advance::Conflict);
        assert_eq!(progress.reached_at(StepStatus::Delivered), Some(at(2)));
    }

    #[test]
    fn test_out_of_order_does_not_regress() {
        let mut progress = StepProgress::new();
        progress.apply(StepStatus::Sent, at(0));
        // OPENED arrives before DELIVERED.
        assert_eq!(progress.apply(StepStatus::Opened, at(5)), Advance::Applied);
        assert_eq!(progress.status, StepStatus::Opened);

        // Late DELIVERED is recorded once but the mark stays at OPENED.
        assert_eq!(progress.apply(StepStatus::Delivered, at(6)), Advance::Applied);
        assert_eq!(progress.status, StepStatus::Opened);
        assert!(progress.has_reached(StepStatus::Delivered));

        // A replay of the late event is discarded.
        assert_eq!(progress.apply(StepStatus::Delivered, at(7)), Advance::Conflict);
    }

    #[test]
    fn test_terminal_absorbs() {
        let mut progress = StepProgress::new();
        progress.apply(StepStatus::Sent, at(0));
        assert_eq!(progress.apply(StepStatus::Bounced, at(1)), Advance::Applied);
        assert_eq!(progress.status, StepStatus::Bounced);

        // Nothing moves a terminal step.
        assert_eq!(progress.apply(StepStatus::Opened, at(2)), Advance::Conflict);
        assert_eq!(progress.apply(StepStatus::Unsubscribed, at(3)), Advance::Conflict);
        assert_eq!(progress.status, StepStatus::Bounced);
    }

    #[test]
    fn test_store_marks_campaign_terminal() {
        let store = RecipientStore::new();
        let campaign = Uuid::new_v4();
        let contact = Uuid::new_v4();

        store.apply(campaign, contact, 1, StepStatus::Sent, at(0));
        assert!(!store.is_terminal(campaign, contact));

        store.apply(campaign, contact, 1, StepStatus::Bounced, at(1));
        assert!(store.is_terminal(campaign, contact));
    }

    #[test]
    fn test_lazy_row_creation_and_step_tracking() {
        let store = RecipientStore::new();
        let campaign = Uuid::new_v4();
        let contact = Uuid::new_v4();

        assert!(store.progress(campaign, contact).is_none());
        store.apply(campaign, contact, 1, StepStatus::Queued, at(0));
        store.apply(campaign, contact, 2, StepStatus::Queued, at(10));

        let row = store.progress(campaign, contact).unwrap();
        assert_eq!(row.current_step_order, 2);
        assert_eq!(row.step(1).unwrap().status, StepStatus::Queued);
    }
}
