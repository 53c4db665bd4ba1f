//! Dispatch queue — individual send tasks keyed by idempotency key.
//!
//! The queue contract is at-least-once: tasks are claimed with a
//! conditional status swap, requeued with backoff on transient failure, and
//! released by the stale-claim sweep if a worker dies mid-flight. The
//! idempotency key (campaign, step, contact) makes enqueueing a no-op for
//! duplicates, so concurrent scheduler passes cannot double-enqueue.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Stable identity of one send: a contact receives a step at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub campaign_id: Uuid,
    pub step_id: Uuid,
    pub contact_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created but deferred on quota; promoted by a later scheduler pass.
    Pending,
    /// Ready to claim once `scheduled_for` passes.
    Queued,
    /// Handed to a worker; released by the stale-claim sweep on crash.
    Claimed,
    Sent,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancelled)
    }

    /// States the scheduler/lifecycle may still cancel.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Queued)
    }
}

/// One scheduled send of one step to one contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchTask {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub campaign_id: Uuid,
    pub step_id: Uuid,
    pub step_order: u32,
    pub contact_id: Uuid,
    pub scheduled_for: DateTime<Utc>,
    pub attempt_count: u32,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl DispatchTask {
    pub fn new(
        organization_id: Uuid,
        campaign_id: Uuid,
        step_id: Uuid,
        step_order: u32,
        contact_id: Uuid,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            campaign_id,
            step_id,
            step_order,
            contact_id,
            scheduled_for,
            attempt_count: 0,
            status: TaskStatus::Pending,
            last_error: None,
            created_at: Utc::now(),
            claimed_at: None,
        }
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey {
            campaign_id: self.campaign_id,
            step_id: self.step_id,
            contact_id: self.contact_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created(Uuid),
    Duplicate(Uuid),
}

/// Thread-safe dispatch queue. Ordering is best-effort by `scheduled_for`,
/// not strict FIFO.
pub struct DispatchQueue {
    tasks: DashMap<Uuid, DispatchTask>,
    by_key: DashMap<IdempotencyKey, Uuid>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            by_key: DashMap::new(),
        }
    }

    /// Insert a task unless its idempotency key already exists. The key
    /// entry's shard lock makes concurrent inserts for the same key resolve
    /// to exactly one created task.
    pub fn insert(&self, task: DispatchTask) -> InsertOutcome {
        match self.by_key.entry(task.idempotency_key()) {
            Entry::Occupied(existing) => InsertOutcome::Duplicate(*existing.get()),
            Entry::Vacant(slot) => {
                let id = task.id;
                debug!(
                    task_id = %id,
                    campaign_id = %task.campaign_id,
                    step_order = task.step_order,
                    scheduled_for = %task.scheduled_for,
                    "task enqueued"
                );
                self.tasks.insert(id, task);
                slot.insert(id);
                InsertOutcome::Created(id)
            }
        }
    }

    pub fn get(&self, id: Uuid) -> Option<DispatchTask> {
        self.tasks.get(&id).map(|t| t.clone())
    }

    pub fn task_for_key(&self, key: &IdempotencyKey) -> Option<DispatchTask> {
        self.by_key
            .get(key)
            .and_then(|id| self.tasks.get(&id).map(|t| t.clone()))
    }

    pub fn contains_key(&self, key: &IdempotencyKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Promote a quota-deferred task. Returns `true` if the task moved
    /// PENDING → QUEUED.
    pub fn promote(&self, id: Uuid) -> bool {
        match self.tasks.get_mut(&id) {
            Some(mut task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Queued;
                true
            }
            _ => false,
        }
    }

    /// Claim the earliest due task accepted by `claimable`. The status swap
    /// happens under the task's entry lock; concurrent claimers each take a
    /// different task or none.
    pub fn claim_next(
        &self,
        now: DateTime<Utc>,
        mut claimable: impl FnMut(&DispatchTask) -> bool,
    ) -> Option<DispatchTask> {
        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued && t.scheduled_for <= now)
            .map(|t| (t.scheduled_for, t.id))
            .collect();
        candidates.sort();

        for (_, id) in candidates {
            if let Some(mut task) = self.tasks.get_mut(&id) {
                if task.status == TaskStatus::Queued
                    && task.scheduled_for <= now
                    && claimable(&task)
                {
                    task.status = TaskStatus::Claimed;
                    task.claimed_at = Some(now);
                    task.attempt_count += 1;
                    return Some(task.clone());
                }
            }
        }
        None
    }

    /// Mark a claimed task sent.
    pub fn report_sent(&self, id: Uuid) -> Option<DispatchTask> {
        let mut task = self.tasks.get_mut(&id)?;
        if task.status != TaskStatus::Claimed {
            return None;
        }
        task.status = TaskStatus::Sent;
        Some(task.clone())
    }

    /// Report a failed attempt. `retry_at = Some` requeues with the backoff
    /// due time; `None` marks the task FAILED for good.
    pub fn report_failure(
        &self,
        id: Uuid,
        error: impl Into<String>,
        retry_at: Option<DateTime<Utc>>,
    ) -> Option<DispatchTask> {
        let mut task = self.tasks.get_mut(&id)?;
        if task.status != TaskStatus::Claimed {
            return None;
        }
        task.last_error = Some(error.into());
        task.claimed_at = None;
        match retry_at {
            Some(at) => {
                task.status = TaskStatus::Queued;
                task.scheduled_for = at;
            }
            None => task.status = TaskStatus::Failed,
        }
        Some(task.clone())
    }

    /// Cancel every open task of a campaign. Returns the cancelled tasks so
    /// the caller can count them per step.
    pub fn cancel_open_for_campaign(&self, campaign_id: Uuid) -> Vec<DispatchTask> {
        self.cancel_open_matching(|t| t.campaign_id == campaign_id)
    }

    /// Cancel open tasks of later steps for one contact (terminal-contact
    /// cleanup after bounce/complaint/unsubscribe).
    pub fn cancel_open_for_contact(
        &self,
        campaign_id: Uuid,
        contact_id: Uuid,
        after_step_order: u32,
    ) -> Vec<DispatchTask> {
        self.cancel_open_matching(|t| {
            t.campaign_id == campaign_id
                && t.contact_id == contact_id
                && t.step_order > after_step_order
        })
    }

    fn cancel_open_matching(&self, matches: impl Fn(&DispatchTask) -> bool) -> Vec<DispatchTask> {
        let ids: Vec<Uuid> = self
            .tasks
            .iter()
            .filter(|t| t.status.is_open() && matches(t))
            .map(|t| t.id)
            .collect();

        let mut cancelled = Vec::new();
        for id in ids {
            if let Some(mut task) = self.tasks.get_mut(&id) {
                // Re-check under the entry lock; a worker may have claimed
                // the task since the scan.
                if task.status.is_open() {
                    task.status = TaskStatus::Cancelled;
                    cancelled.push(task.clone());
                }
            }
        }
        if !cancelled.is_empty() {
            info!(count = cancelled.len(), "open tasks cancelled");
        }
        cancelled
    }

    /// Return tasks claimed longer than `timeout` to QUEUED so another
    /// worker can pick them up.
    pub fn release_stale_claims(&self, now: DateTime<Utc>, timeout: Duration) -> usize {
        let mut released = 0usize;
        let ids: Vec<Uuid> = self
            .tasks
            .iter()
            .filter(|t| {
                t.status == TaskStatus::Claimed
                    && t.claimed_at.map(|c| c + timeout <= now).unwrap_or(true)
            })
            .map(|t| t.id)
            .collect();

        for id in ids {
            if let Some(mut task) = self.tasks.get_mut(&id) {
                if task.status == TaskStatus::Claimed
                    && task.claimed_at.map(|c| c + timeout <= now).unwrap_or(true)
                {
                    task.status = TaskStatus::Queued;
                    task.claimed_at = None;
                    released += 1;
                }
            }
        }
        if released > 0 {
            info!(released, "stale claims released");
        }
        released
    }

    /// Quota-deferred tasks awaiting promotion.
    pub fn pending_tasks(&self) -> Vec<DispatchTask> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.clone())
            .collect()
    }

    pub fn tasks_for_campaign(&self, campaign_id: Uuid) -> Vec<DispatchTask> {
        self.tasks
            .iter()
            .filter(|t| t.campaign_id == campaign_id)
            .map(|t| t.clone())
            .collect()
    }

    /// Tasks of the campaign not yet in a terminal state. Completion
    /// requires this to be zero.
    pub fn live_count_for_campaign(&self, campaign_id: Uuid) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.campaign_id == campaign_id && !t.status.is_terminal())
            .count()
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}
