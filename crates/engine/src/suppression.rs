//! Organization-wide suppression — do-not-contact registry for recipients
//! who unsubscribed or filed a spam complaint. Suppressed contacts are
//! excluded from every step of every campaign in the organization.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reason a contact was added to the suppression list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    Unsubscribed,
    Complained,
    AdminAction,
}

/// A single suppression record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub contact_id: Uuid,
    pub reason: SuppressionReason,
    pub created_at: DateTime<Utc>,
}

/// Thread-safe per-organization suppression list.
pub struct SuppressionList {
    /// Map from (organization, contact) -> entry. The first reason wins;
    /// re-suppressing an already-suppressed contact is a no-op.
    entries: DashMap<(Uuid, Uuid), SuppressionEntry>,
}

impl SuppressionList {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Suppress `contact_id` for the whole organization. Returns `true` if
    /// this call created the entry.
    pub fn add(&self, organization_id: Uuid, contact_id: Uuid, reason: SuppressionReason) -> bool {
        let mut created = false;
        self.entries
            .entry((organization_id, contact_id))
            .or_insert_with(|| {
                created = true;
                SuppressionEntry {
                    id: Uuid::new_v4(),
                    organization_id,
                    contact_id,
                    reason,
                    created_at: Utc::now(),
                }
            });

        if created {
            tracing::info!(
                %organization_id,
                %contact_id,
                ?reason,
                "suppression entry added"
            );
        }
        created
    }

    pub fn is_suppressed(&self, organization_id: Uuid, contact_id: Uuid) -> bool {
        self.entries.contains_key(&(organization_id, contact_id))
    }

    /// Remove a suppression (admin re-subscribe). Returns `true` if an entry
    /// was removed.
    pub fn remove(&self, organization_id: Uuid, contact_id: Uuid) -> bool {
        self.entries.remove(&(organization_id, contact_id)).is_some()
    }

    pub fn entries_for_org(&self, organization_id: Uuid) -> Vec<SuppressionEntry> {
        self.entries
            .iter()
            .filter(|e| e.key().0 == organization_id)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for SuppressionList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_check() {
        let list = SuppressionList::new();
        let org = Uuid::new_v4();
        let contact = Uuid::new_v4();

        assert!(!list.is_suppressed(org, contact));
        assert!(list.add(org, contact, SuppressionReason::Unsubscribed));
        assert!(list.is_suppressed(org, contact));

        // Scoped to the organization.
        assert!(!list.is_suppressed(Uuid::new_v4(), contact));
    }

    #[test]
    fn test_first_reason_wins() {
        let list = SuppressionList::new();
        let org = Uuid::new_v4();
        let contact = Uuid::new_v4();

        assert!(list.add(org, contact, SuppressionReason::Complained));
        assert!(!list.add(org, contact, SuppressionReason::Unsubscribed));

        let entries = list.entries_for_org(org);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, SuppressionReason::Complained);
    }

    #[test]
    fn test_remove() {
        let list = SuppressionList::new();
        let org = Uuid::new_v4();
        let contact = Uuid::new_v4();

        list.add(org, contact, SuppressionReason::AdminAction);
        assert!(list.remove(org, contact));
        assert!(!list.is_suppressed(org, contact));
        assert!(!list.remove(org, contact));
    }
}
