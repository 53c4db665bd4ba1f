//! Quota ledger — per-organization daily send counts against plan limits.
//!
//! `check_and_reserve` is a single increment-if-below-limit under the
//! organization's ledger entry lock; concurrent callers for the same
//! organization serialize there. The nightly reset is idempotent, keyed by
//! the period date.

use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Supplies the per-organization daily limit. `None` means unlimited.
pub trait PlanSource: Send + Sync {
    fn daily_email_limit(&self, organization_id: Uuid) -> Option<u64>;
}

/// Plan source backed by a static map plus an optional fallback limit.
#[derive(Default)]
pub struct StaticPlanSource {
    limits: DashMap<Uuid, u64>,
    default_limit: Option<u64>,
}

impl StaticPlanSource {
    pub fn new(default_limit: Option<u64>) -> Self {
        Self {
            limits: DashMap::new(),
            default_limit,
        }
    }

    pub fn set_limit(&self, organization_id: Uuid, limit: u64) {
        self.limits.insert(organization_id, limit);
    }
}

impl PlanSource for StaticPlanSource {
    fn daily_email_limit(&self, organization_id: Uuid) -> Option<u64> {
        self.limits
            .get(&organization_id)
            .map(|l| *l)
            .or(self.default_limit)
    }
}

/// Result of a reservation attempt. A denied reservation is a deferral
/// signal, not an error: the task stays pending until the period resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub granted: bool,
    /// Sends left in the period after this decision; `None` when unlimited.
    pub remaining: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub organization_id: Uuid,
    pub period: NaiveDate,
    pub emails_sent_in_period: u64,
}

/// Thread-safe quota ledger.
pub struct QuotaLedger {
    records: DashMap<Uuid, QuotaRecord>,
    plan: Arc<dyn PlanSource>,
}

impl QuotaLedger {
    pub fn new(plan: Arc<dyn PlanSource>) -> Self {
        Self {
            records: DashMap::new(),
            plan,
        }
    }

    /// Atomically reserve `count` sends for `organization_id` in `period`.
    /// A record still carrying an older period rolls over to `period` with a
    /// zero count before the check (covers a missed nightly reset).
    pub fn check_and_reserve(
        &self,
        organization_id: Uuid,
        count: u64,
        period: NaiveDate,
    ) -> QuotaDecision {
        let mut record = self
            .records
            .entry(organization_id)
            .or_insert_with(|| QuotaRecord {
                organization_id,
                period,
                emails_sent_in_period: 0,
            });

        if record.period != period {
            record.period = period;
            record.emails_sent_in_period = 0;
        }

        match self.plan.daily_email_limit(organization_id) {
            None => {
                record.emails_sent_in_period += count;
                QuotaDecision {
                    granted: true,
                    remaining: None,
                }
            }
            Some(limit) => {
                if record.emails_sent_in_period + count <= limit {
                    record.emails_sent_in_period += count;
                    QuotaDecision {
                        granted: true,
                        remaining: Some(limit - record.emails_sent_in_period),
                    }
                } else {
                    debug!(
                        %organization_id,
                        limit,
                        sent = record.emails_sent_in_period,
                        "quota exhausted, deferring"
                    );
                    QuotaDecision {
                        granted: false,
                        remaining: Some(limit.saturating_sub(record.emails_sent_in_period)),
                    }
                }
            }
        }
    }

    /// Nightly reset: zero every record for the new `period`. Re-running for
    /// the same period is a no-op per record, so a reset that dies mid-run
    /// can simply be invoked again.
    pub fn reset_all(&self, period: NaiveDate) -> usize {
        let mut reset = 0usize;
        for mut record in self.records.iter_mut() {
            if record.period != period {
                record.period = period;
                record.emails_sent_in_period = 0;
                reset += 1;
            }
        }
        if reset > 0 {
            info!(%period, reset, "quota ledger reset");
        }
        reset
    }

    pub fn sent_in_period(&self, organization_id: Uuid, period: NaiveDate) -> u64 {
        self.records
            .get(&organization_id)
            .filter(|r| r.period == period)
            .map(|r| r.emails_sent_in_period)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).expect("valid date")
    }

    fn ledger_with_limit(org: Uuid, limit: u64) -> QuotaLedger {
        let plan = Arc::new(StaticPlanSource::new(None));
        plan.set_limit(org, limit);
        QuotaLedger::new(plan)
    }

    #[test]
    fn test_reserve_until_exhausted() {
        let org = Uuid::new_v4();
        let ledger = ledger_with_limit(org, 100);

        for _ in 0..100 {
            assert!(ledger.check_and_reserve(org, 1, day(1)).granted);
        }
        let decision = ledger.check_and_reserve(org, 1, day(1));
        assert!(!decision.granted);
        assert_eq!(decision.remaining, Some(0));
    }

    #[test]
    fn test_reset_allows_reserving_again() {
        let org = Uuid::new_v4();
        let ledger = ledger_with_limit(org, 100);

        for _ in 0..100 {
            ledger.check_and_reserve(org, 1, day(1));
        }
        assert!(!ledger.check_and_reserve(org, 1, day(1)).granted);

        assert_eq!(ledger.reset_all(day(2)), 1);
        // Idempotent: the second run touches nothing.
        assert_eq!(ledger.reset_all(day(2)), 0);

        let decision = ledger.check_and_reserve(org, 1, day(2));
        assert!(decision.granted);
        assert_eq!(decision.remaining, Some(99));
    }

    #[test]
    fn test_absent_limit_is_unlimited() {
        let org = Uuid::new_v4();
        let ledger = QuotaLedger::new(Arc::new(StaticPlanSource::new(None)));

        for _ in 0..10_000 {
            assert!(ledger.check_and_reserve(org, 1, day(1)).granted);
        }
        assert_eq!(ledger.sent_in_period(org, day(1)), 10_000);
    }

    #[test]
    fn test_period_rollover_without_reset() {
        let org = Uuid::new_v4();
        let ledger = ledger_with_limit(org, 2);

        ledger.check_and_reserve(org, 2, day(1));
        assert!(!ledger.check_and_reserve(org, 1, day(1)).granted);
        // A reservation for the next day rolls the record over lazily.
        assert!(ledger.check_and_reserve(org, 1, day(2)).granted);
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_limit() {
        let org = Uuid::new_v4();
        let ledger = Arc::new(ledger_with_limit(org, 50));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    let mut granted = 0u64;
                    for _ in 0..20 {
                        if ledger.check_and_reserve(org, 1, day(1)).granted {
                            granted += 1;
                        }
                    }
                    granted
                })
            })
            .collect();

        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(ledger.sent_in_period(org, day(1)), 50);
    }
}
