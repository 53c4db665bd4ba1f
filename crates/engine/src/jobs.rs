//! Periodic jobs — single-instance, time-triggered drivers: quota reset,
//! completion sweep, bounce/reply detection sweep, stale-claim sweep.
//!
//! Each entry point is safe under accidental double invocation: the work it
//! delegates to is idempotent (period-keyed reset, re-entrant completion
//! check, conditional status swaps), so a second concurrent caller degrades
//! to a no-op rather than corrupting state.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{info, warn};

use outreach_core::config::AppConfig;
use outreach_delivery::DetectionSource;

use crate::lifecycle::LifecycleController;
use crate::queue::DispatchQueue;
use crate::quota::QuotaLedger;
use crate::reconciler::EventReconciler;

#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub completion_sweep_interval_secs: u64,
    pub stale_claim_timeout_secs: u64,
    /// `None` disables the detection sweep.
    pub detection_interval_secs: Option<u64>,
}

impl JobsConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            completion_sweep_interval_secs: config.engine.completion_sweep_interval_secs,
            stale_claim_timeout_secs: config.engine.stale_claim_timeout_secs,
            detection_interval_secs: config.detection.sweep_interval_secs,
        }
    }
}

pub struct PeriodicJobs {
    quota: Arc<QuotaLedger>,
    lifecycle: Arc<LifecycleController>,
    queue: Arc<DispatchQueue>,
    reconciler: Arc<EventReconciler>,
    detection: Option<Arc<dyn DetectionSource>>,
    config: JobsConfig,
}

impl PeriodicJobs {
    pub fn new(
        quota: Arc<QuotaLedger>,
        lifecycle: Arc<LifecycleController>,
        queue: Arc<DispatchQueue>,
        reconciler: Arc<EventReconciler>,
        detection: Option<Arc<dyn DetectionSource>>,
        config: JobsConfig,
    ) -> Self {
        Self {
            quota,
            lifecycle,
            queue,
            reconciler,
            detection,
            config,
        }
    }

    /// Roll every quota record over to `period`. Records already on the
    /// period are untouched, so invoking this every minute implements the
    /// UTC-midnight reset lazily and re-runnably.
    pub fn run_quota_reset(&self, period: NaiveDate) -> usize {
        self.quota.reset_all(period)
    }

    pub fn run_completion_sweep(&self, now: DateTime<Utc>) -> usize {
        self.lifecycle.completion_sweep(now)
    }

    pub fn run_stale_claim_sweep(&self, now: DateTime<Utc>) -> usize {
        self.queue.release_stale_claims(
            now,
            Duration::seconds(self.config.stale_claim_timeout_secs as i64),
        )
    }

    /// Drain the polling detection source into the reconciler. A no-op when
    /// detection is disabled or absent.
    pub fn run_detection_sweep(&self, now: DateTime<Utc>) -> usize {
        let Some(source) = &self.detection else {
            return 0;
        };
        if self.config.detection_interval_secs.is_none() {
            return 0;
        }

        let mut applied = 0;
        for event in source.poll() {
            match self.reconciler.apply(&event, now) {
                Ok(_) => applied += 1,
                Err(e) => {
                    warn!(
                        campaign_id = %event.campaign_id,
                        error = %e,
                        "detection event failed to apply"
                    );
                }
            }
        }
        applied
    }

    /// Drive all jobs on their configured intervals until the task is
    /// aborted. Deploy one instance of this loop.
    pub async fn run(self: Arc<Self>) {
        info!(
            completion_interval = self.config.completion_sweep_interval_secs,
            detection_interval = ?self.config.detection_interval_secs,
            "periodic jobs started"
        );

        let mut quota_tick = tokio::time::interval(std::time::Duration::from_secs(60));
        let mut completion_tick = tokio::time::interval(std::time::Duration::from_secs(
            self.config.completion_sweep_interval_secs.max(1),
        ));
        let mut stale_tick = tokio::time::interval(std::time::Duration::from_secs(
            (self.config.stale_claim_timeout_secs / 2).max(60),
        ));
        let detection_enabled = self.detection.is_some() && self.config.detection_interval_secs.is_some();
        let mut detection_tick = tokio::time::interval(std::time::Duration::from_secs(
            self.config.detection_interval_secs.unwrap_or(86_400).max(1),
        ));

        loop {
            tokio::select! {
                _ = quota_tick.tick() => {
                    self.run_quota_reset(Utc::now().date_naive());
                }
                _ = completion_tick.tick() => {
                    self.run_completion_sweep(Utc::now());
                }
                _ = stale_tick.tick() => {
                    self.run_stale_claim_sweep(Utc::now());
                }
                _ = detection_tick.tick(), if detection_enabled => {
                    self.run_detection_sweep(Utc::now());
                }
            }
        }
    }
}
