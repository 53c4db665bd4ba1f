//! Engine facade — wires the stores, scheduler, workers, reconciler, and
//! lifecycle controller together and exposes the operations callers outside
//! the core are allowed to use.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use outreach_core::config::AppConfig;
use outreach_core::error::{OutreachError, OutreachResult};
use outreach_core::event_bus::{noop_sink, EventSink};
use outreach_core::types::{
    Campaign, CampaignStatus, CampaignStep, Contact, DeliveryCounters, DeliveryEvent,
    SequenceSettings,
};
use outreach_delivery::{
    DetectionSource, InMemoryTemplateRenderer, LoggingTransport, MailTransport, TemplateRenderer,
};

use crate::eligibility::{EligibilityEvaluator, EligibilityPolicy};
use crate::jobs::{JobsConfig, PeriodicJobs};
use crate::lifecycle::LifecycleController;
use crate::queue::DispatchQueue;
use crate::quota::{PlanSource, QuotaLedger, StaticPlanSource};
use crate::reconciler::{EventReconciler, ReconcileOutcome};
use crate::recipient::RecipientStore;
use crate::scheduler::{SchedulerPassSummary, StepScheduler};
use crate::store::{CampaignStore, NewStep};
use crate::suppression::SuppressionList;
use crate::worker::{DispatchWorker, WorkerConfig};

/// Point-in-time snapshot of a campaign's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignProgress {
    pub campaign_id: Uuid,
    pub status: CampaignStatus,
    pub current_step: u32,
    pub total_steps: u32,
    pub counters: DeliveryCounters,
    pub steps: Vec<StepProgressSummary>,
    pub recipients_total: usize,
    pub recipients_terminal: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProgressSummary {
    pub step_id: Uuid,
    pub step_order: u32,
    pub counters: DeliveryCounters,
    /// Tasks not yet in a terminal state.
    pub open_tasks: usize,
}

/// Builder for [`OutreachEngine`] with development defaults for every
/// collaborator.
pub struct OutreachEngineBuilder {
    config: AppConfig,
    transport: Arc<dyn MailTransport>,
    renderer: Arc<dyn TemplateRenderer>,
    plan: Arc<dyn PlanSource>,
    detection: Option<Arc<dyn DetectionSource>>,
    events: Arc<dyn EventSink>,
}

impl OutreachEngineBuilder {
    pub fn with_transport(mut self, transport: Arc<dyn MailTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_plan_source(mut self, plan: Arc<dyn PlanSource>) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_detection(mut self, detection: Arc<dyn DetectionSource>) -> Self {
        self.detection = Some(detection);
        self
    }

    /// Attach an event sink for emitting engine events.
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> OutreachEngine {
        let store = Arc::new(CampaignStore::new());
        let recipients = Arc::new(RecipientStore::new());
        let suppression = Arc::new(SuppressionList::new());
        let queue = Arc::new(DispatchQueue::new());
        let quota = Arc::new(QuotaLedger::new(self.plan));
        let evaluator = Arc::new(EligibilityEvaluator::new(EligibilityPolicy::from_config(
            &self.config.engine,
        )));

        let scheduler = Arc::new(StepScheduler::new(
            Arc::clone(&store),
            Arc::clone(&recipients),
            Arc::clone(&suppression),
            Arc::clone(&queue),
            Arc::clone(&quota),
            Arc::clone(&evaluator),
            Arc::clone(&self.events),
        ));
        let reconciler = Arc::new(EventReconciler::new(
            Arc::clone(&store),
            Arc::clone(&recipients),
            Arc::clone(&suppression),
            Arc::clone(&queue),
            Arc::clone(&scheduler),
            Arc::clone(&self.events),
        ));
        let lifecycle = Arc::new(LifecycleController::new(
            Arc::clone(&store),
            Arc::clone(&recipients),
            Arc::clone(&queue),
            Arc::clone(&evaluator),
            Arc::clone(&self.events),
        ));
        let worker = Arc::new(DispatchWorker::new(
            Arc::clone(&store),
            Arc::clone(&recipients),
            Arc::clone(&queue),
            self.renderer,
            self.transport,
            Arc::clone(&self.events),
            WorkerConfig::from_app_config(&self.config),
        ));
        let jobs = Arc::new(PeriodicJobs::new(
            Arc::clone(&quota),
            Arc::clone(&lifecycle),
            Arc::clone(&queue),
            Arc::clone(&reconciler),
            self.detection,
            JobsConfig::from_app_config(&self.config),
        ));

        OutreachEngine {
            store,
            recipients,
            suppression,
            queue,
            scheduler,
            reconciler,
            lifecycle,
            worker,
            jobs,
        }
    }
}

/// Core orchestration engine — campaigns in, scheduled quota-aware sends
/// out.
#[derive(Clone)]
pub struct OutreachEngine {
    store: Arc<CampaignStore>,
    recipients: Arc<RecipientStore>,
    suppression: Arc<SuppressionList>,
    queue: Arc<DispatchQueue>,
    scheduler: Arc<StepScheduler>,
    reconciler: Arc<EventReconciler>,
    lifecycle: Arc<LifecycleController>,
    worker: Arc<DispatchWorker>,
    jobs: Arc<PeriodicJobs>,
}

impl std::fmt::Debug for OutreachEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutreachEngine")
            .field("campaigns", &self.store.list().len())
            .finish()
    }
}

impl OutreachEngine {
    pub fn builder(config: AppConfig) -> OutreachEngineBuilder {
        let plan = Arc::new(StaticPlanSource::new(config.quota.default_daily_limit));
        OutreachEngineBuilder {
            config,
            transport: Arc::new(LoggingTransport),
            renderer: Arc::new(InMemoryTemplateRenderer::new()),
            plan,
            detection: None,
            events: noop_sink(),
        }
    }

    // ── Campaign construction ────────────────────────────────────────────

    pub fn create_campaign(
        &self,
        organization_id: Uuid,
        name: impl Into<String>,
        settings: SequenceSettings,
    ) -> Campaign {
        self.store.create_campaign(organization_id, name, settings)
    }

    pub fn add_step(&self, campaign_id: Uuid, step: NewStep) -> OutreachResult<CampaignStep> {
        self.store.add_step(campaign_id, step)
    }

    pub fn set_roster(&self, campaign_id: Uuid, contacts: Vec<Contact>) -> OutreachResult<()> {
        self.store.set_roster(campaign_id, contacts)
    }

    // ── Lifecycle commands ───────────────────────────────────────────────

    pub fn activate_campaign(&self, campaign_id: Uuid, now: DateTime<Utc>) -> OutreachResult<()> {
        self.lifecycle.activate(campaign_id, now)
    }

    pub fn pause_campaign(&self, campaign_id: Uuid) -> OutreachResult<()> {
        self.lifecycle.pause(campaign_id)
    }

    pub fn resume_campaign(&self, campaign_id: Uuid) -> OutreachResult<()> {
        self.lifecycle.resume(campaign_id)
    }

    pub fn cancel_campaign(&self, campaign_id: Uuid, now: DateTime<Utc>) -> OutreachResult<()> {
        self.lifecycle.cancel(campaign_id, now)
    }

    // ── Event ingestion ──────────────────────────────────────────────────

    pub fn report_delivery_event(
        &self,
        event: &DeliveryEvent,
        now: DateTime<Utc>,
    ) -> OutreachResult<ReconcileOutcome> {
        self.reconciler.apply(event, now)
    }

    // ── Progress ─────────────────────────────────────────────────────────

    pub fn get_campaign_progress(&self, campaign_id: Uuid) -> OutreachResult<CampaignProgress> {
        let campaign = self
            .store
            .get(campaign_id)
            .ok_or_else(|| OutreachError::not_found("campaign", campaign_id))?;

        let tasks = self.queue.tasks_for_campaign(campaign_id);
        let steps = campaign
            .steps
            .iter()
            .map(|step| StepProgressSummary {
                step_id: step.id,
                step_order: step.step_order,
                counters: step.counters,
                open_tasks: tasks
                    .iter()
                    .filter(|t| t.step_id == step.id && !t.status.is_terminal())
                    .count(),
            })
            .collect();

        let rows = self.recipients.rows_for_campaign(campaign_id);
        Ok(CampaignProgress {
            campaign_id,
            status: campaign.status,
            current_step: campaign.current_step,
            total_steps: campaign.total_steps,
            counters: campaign.counters,
            steps,
            recipients_total: rows.len(),
            recipients_terminal: rows.iter().filter(|r| r.terminal).count(),
        })
    }

    // ── Execution entry points (driven by the binary / tests) ────────────

    pub fn run_scheduler_pass(&self, now: DateTime<Utc>) -> SchedulerPassSummary {
        self.scheduler.run_pass(now)
    }

    pub fn process_dispatches(&self, now: DateTime<Utc>) -> usize {
        self.worker.process_available(now)
    }

    pub fn jobs(&self) -> Arc<PeriodicJobs> {
        Arc::clone(&self.jobs)
    }

    pub fn suppression(&self) -> Arc<SuppressionList> {
        Arc::clone(&self.suppression)
    }
}
