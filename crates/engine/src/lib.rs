//! Campaign execution engine — turns a campaign and its ordered steps into
//! a stream of individually-scheduled, quota-aware, retryable email sends,
//! tracks per-recipient progress, and reconciles counters under concurrent
//! delivery-event updates.

pub mod eligibility;
pub mod engine;
pub mod jobs;
pub mod lifecycle;
pub mod queue;
pub mod quota;
pub mod reconciler;
pub mod recipient;
pub mod scheduler;
pub mod store;
pub mod suppression;
pub mod worker;

pub use eligibility::{Eligibility, EligibilityEvaluator, EligibilityPolicy};
pub use engine::{CampaignProgress, OutreachEngine, OutreachEngineBuilder};
pub use jobs::PeriodicJobs;
pub use lifecycle::LifecycleController;
pub use queue::{DispatchQueue, DispatchTask, TaskStatus};
pub use quota::{PlanSource, QuotaDecision, QuotaLedger, StaticPlanSource};
pub use reconciler::{EventReconciler, ReconcileOutcome};
pub use recipient::RecipientStore;
pub use scheduler::StepScheduler;
pub use store::{CampaignStore, NewStep};
pub use suppression::{SuppressionList, SuppressionReason};
pub use worker::DispatchWorker;
