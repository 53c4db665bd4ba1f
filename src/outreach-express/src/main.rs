//! Outreach Express — multi-tenant email outreach platform.
//!
//! Main entry point that initializes the execution engine and drives the
//! scheduler, dispatch workers, and periodic jobs.

use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};
use uuid::Uuid;

use outreach_core::config::AppConfig;
use outreach_core::types::{Contact, ReplyType, SequenceSettings};
use outreach_delivery::templates::EmailTemplate;
use outreach_delivery::InMemoryTemplateRenderer;
use outreach_engine::{NewStep, OutreachEngine};

#[derive(Parser, Debug)]
#[command(name = "outreach-express")]
#[command(about = "Multi-tenant email outreach platform")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "OUTREACH__NODE_ID")]
    node_id: Option<String>,

    /// Scheduler pass interval in seconds (overrides config)
    #[arg(long, env = "OUTREACH__ENGINE__SCHEDULER_INTERVAL_SECS")]
    scheduler_interval_secs: Option<u64>,

    /// Number of dispatch worker loops (overrides config)
    #[arg(long, env = "OUTREACH__DELIVERY__WORKER_COUNT")]
    workers: Option<usize>,

    /// Seed a demo campaign and activate it
    #[arg(long, default_value_t = false)]
    demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outreach_express=info,outreach_engine=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Outreach Express starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(interval) = cli.scheduler_interval_secs {
        config.engine.scheduler_interval_secs = interval;
    }
    if let Some(workers) = cli.workers {
        config.delivery.worker_count = workers;
    }

    info!(
        node_id = %config.node_id,
        scheduler_interval_secs = config.engine.scheduler_interval_secs,
        workers = config.delivery.worker_count,
        "Configuration loaded"
    );

    let renderer = Arc::new(InMemoryTemplateRenderer::new());
    if cli.demo {
        register_demo_templates(&renderer);
    }

    let scheduler_interval = config.engine.scheduler_interval_secs;
    let worker_count = config.delivery.worker_count;

    let engine = OutreachEngine::builder(config)
        .with_renderer(renderer)
        .build();

    if cli.demo {
        seed_demo_campaign(&engine)?;
    }

    // Scheduler loop
    let scheduler_engine = engine.clone();
    tokio::spawn(async move {
        let mut tick =
            tokio::time::interval(std::time::Duration::from_secs(scheduler_interval.max(1)));
        loop {
            tick.tick().await;
            scheduler_engine.run_scheduler_pass(Utc::now());
        }
    });

    // Dispatch worker loops
    for worker_id in 0..worker_count {
        let worker_engine = engine.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tick.tick().await;
                let processed = worker_engine.process_dispatches(Utc::now());
                if processed > 0 {
                    tracing::debug!(worker_id, processed, "dispatch batch complete");
                }
            }
        });
    }

    // Periodic jobs (single instance)
    tokio::spawn(engine.jobs().run());

    info!("Outreach Express running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}

fn register_demo_templates(renderer: &InMemoryTemplateRenderer) {
    renderer.register(EmailTemplate {
        id: "welcome".into(),
        subject: "Welcome aboard, {{first_name}}!".into(),
        body: "Hi {{first_name}}, thanks for signing up.".into(),
    });
    renderer.register(EmailTemplate {
        id: "case_study".into(),
        subject: "How teams like yours use us".into(),
        body: "Hi {{first_name}}, since you had a look, here is a case study.".into(),
    });
    renderer.register(EmailTemplate {
        id: "final_nudge".into(),
        subject: "Anything we can help with?".into(),
        body: "Hi {{first_name}}, just checking in one last time.".into(),
    });
}

/// Seeds a three-step drip campaign: welcome, a case study gated on opening
/// the welcome email, and a final nudge.
fn seed_demo_campaign(engine: &OutreachEngine) -> anyhow::Result<()> {
    let organization_id = Uuid::new_v4();
    let campaign = engine.create_campaign(
        organization_id,
        "Demo Onboarding Drip",
        SequenceSettings::default(),
    );

    let welcome = engine.add_step(campaign.id, NewStep::immediate(0.0, "welcome"))?;
    engine.add_step(
        campaign.id,
        NewStep::immediate(60.0, "case_study").gated_on(welcome.id, ReplyType::Opened),
    )?;
    engine.add_step(campaign.id, NewStep::immediate(24.0 * 60.0, "final_nudge"))?;

    let roster: Vec<Contact> = ["ada", "grace", "edsger"]
        .iter()
        .map(|name| {
            let mut contact = Contact::new(format!("{name}@example.com"));
            contact
                .attributes
                .insert("first_name".to_string(), name.to_string());
            contact
        })
        .collect();
    engine.set_roster(campaign.id, roster)?;
    engine.activate_campaign(campaign.id, Utc::now())?;

    info!(campaign_id = %campaign.id, "demo campaign seeded and activated");
    Ok(())
}
