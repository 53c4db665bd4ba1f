//! Unified event bus — trait for emitting engine events from any module.
//!
//! Components accept an `Arc<dyn EventSink>` to emit lifecycle, dispatch,
//! and reconciliation events toward analytics and customer webhooks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// What happened inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineEventKind {
    CampaignActivated,
    CampaignPaused,
    CampaignResumed,
    CampaignCancelled,
    CampaignCompleted,
    TaskEnqueued,
    TaskDeferred,
    TaskCancelled,
    EmailSent,
    EmailFailed,
    DeliveryEventApplied,
    ContactSuppressed,
}

/// A single engine event routed to the configured sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_id: Uuid,
    pub kind: EngineEventKind,
    pub campaign_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting engine events. Implementations route events to the
/// analytics pipeline, message bus, or customer webhooks.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// No-op sink for tests and modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_kind(&self, kind: EngineEventKind) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Convenience builder for creating `EngineEvent` with minimal boilerplate.
pub fn make_event(
    kind: EngineEventKind,
    campaign_id: Option<Uuid>,
    step_id: Option<Uuid>,
    contact_id: Option<Uuid>,
) -> EngineEvent {
    EngineEvent {
        event_id: Uuid::new_v4(),
        kind,
        campaign_id,
        step_id,
        contact_id,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
