//! Bounce/reply detection — polling fallback for organizations whose
//! provider offers no webhooks. The sweep synthesizes reconciler events from
//! mailbox scans; it is optional, and its absence must not affect
//! webhook-driven correctness.

use std::sync::Mutex;

use outreach_core::types::DeliveryEvent;

/// Source of synthesized delivery events, drained on each detection sweep.
pub trait DetectionSource: Send + Sync {
    fn poll(&self) -> Vec<DeliveryEvent>;
}

/// In-memory source for tests and development: events pushed here are
/// returned once by the next `poll`.
#[derive(Default)]
pub struct StaticDetectionSource {
    pending: Mutex<Vec<DeliveryEvent>>,
}

impl StaticDetectionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: DeliveryEvent) {
        self.pending
            .lock()
            .expect("detection source mutex poisoned")
            .push(event);
    }
}

impl DetectionSource for StaticDetectionSource {
    fn poll(&self) -> Vec<DeliveryEvent> {
        std::mem::take(
            &mut *self
                .pending
                .lock()
                .expect("detection source mutex poisoned"),
        )
    }
}
