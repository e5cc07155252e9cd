use async_trait::async_trait;

use crate::events::RunEvent;

/// Trait for publishing run events to live subscribers.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish an event for the given run. Publishing never fails; events
    /// for runs without subscribers are dropped.
    async fn publish(&self, run_id: &str, event: RunEvent);
}

/// No-op implementation for tests and headless runs.
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn publish(&self, _run_id: &str, _event: RunEvent) {}
}
