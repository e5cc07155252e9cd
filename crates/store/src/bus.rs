//! Per-run broadcast event bus.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use planweave_core::{events::RunEvent, traits::EventSink};

const DEFAULT_CAPACITY: usize = 256;

/// Broadcast bus keyed by run id.
///
/// Channels are created lazily on first subscribe or publish; `close`
/// drops the sender, which terminates every subscriber stream.
pub struct RunEventBus {
    channels: DashMap<String, broadcast::Sender<RunEvent>>,
    capacity: usize,
}

impl Default for RunEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RunEventBus {
    /// Create a bus with the given per-run buffer capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(16),
        }
    }

    fn sender(&self, run_id: &str) -> broadcast::Sender<RunEvent> {
        self.channels
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Subscribe to a run's events. The stream ends when the run's
    /// channel is closed; lagged events are skipped with a warning.
    pub fn subscribe(&self, run_id: &str) -> BoxStream<'static, RunEvent> {
        let receiver = self.sender(run_id).subscribe();
        let run_id = run_id.to_string();
        BroadcastStream::new(receiver)
            .filter_map(move |item| {
                let run_id = run_id.clone();
                async move {
                    match item {
                        Ok(event) => Some(event),
                        Err(e) => {
                            tracing::warn!(run_id = %run_id, error = %e, "Event subscriber lagged");
                            None
                        }
                    }
                }
            })
            .boxed()
    }

    /// Number of live subscribers for a run.
    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.channels
            .get(run_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Terminate the run's channel; subscriber streams end after
    /// draining buffered events.
    pub fn close(&self, run_id: &str) {
        self.channels.remove(run_id);
    }
}

#[async_trait]
impl EventSink for RunEventBus {
    async fn publish(&self, run_id: &str, event: RunEvent) {
        // Send errors mean no subscribers; events are droppable then.
        let _ = self.sender(run_id).send(event);
    }
}
