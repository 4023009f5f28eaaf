use kfund_core::DateRange;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryCounts {
    pub found: u64,
    pub new: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub attachments: u64,
}

/// Emitted once per fully completed discovery range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryCompleted {
    pub session_id: Uuid,
    pub source_id: String,
    pub date_range: DateRange,
    pub counts: DiscoveryCounts,
}

pub trait CompletionSink: Send + Sync {
    fn discovery_completed(&self, event: DiscoveryCompleted);
}

#[derive(Debug, Default)]
pub struct NoopCompletionSink;

impl CompletionSink for NoopCompletionSink {
    fn discovery_completed(&self, event: DiscoveryCompleted) {
        info!(session_id = %event.session_id, source_id = %event.source_id, "discovery completed");
    }
}

/// Forwards completion events to a listener that starts the process worker.
#[derive(Debug, Clone)]
pub struct ChannelCompletionSink {
    tx: mpsc::UnboundedSender<DiscoveryCompleted>,
}

impl ChannelCompletionSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DiscoveryCompleted>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CompletionSink for ChannelCompletionSink {
    fn discovery_completed(&self, event: DiscoveryCompleted) {
        let session_id = event.session_id;
        if self.tx.send(event).is_err() {
            warn!(%session_id, "completion listener is gone; event dropped");
        }
    }
}
