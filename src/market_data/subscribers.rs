// =============================================================================
// Subscriber Registry - live set of downstream sinks with best-effort fan-out
// =============================================================================
//
// Connect/disconnect handlers write the set, the broadcast task reads it. The
// set is guarded by a single mutex that is only held to copy or edit the map:
// a fan-out pass works on a snapshot of the handles, delivers to each with a
// non-blocking call, and removes the ones that failed after the pass ends.
//
// Backpressure policy is drop-and-disconnect: a sink whose buffer is full is
// treated exactly like a closed one.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

pub type SubscriberId = u64;

/// Why a delivery did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The consumer is gone.
    Closed,
    /// The consumer is not keeping up.
    Full,
}

/// Something that can accept a serialized message without waiting.
pub trait SubscriberSink: Send + Sync {
    fn try_deliver(&self, payload: &Arc<str>) -> Result<(), SendFailure>;
}

// ---------------------------------------------------------------------------
// Channel-backed sink used by WebSocket connections
// ---------------------------------------------------------------------------

/// Bounded queue in front of one connection's writer task.
pub struct ChannelSink {
    tx: mpsc::Sender<Arc<str>>,
}

impl ChannelSink {
    /// Create a sink and the receiver its writer task drains.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

impl SubscriberSink for ChannelSink {
    fn try_deliver(&self, payload: &Arc<str>) -> Result<(), SendFailure> {
        self.tx.try_send(Arc::clone(payload)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Result of one fan-out pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    pub delivered: usize,
    pub pruned: usize,
}

#[derive(Default)]
pub struct SubscriberRegistry {
    live: Mutex<HashMap<SubscriberId, Arc<dyn SubscriberSink>>>,
    next_id: AtomicU64,
    pruned_total: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn SubscriberSink>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.live.lock().insert(id, sink);
        debug!(subscriber = id, "subscriber registered");
        id
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.live.lock().remove(&id).is_some();
        if removed {
            debug!(subscriber = id, "subscriber unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }

    pub fn pruned_total(&self) -> u64 {
        self.pruned_total.load(Ordering::Relaxed)
    }

    /// Deliver `payload` to every live subscriber. Failed subscribers are
    /// removed once the pass has finished; nothing is reported to the caller
    /// beyond the counts.
    pub fn fanout(&self, payload: &Arc<str>) -> FanoutReport {
        let targets: Vec<(SubscriberId, Arc<dyn SubscriberSink>)> = self
            .live
            .lock()
            .iter()
            .map(|(id, sink)| (*id, Arc::clone(sink)))
            .collect();

        let mut report = FanoutReport::default();
        let mut failed = Vec::new();
        for (id, sink) in &targets {
            match sink.try_deliver(payload) {
                Ok(()) => report.delivered += 1,
                Err(reason) => {
                    debug!(subscriber = *id, ?reason, "delivery failed, dropping subscriber");
                    failed.push(*id);
                }
            }
        }

        if !failed.is_empty() {
            let mut live = self.live.lock();
            for id in &failed {
                if live.remove(id).is_some() {
                    report.pruned += 1;
                }
            }
            self.pruned_total
                .fetch_add(report.pruned as u64, Ordering::Relaxed);
        }

        report
    }

    /// Drop every subscriber. Channel-backed sinks see their queue close and
    /// shut their connection down.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.live.lock().drain().collect();
        debug!(count = drained.len(), "all subscribers closed");
        drained.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
