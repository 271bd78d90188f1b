// =============================================================================
// Broadcast Scheduler - coalesced, periodic fan-out of candle updates
// =============================================================================
//
// Ingestion only marks a symbol's latest touched candle as pending. Every
// `interval` this loop drains those marks, serializes each candle once and
// hands the payload to the subscriber registry. However many ticks a symbol
// sees inside one interval, subscribers get a single message carrying the
// final state.
//
// Fan-out is non-blocking, so a cycle's duration does not depend on how fast
// subscribers read.
//
// Seeding a symbol replaces its series without marking anything pending, so
// the seeding task calls `publish_snapshot` to hand the loaded history to
// subscribers that connected during backfill.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::market_data::aggregator::Aggregator;
use crate::market_data::candle_series::Candle;
use crate::market_data::subscribers::{FanoutReport, SubscriberRegistry};

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// JSON messages pushed to subscribers.
///
/// ```json
/// {"type":"candle","symbol":"BTCUSDT","bucket_start":60,"open":102.0,...}
/// {"type":"snapshot","symbol":"BTCUSDT","candles":[...]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Candle {
        symbol: String,
        #[serde(flatten)]
        candle: Candle,
    },
    Snapshot {
        symbol: String,
        candles: Vec<Candle>,
    },
}

impl OutboundMessage {
    /// Serialize once into a payload shareable across all subscribers.
    pub fn to_payload(&self) -> serde_json::Result<Arc<str>> {
        serde_json::to_string(self).map(Arc::from)
    }
}

/// Fan out a fresh `snapshot` of `symbol` (at most `limit` newest candles) to
/// every current subscriber.
pub fn publish_snapshot(
    aggregator: &Aggregator,
    registry: &SubscriberRegistry,
    symbol: &str,
    limit: usize,
) -> anyhow::Result<FanoutReport> {
    if registry.is_empty() {
        return Ok(FanoutReport::default());
    }
    let candles = aggregator.snapshot_tail(symbol, limit)?;
    let payload = OutboundMessage::Snapshot {
        symbol: symbol.trim().to_uppercase(),
        candles,
    }
    .to_payload()?;
    Ok(registry.fanout(&payload))
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// What one broadcast cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Symbols with a pending update this cycle.
    pub updates: usize,
    /// Successful per-subscriber deliveries.
    pub delivered: usize,
    /// Subscribers dropped during the cycle.
    pub pruned: usize,
}

pub struct BroadcastScheduler {
    aggregator: Arc<Aggregator>,
    registry: Arc<SubscriberRegistry>,
    interval: Duration,
}

impl BroadcastScheduler {
    pub fn new(
        aggregator: Arc<Aggregator>,
        registry: Arc<SubscriberRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            aggregator,
            registry,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Drain pending updates and fan each one out.
    pub fn run_cycle(&self) -> CycleReport {
        let updates = self.aggregator.drain_pending();
        let mut report = CycleReport {
            updates: updates.len(),
            ..CycleReport::default()
        };
        if updates.is_empty() || self.registry.is_empty() {
            return report;
        }

        for update in updates {
            let message = OutboundMessage::Candle {
                symbol: update.symbol,
                candle: update.candle,
            };
            match message.to_payload() {
                Ok(payload) => {
                    let fanout = self.registry.fanout(&payload);
                    report.delivered += fanout.delivered;
                    report.pruned += fanout.pruned;
                }
                Err(e) => warn!(error = %e, "failed to serialize candle update"),
            }
        }

        if report.pruned > 0 {
            debug!(pruned = report.pruned, "slow or closed subscribers dropped");
        }
        report
    }

    /// Run cycles every `interval` until `shutdown` flips to `true` or its
    /// sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "broadcast loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("broadcast loop stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
