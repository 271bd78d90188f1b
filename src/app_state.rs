// =============================================================================
// Central Application State - Candle Relay
// =============================================================================
//
// Ties the long-lived components together for the HTTP and WebSocket
// handlers and the background tasks in main.rs.
//
// Thread safety:
//   - The aggregator, registry and ledger manage their own interior
//     mutability and are shared through `Arc`.
//   - The runtime config is fixed after startup and read without locking.
//   - Shutdown is a `tokio::sync::watch` flag every long-running task observes.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::market_data::{Aggregator, AggregatorStats, SubscriberRegistry, Timeframe};
use crate::paper::PaperLedger;
use crate::runtime_config::RuntimeConfig;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    // ── Configuration ───────────────────────────────────────────────────
    pub config: RuntimeConfig,
    pub timeframe: Timeframe,

    // ── Market Data ─────────────────────────────────────────────────────
    pub aggregator: Arc<Aggregator>,
    pub registry: Arc<SubscriberRegistry>,

    // ── Paper trading ───────────────────────────────────────────────────
    pub ledger: PaperLedger,

    // ── Lifecycle ───────────────────────────────────────────────────────
    shutdown_tx: watch::Sender<bool>,
    pub start_time: Instant,
}

impl AppState {
    /// Build the state around an already-configured aggregator.
    pub fn new(config: RuntimeConfig, timeframe: Timeframe, aggregator: Arc<Aggregator>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let ledger = PaperLedger::new(config.initial_balance);

        Self {
            config,
            timeframe,
            aggregator,
            registry: Arc::new(SubscriberRegistry::new()),
            ledger,
            shutdown_tx,
            start_time: Instant::now(),
        }
    }

    // ── Config accessors ────────────────────────────────────────────────

    pub fn snapshot_limit(&self) -> usize {
        self.config.snapshot_limit
    }

    pub fn subscriber_buffer(&self) -> usize {
        self.config.subscriber_buffer
    }

    pub fn send_timeout(&self) -> Duration {
        self.config.send_timeout()
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// A receiver that flips to `true` once shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Flip the shutdown flag and disconnect every subscriber.
    pub fn begin_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let closed = self.registry.close_all();
        info!(subscribers_closed = closed, "shutdown started");
    }

    // ── Stats ───────────────────────────────────────────────────────────

    pub fn build_stats(&self) -> RelayStats {
        RelayStats {
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            timeframe: self.timeframe.label(),
            symbols: self.aggregator.symbols(),
            subscribers: self.registry.len(),
            subscribers_pruned: self.registry.pruned_total(),
            aggregator: self.aggregator.stats(),
        }
    }
}

/// Payload of `GET /api/v1/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub server_time: i64,
    pub uptime_secs: u64,
    pub timeframe: &'static str,
    pub symbols: Vec<String>,
    pub subscribers: usize,
    pub subscribers_pruned: u64,
    pub aggregator: AggregatorStats,
}
