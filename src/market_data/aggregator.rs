// =============================================================================
// Aggregator - per-symbol candle series fed by history and live ticks
// =============================================================================
//
// The tracked symbol set is fixed at construction, so the symbol map itself
// is never mutated and needs no lock. Each symbol's state sits behind its own
// mutex: ingestion tasks for different symbols never contend, and two writers
// for the same symbol are serialised.
//
// Lock discipline: a symbol lock is held only for the in-memory mutation.
// The candle-close hook runs after the lock is released, and the broadcaster
// only copies pending candles out.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{AggregatorError, AggregatorResult};
use crate::market_data::candle_series::{Candle, CandleSeries, UpsertOutcome};
use crate::market_data::timeframe::Timeframe;
use crate::types::{CandleClose, SeedCandle, TickEvent};

// ---------------------------------------------------------------------------
// Hooks and outputs
// ---------------------------------------------------------------------------

/// Receives a candle the moment its successor bucket opens.
///
/// Called synchronously on the ingesting task; implementations must not block.
pub trait CandleCloseHook: Send + Sync {
    fn on_candle_close(&self, event: &CandleClose);
}

/// Latest state of one symbol's most recently touched candle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandleUpdate {
    pub symbol: String,
    pub candle: Candle,
}

/// Counters exposed on the stats endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    pub ticks_applied: u64,
    pub unknown_symbol_ticks: u64,
    pub invalid_ticks: u64,
    pub stale_ticks_dropped: u64,
    pub candles_closed: u64,
    pub invalid_seeds_skipped: u64,
}

#[derive(Default)]
struct Counters {
    ticks_applied: AtomicU64,
    unknown_symbol_ticks: AtomicU64,
    invalid_ticks: AtomicU64,
    stale_ticks_dropped: AtomicU64,
    candles_closed: AtomicU64,
    invalid_seeds_skipped: AtomicU64,
}

struct SymbolState {
    series: CandleSeries,
    /// Set by the first live tick; history can no longer be loaded after that.
    live: bool,
    /// Candle to broadcast on the next cycle. Newer touches overwrite it.
    pending: Option<Candle>,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

pub struct Aggregator {
    timeframe: Timeframe,
    symbols: BTreeMap<String, Mutex<SymbolState>>,
    close_hook: Option<Arc<dyn CandleCloseHook>>,
    counters: Counters,
}

impl Aggregator {
    /// Track `symbols` (upper-cased) with one series of `capacity` buckets each.
    pub fn new<I, S>(timeframe: Timeframe, symbols: I, capacity: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let symbols = symbols
            .into_iter()
            .map(|s| {
                let state = SymbolState {
                    series: CandleSeries::new(capacity),
                    live: false,
                    pending: None,
                };
                (s.as_ref().trim().to_uppercase(), Mutex::new(state))
            })
            .collect();

        Self {
            timeframe,
            symbols,
            close_hook: None,
            counters: Counters::default(),
        }
    }

    /// Register the persistence callback for closed candles.
    pub fn with_close_hook(mut self, hook: Arc<dyn CandleCloseHook>) -> Self {
        self.close_hook = Some(hook);
        self
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Tracked symbols in sorted order.
    pub fn symbols(&self) -> Vec<String> {
        self.symbols.keys().cloned().collect()
    }

    pub fn is_tracked(&self, symbol: &str) -> bool {
        self.state(symbol).is_ok()
    }

    pub fn is_live(&self, symbol: &str) -> bool {
        self.state(symbol).map(|s| s.lock().live).unwrap_or(false)
    }

    // ── Seeding ─────────────────────────────────────────────────────────

    /// Replace a symbol's series with historical candles.
    ///
    /// Seed keys are re-bucketed with the live rule. Rows with non-finite or
    /// inconsistent OHLCV are skipped and counted. Returns the number of
    /// candles retained.
    pub fn seed_history(&self, symbol: &str, seeds: &[SeedCandle]) -> AggregatorResult<usize> {
        let state = self.state(symbol)?;
        let mut st = state.lock();
        if st.live {
            return Err(AggregatorError::AlreadySeeded(symbol.to_string()));
        }

        let tf = self.timeframe;
        let candles: Vec<Candle> = seeds
            .iter()
            .map(|s| Candle {
                bucket_start: tf.bucket_start(s.bucket_start),
                open: s.open,
                high: s.high,
                low: s.low,
                close: s.close,
                volume: s.volume,
            })
            .filter(is_usable_seed)
            .collect();
        let skipped = seeds.len() - candles.len();

        st.series.load(candles);
        st.pending = None;
        let retained = st.series.len();
        drop(st);

        if skipped > 0 {
            self.counters
                .invalid_seeds_skipped
                .fetch_add(skipped as u64, Ordering::Relaxed);
            warn!(symbol = %symbol, skipped, "skipped malformed history candles");
        }
        info!(
            symbol = %symbol,
            supplied = seeds.len(),
            retained,
            "history seeded"
        );
        Ok(retained)
    }

    // ── Live ingestion ──────────────────────────────────────────────────

    /// Apply one trade. A tick too old for the retained window yields
    /// `Ok(UpsertOutcome::Dropped)` and leaves the series untouched.
    pub fn ingest_tick(&self, tick: &TickEvent) -> AggregatorResult<UpsertOutcome> {
        if let Err(reason) = validate_tick(tick) {
            self.counters.invalid_ticks.fetch_add(1, Ordering::Relaxed);
            return Err(AggregatorError::InvalidTick {
                symbol: tick.symbol.clone(),
                reason,
            });
        }

        let state = match self.state(&tick.symbol) {
            Ok(state) => state,
            Err(e) => {
                self.counters
                    .unknown_symbol_ticks
                    .fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let bucket = self.timeframe.bucket_start_millis(tick.event_time_ms);

        let outcome = {
            let mut st = state.lock();
            st.live = true;
            let outcome = st.series.upsert(bucket, tick.price, tick.quantity);
            if outcome != UpsertOutcome::Dropped {
                st.pending = st.series.get(bucket).copied();
            }
            outcome
        };

        match outcome {
            UpsertOutcome::Dropped => {
                self.counters
                    .stale_ticks_dropped
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    symbol = %tick.symbol,
                    bucket,
                    "tick older than retained window dropped"
                );
            }
            UpsertOutcome::Opened { closed } => {
                self.counters.ticks_applied.fetch_add(1, Ordering::Relaxed);
                if let Some(final_candle) = closed {
                    self.emit_close(&tick.symbol, final_candle);
                }
            }
            UpsertOutcome::Updated | UpsertOutcome::Inserted => {
                self.counters.ticks_applied.fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(outcome)
    }

    fn emit_close(&self, symbol: &str, final_candle: Candle) {
        self.counters.candles_closed.fetch_add(1, Ordering::Relaxed);
        debug!(symbol = %symbol, bucket = final_candle.bucket_start, "candle closed");
        if let Some(hook) = &self.close_hook {
            hook.on_candle_close(&CandleClose {
                symbol: symbol.to_string(),
                closed_bucket_start: final_candle.bucket_start,
                final_candle,
            });
        }
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Full retained series in ascending bucket order.
    pub fn snapshot(&self, symbol: &str) -> AggregatorResult<Vec<Candle>> {
        Ok(self.state(symbol)?.lock().series.all())
    }

    /// The `limit` most recent candles, oldest first.
    pub fn snapshot_tail(&self, symbol: &str, limit: usize) -> AggregatorResult<Vec<Candle>> {
        Ok(self.state(symbol)?.lock().series.tail(limit))
    }

    pub fn latest_candle(&self, symbol: &str) -> AggregatorResult<Option<Candle>> {
        Ok(self.state(symbol)?.lock().series.latest().copied())
    }

    /// Close of the latest bucket, updated by every tick landing in it.
    pub fn latest_price(&self, symbol: &str) -> Option<f64> {
        self.state(symbol)
            .ok()
            .and_then(|s| s.lock().series.latest().map(|c| c.close))
    }

    pub fn latest_prices(&self) -> HashMap<String, f64> {
        self.symbols
            .iter()
            .filter_map(|(sym, state)| {
                state
                    .lock()
                    .series
                    .latest()
                    .map(|c| (sym.clone(), c.close))
            })
            .collect()
    }

    // ── Broadcast support ───────────────────────────────────────────────

    /// Take every symbol's pending candle, leaving none outstanding.
    pub fn drain_pending(&self) -> Vec<CandleUpdate> {
        self.symbols
            .iter()
            .filter_map(|(sym, state)| {
                state.lock().pending.take().map(|candle| CandleUpdate {
                    symbol: sym.clone(),
                    candle,
                })
            })
            .collect()
    }

    pub fn stats(&self) -> AggregatorStats {
        let c = &self.counters;
        AggregatorStats {
            ticks_applied: c.ticks_applied.load(Ordering::Relaxed),
            unknown_symbol_ticks: c.unknown_symbol_ticks.load(Ordering::Relaxed),
            invalid_ticks: c.invalid_ticks.load(Ordering::Relaxed),
            stale_ticks_dropped: c.stale_ticks_dropped.load(Ordering::Relaxed),
            candles_closed: c.candles_closed.load(Ordering::Relaxed),
            invalid_seeds_skipped: c.invalid_seeds_skipped.load(Ordering::Relaxed),
        }
    }

    fn state(&self, symbol: &str) -> AggregatorResult<&Mutex<SymbolState>> {
        self.symbols
            .get(symbol)
            .or_else(|| self.symbols.get(&symbol.trim().to_uppercase()))
            .ok_or_else(|| AggregatorError::UnknownSymbol(symbol.to_string()))
    }
}

fn is_usable_seed(candle: &Candle) -> bool {
    [candle.open, candle.high, candle.low, candle.close, candle.volume]
        .iter()
        .all(|v| v.is_finite())
        && candle.is_valid()
}

fn validate_tick(tick: &TickEvent) -> Result<(), &'static str> {
    if !tick.price.is_finite() || tick.price <= 0.0 {
        return Err("price must be finite and positive");
    }
    if !tick.quantity.is_finite() || tick.quantity < 0.0 {
        return Err("quantity must be finite and non-negative");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHook {
        events: Mutex<Vec<CandleClose>>,
    }

    impl CandleCloseHook for RecordingHook {
        fn on_candle_close(&self, event: &CandleClose) {
            self.events.lock().push(event.clone());
        }
    }

    fn seed(bucket_start: i64, o: f64, h: f64, l: f64, c: f64, v: f64) -> SeedCandle {
        SeedCandle {
            bucket_start,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
        }
    }

    fn tick(symbol: &str, t_ms: i64, price: f64, qty: f64) -> TickEvent {
        TickEvent::new(symbol, t_ms, price, qty)
    }

    #[test]
    fn seeded_bucket_closes_when_live_tick_opens_next() {
        let hook = Arc::new(RecordingHook::default());
        let agg = Aggregator::new(Timeframe::M1, ["BTCUSDT"], 3).with_close_hook(hook.clone());

        agg.seed_history("BTCUSDT", &[seed(0, 100.0, 105.0, 99.0, 101.0, 10.0)])
            .unwrap();

        let outcome = agg.ingest_tick(&tick("BTCUSDT", 65_000, 102.0, 2.0)).unwrap();
        assert!(matches!(outcome, UpsertOutcome::Opened { closed: Some(_) }));

        let events = hook.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].symbol, "BTCUSDT");
        assert_eq!(events[0].closed_bucket_start, 0);
        assert_eq!(
            events[0].final_candle,
            Candle { bucket_start: 0, open: 100.0, high: 105.0, low: 99.0, close: 101.0, volume: 10.0 }
        );
        assert_eq!(agg.latest_price("BTCUSDT"), Some(102.0));

        agg.ingest_tick(&tick("BTCUSDT", 95_000, 98.0, 1.0)).unwrap();
        assert_eq!(
            agg.latest_candle("BTCUSDT").unwrap(),
            Some(Candle { bucket_start: 60, open: 102.0, high: 102.0, low: 98.0, close: 98.0, volume: 3.0 })
        );
        assert_eq!(hook.events.lock().len(), 1);
    }

    #[test]
    fn tick_matching_last_seeded_bucket_extends_it() {
        let agg = Aggregator::new(Timeframe::M1, ["ETHUSDT"], 10);
        agg.seed_history(
            "ETHUSDT",
            &[
                seed(0, 10.0, 11.0, 9.0, 10.5, 1.0),
                seed(60, 10.5, 12.0, 10.0, 11.0, 2.0),
            ],
        )
        .unwrap();

        let outcome = agg.ingest_tick(&tick("ETHUSDT", 61_500, 12.5, 0.5)).unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);

        let series = agg.snapshot("ETHUSDT").unwrap();
        assert_eq!(series.len(), 2);
        let last = series[1];
        assert_eq!(last.bucket_start, 60);
        assert_eq!(last.open, 10.5);
        assert_eq!(last.high, 12.5);
        assert_eq!(last.close, 12.5);
        assert_eq!(last.volume, 2.5);
    }

    #[test]
    fn seed_keys_are_rebucketed() {
        let agg = Aggregator::new(Timeframe::M5, ["BTCUSDT"], 10);
        agg.seed_history("BTCUSDT", &[seed(330, 1.0, 1.0, 1.0, 1.0, 1.0)])
            .unwrap();
        assert_eq!(agg.snapshot("BTCUSDT").unwrap()[0].bucket_start, 300);
    }

    #[test]
    fn malformed_seed_rows_are_skipped_and_counted() {
        let agg = Aggregator::new(Timeframe::M1, ["BTCUSDT"], 10);
        let retained = agg
            .seed_history(
                "BTCUSDT",
                &[
                    seed(0, 1.0, 2.0, 0.5, 1.5, 3.0),
                    seed(60, f64::NAN, 2.0, 0.5, 1.5, 3.0),
                    seed(120, 1.0, 0.5, 2.0, 1.5, 3.0),
                    seed(180, 1.0, f64::INFINITY, 0.5, 1.5, 3.0),
                    seed(240, 1.0, 2.0, 0.5, 1.5, -1.0),
                    seed(300, 1.5, 1.6, 1.4, 1.5, 0.0),
                ],
            )
            .unwrap();

        assert_eq!(retained, 2);
        let keys: Vec<i64> = agg
            .snapshot("BTCUSDT")
            .unwrap()
            .iter()
            .map(|c| c.bucket_start)
            .collect();
        assert_eq!(keys, vec![0, 300]);
        assert_eq!(agg.stats().invalid_seeds_skipped, 4);
    }

    #[test]
    fn reseeding_before_live_replaces_state() {
        let agg = Aggregator::new(Timeframe::M1, ["BTCUSDT"], 10);
        agg.seed_history("BTCUSDT", &[seed(0, 1.0, 1.0, 1.0, 1.0, 1.0)])
            .unwrap();
        agg.seed_history("BTCUSDT", &[seed(600, 2.0, 2.0, 2.0, 2.0, 2.0)])
            .unwrap();

        let series = agg.snapshot("BTCUSDT").unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].bucket_start, 600);
    }

    #[test]
    fn seeding_after_live_ingestion_is_rejected_without_mutation() {
        let agg = Aggregator::new(Timeframe::M1, ["BTCUSDT"], 10);
        agg.seed_history("BTCUSDT", &[seed(0, 1.0, 1.0, 1.0, 1.0, 1.0)])
            .unwrap();
        agg.ingest_tick(&tick("BTCUSDT", 1_000, 1.5, 1.0)).unwrap();
        let before = agg.snapshot("BTCUSDT").unwrap();

        let err = agg
            .seed_history("BTCUSDT", &[seed(600, 9.0, 9.0, 9.0, 9.0, 9.0)])
            .unwrap_err();
        assert_eq!(err, AggregatorError::AlreadySeeded("BTCUSDT".into()));
        assert_eq!(agg.snapshot("BTCUSDT").unwrap(), before);
    }

    #[test]
    fn unknown_symbol_is_rejected_and_counted() {
        let agg = Aggregator::new(Timeframe::M1, ["BTCUSDT"], 10);
        let err = agg.ingest_tick(&tick("DOGEUSDT", 0, 1.0, 1.0)).unwrap_err();
        assert_eq!(err, AggregatorError::UnknownSymbol("DOGEUSDT".into()));
        assert_eq!(agg.stats().unknown_symbol_ticks, 1);
        assert!(agg.snapshot("DOGEUSDT").is_err());
        assert!(agg
            .seed_history("DOGEUSDT", &[])
            .is_err());
    }

    #[test]
    fn lowercase_symbols_resolve_to_tracked_symbol() {
        let agg = Aggregator::new(Timeframe::M1, ["btcusdt"], 10);
        assert_eq!(agg.symbols(), vec!["BTCUSDT".to_string()]);
        agg.ingest_tick(&tick("btcusdt", 0, 1.0, 1.0)).unwrap();
        assert_eq!(agg.latest_price("BTCUSDT"), Some(1.0));
    }

    #[test]
    fn invalid_ticks_are_rejected() {
        let agg = Aggregator::new(Timeframe::M1, ["BTCUSDT"], 10);
        assert!(agg.ingest_tick(&tick("BTCUSDT", 0, f64::NAN, 1.0)).is_err());
        assert!(agg.ingest_tick(&tick("BTCUSDT", 0, 0.0, 1.0)).is_err());
        assert!(agg.ingest_tick(&tick("BTCUSDT", 0, 1.0, -1.0)).is_err());
        assert_eq!(agg.stats().invalid_ticks, 3);
        assert!(agg.snapshot("BTCUSDT").unwrap().is_empty());
        assert!(!agg.is_live("BTCUSDT"));
    }

    #[test]
    fn stale_tick_is_dropped_and_counted() {
        let agg = Aggregator::new(Timeframe::M1, ["BTCUSDT"], 2);
        for minute in 0..3 {
            agg.ingest_tick(&tick("BTCUSDT", minute * 60_000, 100.0, 1.0))
                .unwrap();
        }
        agg.drain_pending();
        let before = agg.snapshot("BTCUSDT").unwrap();

        let outcome = agg.ingest_tick(&tick("BTCUSDT", 5_000, 1.0, 1.0)).unwrap();
        assert_eq!(outcome, UpsertOutcome::Dropped);
        assert_eq!(agg.snapshot("BTCUSDT").unwrap(), before);
        assert_eq!(agg.stats().stale_ticks_dropped, 1);
        assert!(agg.drain_pending().is_empty());
    }

    #[test]
    fn pending_keeps_only_latest_state_per_symbol() {
        let agg = Aggregator::new(Timeframe::M1, ["BTCUSDT", "ETHUSDT"], 10);
        for (i, price) in [100.0, 101.0, 99.0].into_iter().enumerate() {
            agg.ingest_tick(&tick("BTCUSDT", i as i64 * 1000, price, 1.0))
                .unwrap();
        }
        agg.ingest_tick(&tick("ETHUSDT", 0, 10.0, 1.0)).unwrap();

        let mut updates = agg.drain_pending();
        updates.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].symbol, "BTCUSDT");
        assert_eq!(updates[0].candle.close, 99.0);
        assert_eq!(updates[0].candle.volume, 3.0);
        assert!(agg.drain_pending().is_empty());
    }

    #[test]
    fn concurrent_ingestion_across_symbols_loses_nothing() {
        let symbols = ["AUSDT", "BUSDT", "CUSDT", "DUSDT"];
        let agg = Aggregator::new(Timeframe::M1, symbols, 100);

        std::thread::scope(|scope| {
            for sym in symbols {
                for _ in 0..2 {
                    let agg = &agg;
                    scope.spawn(move || {
                        for i in 0..1_000i64 {
                            agg.ingest_tick(&TickEvent::new(sym, i * 10, 1.0 + i as f64, 1.0))
                                .unwrap();
                        }
                    });
                }
            }
        });

        for sym in symbols {
            let total: f64 = agg.snapshot(sym).unwrap().iter().map(|c| c.volume).sum();
            assert_eq!(total, 2_000.0);
        }
        assert_eq!(agg.stats().ticks_applied, 8_000);
    }
}
