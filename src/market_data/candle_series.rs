// =============================================================================
// CandleSeries - bounded, key-ordered OHLCV ring for one symbol
// =============================================================================
//
// Candles live in a VecDeque sorted by `bucket_start`. Live trading touches
// the tail almost exclusively, so the hot path (extend the latest bucket or
// open the next one) is O(1), and eviction pops the smallest key off the
// front. Late ticks for older retained buckets fall back to a binary search.
//
// Late ticks are applied in arrival order: `close` is the last price applied
// to a bucket, not the price with the greatest exchange timestamp.
//
// Not synchronised. The aggregator owns exactly one writer per series.
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// OHLCV aggregate of all trades within one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket start in seconds since epoch, aligned to the series timeframe.
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// A fresh candle opened by its first trade.
    pub fn opening(bucket_start: i64, price: f64, quantity: f64) -> Self {
        Self {
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: quantity,
        }
    }

    fn apply(&mut self, price: f64, quantity: f64) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += quantity;
    }

    /// Fold a later candle for the same bucket into this one.
    fn absorb(&mut self, later: &Candle) {
        self.high = self.high.max(later.high);
        self.low = self.low.min(later.low);
        self.close = later.close;
        self.volume += later.volume;
    }

    /// OHLCV integrity: `low <= open, close <= high` and non-negative volume.
    pub fn is_valid(&self) -> bool {
        self.low <= self.high
            && self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.volume >= 0.0
    }
}

// ---------------------------------------------------------------------------
// Upsert outcome
// ---------------------------------------------------------------------------

/// What a single `upsert` did to the series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpsertOutcome {
    /// An existing bucket was extended.
    Updated,
    /// A bucket newer than every retained one was opened. `closed` is the
    /// bucket that was latest until now.
    Opened { closed: Option<Candle> },
    /// A late tick opened a missing bucket inside the retained range.
    Inserted,
    /// The bucket is older than anything the series can still hold.
    Dropped,
}

// ---------------------------------------------------------------------------
// CandleSeries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CandleSeries {
    candles: VecDeque<Candle>,
    capacity: usize,
    /// Largest bucket key ever evicted. Keys at or below it are never re-created.
    evicted_through: Option<i64>,
}

impl CandleSeries {
    /// A series retaining at most `capacity` buckets (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            candles: VecDeque::with_capacity(capacity.min(4096) + 1),
            capacity,
            evicted_through: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Apply one trade to the bucket starting at `bucket_start`.
    pub fn upsert(&mut self, bucket_start: i64, price: f64, quantity: f64) -> UpsertOutcome {
        if self.evicted_through.is_some_and(|wm| bucket_start <= wm) {
            return UpsertOutcome::Dropped;
        }

        match self.candles.back().copied() {
            None => {
                self.candles.push_back(Candle::opening(bucket_start, price, quantity));
                return UpsertOutcome::Opened { closed: None };
            }
            Some(latest) if latest.bucket_start == bucket_start => {
                if let Some(candle) = self.candles.back_mut() {
                    candle.apply(price, quantity);
                }
                return UpsertOutcome::Updated;
            }
            Some(latest) if bucket_start > latest.bucket_start => {
                self.candles.push_back(Candle::opening(bucket_start, price, quantity));
                self.evict_overflow();
                return UpsertOutcome::Opened {
                    closed: Some(latest),
                };
            }
            Some(_) => {}
        }

        // Late tick: somewhere behind the latest bucket.
        match self.position(bucket_start) {
            Ok(idx) => {
                self.candles[idx].apply(price, quantity);
                UpsertOutcome::Updated
            }
            Err(0) if self.candles.len() >= self.capacity => UpsertOutcome::Dropped,
            Err(idx) => {
                self.candles
                    .insert(idx, Candle::opening(bucket_start, price, quantity));
                self.evict_overflow();
                UpsertOutcome::Inserted
            }
        }
    }

    /// Replace the whole series with `candles`.
    ///
    /// Input may be unordered; candles sharing a bucket are merged in input
    /// order. Only the `capacity` most recent buckets are kept.
    pub fn load(&mut self, candles: impl IntoIterator<Item = Candle>) {
        let mut incoming: Vec<Candle> = candles.into_iter().collect();
        incoming.sort_by_key(|c| c.bucket_start);

        let mut merged: Vec<Candle> = Vec::with_capacity(incoming.len());
        for candle in incoming {
            match merged.last_mut() {
                Some(last) if last.bucket_start == candle.bucket_start => last.absorb(&candle),
                _ => merged.push(candle),
            }
        }

        let excess = merged.len().saturating_sub(self.capacity);
        self.evicted_through = excess
            .checked_sub(1)
            .map(|last_dropped| merged[last_dropped].bucket_start);
        self.candles = merged.into_iter().skip(excess).collect();
    }

    pub fn get(&self, bucket_start: i64) -> Option<&Candle> {
        self.position(bucket_start).ok().map(|idx| &self.candles[idx])
    }

    /// Candle with the greatest bucket key.
    pub fn latest(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn oldest(&self) -> Option<&Candle> {
        self.candles.front()
    }

    /// All retained candles in ascending `bucket_start` order.
    pub fn all(&self) -> Vec<Candle> {
        self.candles.iter().copied().collect()
    }

    /// The `count` most recent candles, oldest first.
    pub fn tail(&self, count: usize) -> Vec<Candle> {
        let start = self.candles.len().saturating_sub(count);
        self.candles.range(start..).copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    fn position(&self, bucket_start: i64) -> Result<usize, usize> {
        self.candles
            .binary_search_by_key(&bucket_start, |c| c.bucket_start)
    }

    fn evict_overflow(&mut self) {
        while self.candles.len() > self.capacity {
            if let Some(evicted) = self.candles.pop_front() {
                let mark = self
                    .evicted_through
                    .map_or(evicted.bucket_start, |wm| wm.max(evicted.bucket_start));
                self.evicted_through = Some(mark);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
