// =============================================================================
// Shared types used across the candle relay
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::market_data::Candle;

/// One normalized trade observed on the upstream feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickEvent {
    pub symbol: String,
    /// Exchange trade time in milliseconds since epoch.
    pub event_time_ms: i64,
    pub price: f64,
    pub quantity: f64,
}

impl TickEvent {
    pub fn new(symbol: impl Into<String>, event_time_ms: i64, price: f64, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            event_time_ms,
            price,
            quantity,
        }
    }
}

/// A historical candle as delivered by the backfill loader.
///
/// `bucket_start` is in seconds and is re-aligned by the aggregator before it
/// lands in a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeedCandle {
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Emitted the moment a new bucket opens for a symbol: the bucket that was
/// latest until now is final.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandleClose {
    pub symbol: String,
    pub closed_bucket_start: i64,
    pub final_candle: Candle,
}

/// Order side for the paper ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}
