// =============================================================================
// Timeframe - fixed-width bucketing of event timestamps
// =============================================================================
//
// Both the history backfill and the live trade path compute bucket keys with
// `Timeframe::bucket_start`, so a seeded candle and a live tick for the same
// interval always agree on the key.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{AggregatorError, AggregatorResult};

/// Supported candle widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H1];

    /// Width of one bucket in seconds.
    pub fn secs(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::H1 => 3600,
        }
    }

    pub fn millis(self) -> i64 {
        self.secs() * 1000
    }

    /// Binance interval label, also the label used in config files.
    pub fn label(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
        }
    }

    pub fn from_label(label: &str) -> AggregatorResult<Self> {
        let label = label.trim();
        Self::ALL
            .into_iter()
            .find(|tf| tf.label() == label)
            .ok_or_else(|| AggregatorError::UnsupportedTimeframe(label.to_string()))
    }

    pub fn from_secs(secs: i64) -> AggregatorResult<Self> {
        Self::ALL
            .into_iter()
            .find(|tf| tf.secs() == secs)
            .ok_or_else(|| AggregatorError::UnsupportedTimeframe(format!("{secs}s")))
    }

    /// Start (seconds since epoch) of the bucket containing `ts_secs`.
    ///
    /// A bucket whose start would precede `i64::MIN` is clamped to the first
    /// representable boundary.
    pub fn bucket_start(self, ts_secs: i64) -> i64 {
        let index = ts_secs.div_euclid(self.secs());
        index
            .checked_mul(self.secs())
            .unwrap_or((index + 1) * self.secs())
    }

    /// Same as [`bucket_start`](Self::bucket_start) for a millisecond exchange timestamp.
    pub fn bucket_start_millis(self, ts_ms: i64) -> i64 {
        self.bucket_start(ts_ms.div_euclid(1000))
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = AggregatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s)
    }
}
