// =============================================================================
// Core error kinds
// =============================================================================
//
// Only the aggregation core returns these. Everything around it (config files,
// REST, WebSocket streams) works in `anyhow::Result` and wraps them as needed.
// Subscriber send failures are deliberately absent: they are routine and are
// handled inside the registry.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregatorError {
    /// The configured bucket width is not one of the supported timeframes.
    #[error("unsupported timeframe: {0}")]
    UnsupportedTimeframe(String),

    /// A tick or seed arrived for a symbol that is not tracked.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// Seeding was attempted after live ingestion began for the symbol.
    #[error("symbol {0} already receives live ticks; history cannot be reloaded")]
    AlreadySeeded(String),

    /// A tick with a non-finite/non-positive price or a negative quantity.
    #[error("invalid tick for {symbol}: {reason}")]
    InvalidTick { symbol: String, reason: &'static str },
}

pub type AggregatorResult<T> = Result<T, AggregatorError>;

/// Rejections from the paper-trading ledger.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("no price available for {0}")]
    NoPrice(String),

    #[error("quantity must be positive and finite, got {0}")]
    InvalidQuantity(f64),

    #[error("insufficient cash: need {needed:.2}, have {available:.2}")]
    InsufficientCash { needed: f64, available: f64 },

    #[error("insufficient {symbol} position: need {needed}, have {available}")]
    InsufficientPosition {
        symbol: String,
        needed: f64,
        available: f64,
    },
}
