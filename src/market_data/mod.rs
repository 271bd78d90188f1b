pub mod aggregator;
pub mod broadcast;
pub mod candle_series;
pub mod subscribers;
pub mod timeframe;
pub mod trade_stream;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Candle`).
pub use aggregator::{Aggregator, AggregatorStats, CandleCloseHook, CandleUpdate};
pub use broadcast::{publish_snapshot, BroadcastScheduler, OutboundMessage};
pub use candle_series::{Candle, CandleSeries, UpsertOutcome};
pub use subscribers::{ChannelSink, SubscriberRegistry, SubscriberSink};
pub use timeframe::Timeframe;
