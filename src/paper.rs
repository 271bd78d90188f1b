// =============================================================================
// Paper Ledger - simulated market orders filled at the live candle close
// =============================================================================
//
// Spot-only bookkeeping: cash, long holdings with an average entry price, and
// a journal of every fill. Orders read the aggregator's latest price and
// never write to it.
//
// Thread-safety: all mutable state is behind one `parking_lot::RwLock`, so a
// fill checks and updates cash and holdings atomically.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::market_data::Aggregator;
use crate::types::Side;

/// Quantities below this are treated as a fully closed holding.
const DUST: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// One executed paper fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperTrade {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    /// Realised PnL of this fill (sells only).
    #[serde(default)]
    pub realized_pnl: f64,
    pub executed_at: String,
}

#[derive(Debug, Clone, Copy, Default)]
struct Holding {
    quantity: f64,
    avg_price: f64,
}

/// Holding valued at a mark price.
#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    pub symbol: String,
    pub quantity: f64,
    pub avg_price: f64,
    /// `None` when no price is known yet for the symbol.
    pub mark_price: Option<f64>,
    pub market_value: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Portfolio {
    pub initial_balance: f64,
    pub cash: f64,
    pub positions: Vec<PositionView>,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub equity: f64,
    pub trade_count: usize,
}

struct Book {
    cash: f64,
    holdings: BTreeMap<String, Holding>,
    trades: Vec<PaperTrade>,
    realized_pnl: f64,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct PaperLedger {
    initial_balance: f64,
    book: RwLock<Book>,
}

impl PaperLedger {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            initial_balance,
            book: RwLock::new(Book {
                cash: initial_balance,
                holdings: BTreeMap::new(),
                trades: Vec::new(),
                realized_pnl: 0.0,
            }),
        }
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    pub fn cash(&self) -> f64 {
        self.book.read().cash
    }

    /// Fill a market order at the symbol's latest candle close.
    pub fn place_market_order(
        &self,
        aggregator: &Aggregator,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<PaperTrade, LedgerError> {
        let symbol = symbol.trim().to_uppercase();
        let price = aggregator
            .latest_price(&symbol)
            .ok_or_else(|| LedgerError::NoPrice(symbol.clone()))?;
        self.fill(&symbol, side, quantity, price)
    }

    /// Apply a fill at an explicit price.
    pub fn fill(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<PaperTrade, LedgerError> {
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(LedgerError::InvalidQuantity(quantity));
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(LedgerError::NoPrice(symbol.to_string()));
        }

        let mut book = self.book.write();
        let notional = quantity * price;

        let realized_pnl = match side {
            Side::Buy => {
                if notional > book.cash {
                    return Err(LedgerError::InsufficientCash {
                        needed: notional,
                        available: book.cash,
                    });
                }
                book.cash -= notional;
                let holding = book.holdings.entry(symbol.to_string()).or_default();
                let total_qty = holding.quantity + quantity;
                holding.avg_price =
                    (holding.avg_price * holding.quantity + notional) / total_qty;
                holding.quantity = total_qty;
                0.0
            }
            Side::Sell => {
                let held = book.holdings.get(symbol).copied().unwrap_or_default();
                if quantity > held.quantity + DUST {
                    return Err(LedgerError::InsufficientPosition {
                        symbol: symbol.to_string(),
                        needed: quantity,
                        available: held.quantity,
                    });
                }
                let pnl = (price - held.avg_price) * quantity;
                book.cash += notional;
                book.realized_pnl += pnl;

                let remaining = held.quantity - quantity;
                if remaining <= DUST {
                    book.holdings.remove(symbol);
                } else if let Some(h) = book.holdings.get_mut(symbol) {
                    h.quantity = remaining;
                }
                pnl
            }
        };

        let trade = PaperTrade {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
            realized_pnl,
            executed_at: Utc::now().to_rfc3339(),
        };

        info!(
            id = %trade.id,
            symbol,
            side = %side,
            quantity,
            price,
            cash = book.cash,
            "paper fill"
        );

        book.trades.push(trade.clone());
        Ok(trade)
    }

    /// The most recent `count` fills, newest first.
    pub fn trades(&self, count: usize) -> Vec<PaperTrade> {
        self.book.read().trades.iter().rev().take(count).cloned().collect()
    }

    /// Value the book at `prices`. Holdings without a price are carried at
    /// their average entry price.
    pub fn portfolio(&self, prices: &HashMap<String, f64>) -> Portfolio {
        let book = self.book.read();

        let positions: Vec<PositionView> = book
            .holdings
            .iter()
            .map(|(symbol, h)| {
                let mark_price = prices.get(symbol).copied();
                let mark = mark_price.unwrap_or(h.avg_price);
                PositionView {
                    symbol: symbol.clone(),
                    quantity: h.quantity,
                    avg_price: h.avg_price,
                    mark_price,
                    market_value: h.quantity * mark,
                    unrealized_pnl: (mark - h.avg_price) * h.quantity,
                }
            })
            .collect();

        let market_value: f64 = positions.iter().map(|p| p.market_value).sum();
        let unrealized_pnl: f64 = positions.iter().map(|p| p.unrealized_pnl).sum();

        Portfolio {
            initial_balance: self.initial_balance(),
            cash: book.cash,
            realized_pnl: book.realized_pnl,
            unrealized_pnl,
            equity: book.cash + market_value,
            trade_count: book.trades.len(),
            positions,
        }
    }
}

impl std::fmt::Debug for PaperLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let book = self.book.read();
        f.debug_struct("PaperLedger")
            .field("cash", &book.cash)
            .field("holdings", &book.holdings.len())
            .field("trades", &book.trades.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Timeframe;
    use crate::types::TickEvent;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn buy_then_sell_tracks_cash_and_pnl() {
        let ledger = PaperLedger::new(1_000.0);
        ledger.fill("BTCUSDT", Side::Buy, 2.0, 100.0).unwrap();
        ledger.fill("BTCUSDT", Side::Buy, 2.0, 200.0).unwrap();
        assert!(approx(ledger.cash(), 400.0));

        let prices = HashMap::from([("BTCUSDT".to_string(), 160.0)]);
        let pf = ledger.portfolio(&prices);
        assert_eq!(pf.positions.len(), 1);
        assert!(approx(pf.positions[0].avg_price, 150.0));
        assert!(approx(pf.unrealized_pnl, 40.0));
        assert!(approx(pf.equity, 1_040.0));

        let sell = ledger.fill("BTCUSDT", Side::Sell, 4.0, 160.0).unwrap();
        assert!(approx(sell.realized_pnl, 40.0));
        let pf = ledger.portfolio(&prices);
        assert!(pf.positions.is_empty());
        assert!(approx(pf.cash, 1_040.0));
        assert!(approx(pf.realized_pnl, 40.0));
        assert_eq!(pf.trade_count, 3);
    }

    #[test]
    fn rejects_orders_the_book_cannot_cover() {
        let ledger = PaperLedger::new(100.0);
        assert!(matches!(
            ledger.fill("ETHUSDT", Side::Buy, 1.0, 101.0),
            Err(LedgerError::InsufficientCash { .. })
        ));
        assert!(matches!(
            ledger.fill("ETHUSDT", Side::Sell, 1.0, 50.0),
            Err(LedgerError::InsufficientPosition { .. })
        ));
        assert!(matches!(
            ledger.fill("ETHUSDT", Side::Buy, 0.0, 50.0),
            Err(LedgerError::InvalidQuantity(_))
        ));
        assert!(approx(ledger.cash(), 100.0));
        assert!(ledger.trades(10).is_empty());
    }

    #[test]
    fn market_order_uses_latest_close_without_touching_series() {
        let agg = Aggregator::new(Timeframe::M1, ["BTCUSDT"], 10);
        let ledger = PaperLedger::new(1_000.0);

        assert!(matches!(
            ledger.place_market_order(&agg, "BTCUSDT", Side::Buy, 1.0),
            Err(LedgerError::NoPrice(_))
        ));

        agg.ingest_tick(&TickEvent::new("BTCUSDT", 1_000, 100.0, 1.0)).unwrap();
        agg.ingest_tick(&TickEvent::new("BTCUSDT", 2_000, 105.0, 1.0)).unwrap();
        let before = agg.snapshot("BTCUSDT").unwrap();

        let trade = ledger
            .place_market_order(&agg, "btcusdt", Side::Buy, 2.0)
            .unwrap();
        assert_eq!(trade.symbol, "BTCUSDT");
        assert!(approx(trade.price, 105.0));
        assert_eq!(agg.snapshot("BTCUSDT").unwrap(), before);
    }

    #[test]
    fn trades_are_newest_first() {
        let ledger = PaperLedger::new(1_000.0);
        ledger.fill("A", Side::Buy, 1.0, 1.0).unwrap();
        ledger.fill("B", Side::Buy, 1.0, 1.0).unwrap();
        let trades = ledger.trades(1);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].symbol, "B");
    }
}
