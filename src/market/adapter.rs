// =============================================================================
// Venue Adapters — one capability set per venue, paper execution only
// =============================================================================
//
// Every venue exposes the same five capabilities: best bid/ask, order book,
// (paper) order placement, fees and latency. Adapters are tagged by the
// `Venue` enum; the arbitrage orchestrator treats them uniformly.
//
// Quotes are synthesised from the mark prices the market stream publishes:
// each venue applies its own half-spread and a deterministic per-venue skew
// so cross-venue prices genuinely differ without any extra network I/O.
// =============================================================================

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::types::{Side, Venue};

/// Top-of-book quote from one venue.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BestBidAsk {
    pub venue: Venue,
    pub bid: f64,
    pub ask: f64,
    pub ts: i64,
}

/// One price level.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BookLevel {
    pub price: f64,
    pub qty: f64,
}

/// Depth snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBook {
    pub venue: Venue,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub ts: i64,
}

/// Acknowledgement of a simulated venue fill.
#[derive(Debug, Clone, Serialize)]
pub struct VenueFill {
    pub order_id: String,
    pub venue: Venue,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub fill_price: f64,
    pub fee: f64,
}

/// The venue capability set.
#[async_trait]
pub trait MarketAdapter: Send + Sync {
    fn venue(&self) -> Venue;
    /// Taker fee in basis points.
    fn fees_bps(&self) -> f64;
    /// Round-trip latency estimate in milliseconds.
    fn latency_ms(&self) -> u64;
    async fn best_bid_ask(&self, symbol: &str) -> Result<BestBidAsk>;
    async fn order_book(&self, symbol: &str, limit: usize) -> Result<OrderBook>;
    /// Place a paper order filled at the current touch.
    async fn place_order(&self, symbol: &str, side: Side, qty: f64) -> Result<VenueFill>;
}

/// Static per-venue fee / latency / skew profile.
fn venue_profile(venue: Venue) -> (f64, u64, f64) {
    // (taker fee bps, latency ms, price skew bps)
    match venue {
        Venue::Binance => (10.0, 40, 0.0),
        Venue::Kucoin => (10.0, 80, 1.5),
        Venue::Bybit => (10.0, 60, -1.0),
    }
}

/// Half-spread applied around the mark, in basis points.
const PAPER_HALF_SPREAD_BPS: f64 = 2.0;

/// Paper adapter: fills instantly at its own synthetic touch.
pub struct PaperVenueAdapter {
    venue: Venue,
    fee_bps: f64,
    latency_ms: u64,
    skew_bps: f64,
    marks: RwLock<HashMap<String, (f64, i64)>>,
}

impl PaperVenueAdapter {
    pub fn new(venue: Venue) -> Self {
        let (fee_bps, latency_ms, skew_bps) = venue_profile(venue);
        Self {
            venue,
            fee_bps,
            latency_ms,
            skew_bps,
            marks: RwLock::new(HashMap::new()),
        }
    }

    /// Push a fresh mark price for a symbol (called from the stream fan-out).
    pub fn set_mark(&self, symbol: &str, price: f64, ts: i64) {
        if price.is_finite() && price > 0.0 {
            self.marks.write().insert(symbol.to_string(), (price, ts));
        }
    }

    fn quote(&self, symbol: &str) -> Result<BestBidAsk> {
        let marks = self.marks.read();
        let Some(&(mark, ts)) = marks.get(symbol) else {
            bail!("{}: no mark price for {symbol}", self.venue);
        };
        let skewed = mark * (1.0 + self.skew_bps / 10_000.0);
        let half_spread = skewed * PAPER_HALF_SPREAD_BPS / 10_000.0;
        Ok(BestBidAsk {
            venue: self.venue,
            bid: skewed - half_spread,
            ask: skewed + half_spread,
            ts,
        })
    }
}

#[async_trait]
impl MarketAdapter for PaperVenueAdapter {
    fn venue(&self) -> Venue {
        self.venue
    }

    fn fees_bps(&self) -> f64 {
        self.fee_bps
    }

    fn latency_ms(&self) -> u64 {
        self.latency_ms
    }

    async fn best_bid_ask(&self, symbol: &str) -> Result<BestBidAsk> {
        self.quote(symbol)
    }

    async fn order_book(&self, symbol: &str, limit: usize) -> Result<OrderBook> {
        let top = self.quote(symbol)?;
        let limit = limit.clamp(1, 50);
        let step = (top.ask - top.bid).max(top.ask * 1e-5);
        // Synthetic depth: geometric size growth away from the touch.
        let bids = (0..limit)
            .map(|i| BookLevel {
                price: top.bid - step * i as f64,
                qty: 0.5 * (i + 1) as f64,
            })
            .collect();
        let asks = (0..limit)
            .map(|i| BookLevel {
                price: top.ask + step * i as f64,
                qty: 0.5 * (i + 1) as f64,
            })
            .collect();
        Ok(OrderBook {
            venue: self.venue,
            bids,
            asks,
            ts: top.ts,
        })
    }

    async fn place_order(&self, symbol: &str, side: Side, qty: f64) -> Result<VenueFill> {
        if qty <= 0.0 || !qty.is_finite() {
            bail!("{}: invalid order qty {qty}", self.venue);
        }
        let top = self.quote(symbol)?;
        let fill_price = match side {
            Side::Buy => top.ask,
            Side::Sell => top.bid,
        };
        let fee = fill_price * qty * self.fee_bps / 10_000.0;
        Ok(VenueFill {
            order_id: Uuid::new_v4().to_string(),
            venue: self.venue,
            symbol: symbol.to_string(),
            side,
            qty,
            fill_price,
            fee,
        })
    }
}

/// Build the standard three-venue adapter set.
pub fn default_adapters() -> Vec<std::sync::Arc<PaperVenueAdapter>> {
    vec![
        std::sync::Arc::new(PaperVenueAdapter::new(Venue::Binance)),
        std::sync::Arc::new(PaperVenueAdapter::new(Venue::Kucoin)),
        std::sync::Arc::new(PaperVenueAdapter::new(Venue::Bybit)),
    ]
}
