// =============================================================================
// Arbitrage Orchestrator — cross-venue spread scan with dual-leg paper fills
// =============================================================================
//
// On demand: query best bid/ask from every adapter, buy at the venue with
// the lowest ask, sell at the venue with the highest bid, and keep the
// opportunity only when the edge survives fees, slippage and a latency
// buffer:
//
//   net_pct = (best_sell.bid - best_buy.ask) / best_buy.ask
//             - fees(buy) - fees(sell) - slippage - latency_buffer
//
// Execution places both paper legs concurrently. If exactly one leg fails,
// the filled leg is immediately hedged at market on its own venue so the
// book carries no directional exposure. Every resulting fill is journalled
// like an ordinary trade, tagged with the opportunity's `arbitrage_id`.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::execution::ExecutionSimulation;
use crate::history::{HistoryStore, TradeRecord};
use crate::market::adapter::{BestBidAsk, MarketAdapter, VenueFill};
use crate::money;
use crate::types::{ExitReason, Side, Venue};

/// Extra haircut per 100 ms of combined venue latency.
const LATENCY_BUFFER_PCT_PER_100MS: f64 = 0.0001;

/// A profitable cross-venue spread.
#[derive(Debug, Clone, Serialize)]
pub struct ArbitrageOpportunity {
    pub id: String,
    pub symbol: String,
    pub buy_venue: Venue,
    pub sell_venue: Venue,
    pub buy_ask: f64,
    pub sell_bid: f64,
    pub gross_pct: f64,
    pub net_pct: f64,
    pub detected_at: i64,
}

/// What execution did with an opportunity.
#[derive(Debug, Clone, Serialize)]
pub enum ArbitrageOutcome {
    /// Both legs filled.
    Completed {
        arbitrage_id: String,
        buy_fill: f64,
        sell_fill: f64,
        realized_edge_pct: f64,
    },
    /// One leg failed; the filled leg was hedged on its own venue.
    Hedged {
        arbitrage_id: String,
        failed_venue: Venue,
        hedged_venue: Venue,
    },
    /// Both legs failed; nothing to unwind.
    Failed { arbitrage_id: String, error: String },
}

pub struct ArbitrageOrchestrator {
    adapters: Vec<Arc<dyn MarketAdapter>>,
    history: Arc<dyn HistoryStore>,
    /// Minimum net edge (fraction) an opportunity must clear.
    min_edge: f64,
    /// Slippage haircut applied to the raw edge (config: paper slippage).
    slippage_buffer_pct: f64,
}

impl ArbitrageOrchestrator {
    pub fn new(
        adapters: Vec<Arc<dyn MarketAdapter>>,
        history: Arc<dyn HistoryStore>,
        min_edge: f64,
        slippage_buffer_pct: f64,
    ) -> Self {
        Self {
            adapters,
            history,
            min_edge,
            slippage_buffer_pct,
        }
    }

    // ── Scan ────────────────────────────────────────────────────────────

    /// Query every venue and return the best net-positive spread, if any.
    pub async fn scan(&self, symbol: &str) -> Result<Option<ArbitrageOpportunity>> {
        let mut quotes: Vec<(BestBidAsk, f64, u64)> = Vec::new();
        for adapter in &self.adapters {
            match adapter.best_bid_ask(symbol).await {
                Ok(quote) => quotes.push((quote, adapter.fees_bps(), adapter.latency_ms())),
                Err(e) => warn!(venue = %adapter.venue(), error = %e, "quote unavailable"),
            }
        }
        if quotes.len() < 2 {
            return Ok(None);
        }

        let (buy, buy_fees_bps, buy_latency) = quotes
            .iter()
            .min_by(|a, b| a.0.ask.total_cmp(&b.0.ask))
            .cloned()
            .context("no buy quote")?;
        let (sell, sell_fees_bps, sell_latency) = quotes
            .iter()
            .filter(|q| q.0.venue != buy.venue)
            .max_by(|a, b| a.0.bid.total_cmp(&b.0.bid))
            .cloned()
            .context("no sell quote")?;

        if buy.ask <= 0.0 {
            return Ok(None);
        }
        let gross_pct = (sell.bid - buy.ask) / buy.ask;
        let fees_pct = (buy_fees_bps + sell_fees_bps) / 10_000.0;
        let latency_buffer =
            ((buy_latency + sell_latency) as f64 / 100.0) * LATENCY_BUFFER_PCT_PER_100MS;
        let net_pct = gross_pct - fees_pct - self.slippage_buffer_pct - latency_buffer;

        if net_pct <= self.min_edge {
            return Ok(None);
        }

        let opportunity = ArbitrageOpportunity {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            buy_venue: buy.venue,
            sell_venue: sell.venue,
            buy_ask: buy.ask,
            sell_bid: sell.bid,
            gross_pct,
            net_pct,
            detected_at: chrono::Utc::now().timestamp_millis(),
        };
        info!(
            symbol,
            buy_venue = %opportunity.buy_venue,
            sell_venue = %opportunity.sell_venue,
            net_pct = format!("{:.5}", net_pct),
            "arbitrage opportunity detected"
        );
        Ok(Some(opportunity))
    }

    // ── Execute ─────────────────────────────────────────────────────────

    /// Place both legs concurrently, hedging a single-leg failure.
    pub async fn execute(
        &self,
        opportunity: &ArbitrageOpportunity,
        qty: f64,
    ) -> Result<ArbitrageOutcome> {
        let buy_adapter = self
            .adapter_for(opportunity.buy_venue)
            .context("buy venue adapter missing")?;
        let sell_adapter = self
            .adapter_for(opportunity.sell_venue)
            .context("sell venue adapter missing")?;

        let (buy_result, sell_result) = tokio::join!(
            buy_adapter.place_order(&opportunity.symbol, Side::Buy, qty),
            sell_adapter.place_order(&opportunity.symbol, Side::Sell, qty),
        );

        match (buy_result, sell_result) {
            (Ok(buy_fill), Ok(sell_fill)) => {
                self.record_leg(&buy_fill, opportunity, None).await;
                self.record_leg(&sell_fill, opportunity, None).await;
                let realized_edge_pct = if buy_fill.fill_price > 0.0 {
                    (sell_fill.fill_price - buy_fill.fill_price) / buy_fill.fill_price
                } else {
                    0.0
                };
                info!(
                    arbitrage_id = %opportunity.id,
                    realized_edge_pct = format!("{:.5}", realized_edge_pct),
                    "both legs filled"
                );
                Ok(ArbitrageOutcome::Completed {
                    arbitrage_id: opportunity.id.clone(),
                    buy_fill: buy_fill.fill_price,
                    sell_fill: sell_fill.fill_price,
                    realized_edge_pct,
                })
            }
            (Ok(filled), Err(e)) => {
                warn!(
                    arbitrage_id = %opportunity.id,
                    failed_venue = %opportunity.sell_venue,
                    error = %e,
                    "sell leg failed, hedging buy leg"
                );
                self.record_leg(&filled, opportunity, None).await;
                self.hedge(&filled, opportunity).await;
                Ok(ArbitrageOutcome::Hedged {
                    arbitrage_id: opportunity.id.clone(),
                    failed_venue: opportunity.sell_venue,
                    hedged_venue: filled.venue,
                })
            }
            (Err(e), Ok(filled)) => {
                warn!(
                    arbitrage_id = %opportunity.id,
                    failed_venue = %opportunity.buy_venue,
                    error = %e,
                    "buy leg failed, hedging sell leg"
                );
                self.record_leg(&filled, opportunity, None).await;
                self.hedge(&filled, opportunity).await;
                Ok(ArbitrageOutcome::Hedged {
                    arbitrage_id: opportunity.id.clone(),
                    failed_venue: opportunity.buy_venue,
                    hedged_venue: filled.venue,
                })
            }
            (Err(buy_err), Err(sell_err)) => Ok(ArbitrageOutcome::Failed {
                arbitrage_id: opportunity.id.clone(),
                error: format!("buy: {buy_err}; sell: {sell_err}"),
            }),
        }
    }

    /// Immediately flatten a stranded leg at market on its own venue.
    async fn hedge(&self, filled: &VenueFill, opportunity: &ArbitrageOpportunity) {
        let Some(adapter) = self.adapter_for(filled.venue) else {
            warn!(venue = %filled.venue, "hedge adapter missing");
            return;
        };
        let hedge_side = match filled.side {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        };
        match adapter
            .place_order(&filled.symbol, hedge_side, filled.qty)
            .await
        {
            Ok(hedge_fill) => {
                self.record_leg(&hedge_fill, opportunity, Some(ExitReason::ArbHedge))
                    .await;
                info!(
                    arbitrage_id = %opportunity.id,
                    venue = %filled.venue,
                    "stranded leg hedged at market"
                );
            }
            Err(e) => warn!(
                arbitrage_id = %opportunity.id,
                venue = %filled.venue,
                error = %e,
                "hedge order failed, exposure remains"
            ),
        }
    }

    /// Journal one leg as an ordinary trade with the arbitrage tag.
    async fn record_leg(
        &self,
        fill: &VenueFill,
        opportunity: &ArbitrageOpportunity,
        exit_reason: Option<ExitReason>,
    ) {
        let record = TradeRecord {
            id: fill.order_id.clone(),
            symbol: fill.symbol.clone(),
            side: fill.side,
            price: money::price(fill.fill_price),
            amount: money::qty(fill.qty),
            ts: chrono::Utc::now().timestamp_millis(),
            fee: money::usd(fill.fee),
            pnl: None,
            r_multiple: None,
            exit_reason,
            simulation: ExecutionSimulation {
                side: fill.side,
                requested_price: fill.fill_price,
                spread: 0.0,
                slippage: 0.0,
                fill_price: fill.fill_price,
                fee_rate: if fill.fill_price > 0.0 && fill.qty > 0.0 {
                    fill.fee / (fill.fill_price * fill.qty)
                } else {
                    0.0
                },
                fees: fill.fee,
                hash_unit: 0.0,
            },
            decision_id: opportunity.id.clone(),
            entry_score: 0.0,
            entry_atr_pct: 0.0,
            regime: None,
            strategy_version: 0,
            arbitrage_id: Some(opportunity.id.clone()),
        };
        if let Err(e) = self.history.record_trade(&record).await {
            warn!(arbitrage_id = %opportunity.id, error = %e, "failed to journal arbitrage leg");
        }
    }

    fn adapter_for(&self, venue: Venue) -> Option<Arc<dyn MarketAdapter>> {
        self.adapters.iter().find(|a| a.venue() == venue).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::file_store::FileHistoryStore;
    use crate::market::adapter::PaperVenueAdapter;

    fn temp_store() -> Arc<dyn HistoryStore> {
        let dir = std::env::temp_dir().join(format!("borealis-arb-{}", Uuid::new_v4()));
        Arc::new(FileHistoryStore::open(&dir).unwrap())
    }

    fn adapters_with_spread(
        symbol: &str,
        binance_mark: f64,
        kucoin_mark: f64,
    ) -> Vec<Arc<dyn MarketAdapter>> {
        let binance = Arc::new(PaperVenueAdapter::new(Venue::Binance));
        let kucoin = Arc::new(PaperVenueAdapter::new(Venue::Kucoin));
        binance.set_mark(symbol, binance_mark, 1);
        kucoin.set_mark(symbol, kucoin_mark, 1);
        vec![binance, kucoin]
    }

    #[tokio::test]
    async fn no_opportunity_on_flat_prices() {
        let orchestrator = ArbitrageOrchestrator::new(
            adapters_with_spread("BTC-USDT", 60_000.0, 60_000.0),
            temp_store(),
            5e-4,
            0.0002,
        );
        // The venue skew alone (1.5 bps) cannot beat fees + buffers.
        assert!(orchestrator.scan("BTC-USDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wide_spread_yields_opportunity() {
        // KuCoin marks 1% above Binance: buy Binance, sell KuCoin.
        let orchestrator = ArbitrageOrchestrator::new(
            adapters_with_spread("BTC-USDT", 60_000.0, 60_600.0),
            temp_store(),
            5e-4,
            0.0002,
        );
        let opp = orchestrator.scan("BTC-USDT").await.unwrap().unwrap();
        assert_eq!(opp.buy_venue, Venue::Binance);
        assert_eq!(opp.sell_venue, Venue::Kucoin);
        assert!(opp.net_pct > 5e-4);
        assert!(opp.gross_pct > opp.net_pct);
    }

    #[tokio::test]
    async fn execution_records_both_legs() {
        let store = temp_store();
        let orchestrator = ArbitrageOrchestrator::new(
            adapters_with_spread("BTC-USDT", 60_000.0, 60_600.0),
            store.clone(),
            5e-4,
            0.0002,
        );
        let opp = orchestrator.scan("BTC-USDT").await.unwrap().unwrap();
        let outcome = orchestrator.execute(&opp, 0.1).await.unwrap();
        match outcome {
            ArbitrageOutcome::Completed {
                buy_fill,
                sell_fill,
                ..
            } => assert!(sell_fill > buy_fill),
            other => panic!("expected completion, got {other:?}"),
        }
        let trades = store.recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 2);
        assert!(trades.iter().all(|t| t.arbitrage_id.as_deref() == Some(opp.id.as_str())));
    }

    #[tokio::test]
    async fn missing_second_venue_means_no_scan() {
        let binance = Arc::new(PaperVenueAdapter::new(Venue::Binance));
        binance.set_mark("BTC-USDT", 60_000.0, 1);
        let orchestrator = ArbitrageOrchestrator::new(
            vec![binance as Arc<dyn MarketAdapter>],
            temp_store(),
            5e-4,
            0.0002,
        );
        assert!(orchestrator.scan("BTC-USDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_sell_leg_hedges_buy_leg() {
        // The sell venue has no mark for the symbol, so its leg errors; the
        // filled buy leg must be hedged on its own venue.
        let binance = Arc::new(PaperVenueAdapter::new(Venue::Binance));
        let kucoin = Arc::new(PaperVenueAdapter::new(Venue::Kucoin));
        binance.set_mark("BTC-USDT", 60_000.0, 1);
        let store = temp_store();
        let orchestrator = ArbitrageOrchestrator::new(
            vec![
                binance.clone() as Arc<dyn MarketAdapter>,
                kucoin as Arc<dyn MarketAdapter>,
            ],
            store.clone(),
            5e-4,
            0.0002,
        );

        let opportunity = ArbitrageOpportunity {
            id: "arb-test".into(),
            symbol: "BTC-USDT".into(),
            buy_venue: Venue::Binance,
            sell_venue: Venue::Kucoin,
            buy_ask: 60_012.0,
            sell_bid: 60_600.0,
            gross_pct: 0.0098,
            net_pct: 0.0074,
            detected_at: 1,
        };
        let outcome = orchestrator.execute(&opportunity, 0.1).await.unwrap();
        match outcome {
            ArbitrageOutcome::Hedged {
                failed_venue,
                hedged_venue,
                ..
            } => {
                assert_eq!(failed_venue, Venue::Kucoin);
                assert_eq!(hedged_venue, Venue::Binance);
            }
            other => panic!("expected hedge, got {other:?}"),
        }
        // Buy leg + hedge leg journalled with the arbitrage tag.
        let trades = store.recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 2);
        assert!(trades
            .iter()
            .any(|t| t.exit_reason == Some(ExitReason::ArbHedge)));
    }
}
