// =============================================================================
// Engine — the per-symbol evaluation pipeline and its owned singletons
// =============================================================================
//
// The `Engine` value owns every process-wide singleton: strategy store,
// status counters, ledger, risk manager, circuit breaker, history store and
// venue adapters. There are no ambient globals; the scheduler owns the
// engine and drives it.
//
// Pipeline per evaluation (stream -> indicators -> refiner -> breaker ->
// risk -> execution -> ledger -> history):
//   1. stale-data check — skip with a recorded warning
//   2. auto-exit scan — stops before targets, lot by lot
//   3. refiner decision on the strategy snapshot taken at tick start
//   4. circuit breaker — tripped reasons land in the Decision record
//   5. risk gates — a rejected BUY is journalled as HOLD with reasons
//   6. execution simulation + idempotent order submission
//   7. ledger commit, then Fill + Trade + PositionSnapshot records
//
// Write ordering per symbol is Decision -> Order -> Fill -> Snapshot; the
// scheduler serializes all calls for one symbol onto one task.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breaker::{BreakerInputs, CircuitBreaker};
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::execution::{ExecutionSimulator, ExitOutcome};
use crate::history::{
    idempotency_key, DecisionRecord, FillRecord, HistoryStore, OrderRecord, SnapshotRecord,
    TradeRecord,
};
use crate::indicators::{IndicatorEngine, IndicatorSnapshot};
use crate::ledger::PositionLedger;
use crate::market::adapter::PaperVenueAdapter;
use crate::market::MarketStream;
use crate::money;
use crate::risk::{BuyContext, RiskManager, RiskVerdict};
use crate::strategy::refiner::{DecisionContext, Refiner, RefinerDecision, MIN_BARS};
use crate::strategy::StrategyStore;
use crate::types::{ExitReason, OrderStatus, Regime, Side, Signal};

/// Paper account starting balance (quote currency).
pub const STARTING_BALANCE: f64 = 1_000.0;

/// What fired the evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalTrigger {
    CandleClose,
    Tick,
}

/// Outcome reported back to the scheduler (and to tests).
#[derive(Debug, Clone)]
pub enum EvalOutcome {
    /// Evaluation skipped before any journal write.
    Skipped { reason: String },
    /// Decision recorded, no order submitted.
    Held { decision_id: String },
    /// Decision recorded and an order path completed.
    Executed {
        decision_id: String,
        trade_id: Option<String>,
        order_status: OrderStatus,
    },
}

// =============================================================================
// Engine status
// =============================================================================

/// Process-wide counters surfaced by `GET /api/status`.
pub struct EngineStatus {
    pub running: AtomicBool,
    pub last_heartbeat_ms: AtomicI64,
    pub evaluations: AtomicU64,
    pub signals: AtomicU64,
    pub trades_executed: AtomicU64,
    pub auto_paper: AtomicBool,
    confidence_threshold: RwLock<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub running: bool,
    pub last_heartbeat: i64,
    pub evaluations: u64,
    pub signals: u64,
    pub trades_executed: u64,
    pub open_positions: usize,
    pub auto_paper: bool,
    pub confidence_threshold: f64,
}

impl EngineStatus {
    fn new(auto_paper: bool, confidence_threshold: f64) -> Self {
        Self {
            running: AtomicBool::new(true),
            last_heartbeat_ms: AtomicI64::new(now_ms()),
            evaluations: AtomicU64::new(0),
            signals: AtomicU64::new(0),
            trades_executed: AtomicU64::new(0),
            auto_paper: AtomicBool::new(auto_paper),
            confidence_threshold: RwLock::new(confidence_threshold),
        }
    }

    pub fn confidence_threshold(&self) -> f64 {
        *self.confidence_threshold.read()
    }

    pub fn set_confidence_threshold(&self, value: f64) {
        *self.confidence_threshold.write() = value.clamp(0.0, 1.0);
    }

    pub fn heartbeat(&self) {
        self.last_heartbeat_ms.store(now_ms(), Ordering::Relaxed);
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Engine
// =============================================================================

pub struct Engine {
    pub config: EngineConfig,
    pub status: EngineStatus,
    pub strategy: StrategyStore,
    pub ledger: PositionLedger,
    pub breaker: CircuitBreaker,
    pub risk: RiskManager,
    pub history: Arc<dyn HistoryStore>,
    pub stream: Arc<MarketStream>,
    pub events: EventBus,
    pub adapters: Vec<Arc<PaperVenueAdapter>>,

    indicators: RwLock<HashMap<String, IndicatorEngine>>,
    /// Inactivity clock per symbol (epoch ms of the last executed trade).
    last_trade_ms: RwLock<HashMap<String, i64>>,
    /// De-dup guard: latest bar ts an order was submitted for, per symbol.
    last_executed_bar: RwLock<HashMap<String, i64>>,
    /// Single-flight flag for the refinement cycle.
    pub refinement_in_flight: AtomicBool,
    boot_ms: i64,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        strategy: StrategyStore,
        history: Arc<dyn HistoryStore>,
        stream: Arc<MarketStream>,
        events: EventBus,
        adapters: Vec<Arc<PaperVenueAdapter>>,
    ) -> Self {
        let status = EngineStatus::new(config.auto_paper, config.confidence_threshold);
        let risk = RiskManager::new(config.max_position_size_pct, config.max_exposure_pct);
        Self {
            config,
            status,
            strategy,
            ledger: PositionLedger::new(money::usd(STARTING_BALANCE)),
            breaker: CircuitBreaker::default(),
            risk,
            history,
            stream,
            events,
            adapters,
            indicators: RwLock::new(HashMap::new()),
            last_trade_ms: RwLock::new(HashMap::new()),
            last_executed_bar: RwLock::new(HashMap::new()),
            refinement_in_flight: AtomicBool::new(false),
            boot_ms: now_ms(),
        }
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            running: self.status.running.load(Ordering::Relaxed),
            last_heartbeat: self.status.last_heartbeat_ms.load(Ordering::Relaxed),
            evaluations: self.status.evaluations.load(Ordering::Relaxed),
            signals: self.status.signals.load(Ordering::Relaxed),
            trades_executed: self.status.trades_executed.load(Ordering::Relaxed),
            open_positions: self.ledger.open_lot_count(),
            auto_paper: self.status.auto_paper.load(Ordering::Relaxed),
            confidence_threshold: self.status.confidence_threshold(),
        }
    }

    // ── Bar ingestion ───────────────────────────────────────────────────

    /// Feed one closed bar into the symbol's incremental indicators and fan
    /// the mark price out to the venue adapters.
    pub fn ingest_closed_bar(&self, symbol: &str, candle: &crate::market::Candle) {
        let mut engines = self.indicators.write();
        let engine = engines
            .entry(symbol.to_string())
            .or_insert_with(|| IndicatorEngine::new(symbol));
        if let Some(snap) = engine.update(candle) {
            self.events.publish(EngineEvent::IndicatorUpdate {
                symbol: symbol.to_string(),
                atr_pct: snap.atr_pct,
                rsi: snap.rsi,
            });
        }
        for adapter in &self.adapters {
            adapter.set_mark(symbol, candle.close, candle.close_ts);
        }
    }

    /// Replay the buffered bars into the indicator engine (after bootstrap).
    pub fn warm_up(&self, symbol: &str) {
        let bars = self.stream.buffer(symbol);
        for bar in &bars {
            self.ingest_closed_bar(symbol, bar);
        }
        debug!(symbol, bars = bars.len(), "indicator warm-up complete");
    }

    fn indicator_snapshot(&self, symbol: &str) -> Option<IndicatorSnapshot> {
        self.indicators.read().get(symbol).and_then(|e| e.latest())
    }

    fn bars_seen(&self, symbol: &str) -> usize {
        self.indicators
            .read()
            .get(symbol)
            .map(|e| e.bars_seen())
            .unwrap_or(0)
    }

    fn mark_price(&self, symbol: &str) -> Option<f64> {
        self.stream.ring().mark_price(&self.stream.key(symbol))
    }

    fn mark_prices(&self) -> HashMap<String, f64> {
        self.config
            .symbols
            .iter()
            .filter_map(|s| self.mark_price(s).map(|p| (s.clone(), p)))
            .collect()
    }

    fn idle_ms(&self, symbol: &str) -> i64 {
        let last = self
            .last_trade_ms
            .read()
            .get(symbol)
            .copied()
            .unwrap_or(self.boot_ms);
        (now_ms() - last).max(0)
    }

    // ── Evaluation pipeline ─────────────────────────────────────────────

    /// Evaluate one symbol. Called from the symbol's scheduler task only,
    /// which is what serializes all ledger and journal mutations per symbol.
    pub async fn evaluate_symbol(&self, symbol: &str, trigger: EvalTrigger) -> EvalOutcome {
        self.status.evaluations.fetch_add(1, Ordering::Relaxed);
        self.status.heartbeat();

        let bars = self.stream.buffer(symbol);
        let Some(latest) = bars.last().cloned() else {
            return EvalOutcome::Skipped {
                reason: format!("{symbol}: no bars buffered"),
            };
        };

        // Stale-data gate.
        let age_ms = now_ms() - latest.close_ts;
        if age_ms > self.config.stale_data_ms {
            let reason = format!("{symbol}: latest bar is {age_ms} ms old, skipping evaluation");
            warn!(symbol, age_ms, "stale market data");
            self.strategy.push_warning(now_ms(), reason.clone());
            return EvalOutcome::Skipped { reason };
        }

        // Auto-exits run before any new entry for the symbol.
        self.check_auto_exits(symbol).await;

        // Copy-on-write parameter snapshot for the whole tick.
        let params = self.strategy.parameters();
        let strategy_version = self.strategy.version();

        let ctx = DecisionContext {
            has_holdings: self.ledger.holdings(symbol) > Decimal::ZERO,
            idle_ms: self.idle_ms(symbol),
            strategy_version,
        };

        let snapshot = self.indicator_snapshot(symbol);
        let mut decision = match (&snapshot, self.bars_seen(symbol)) {
            (Some(snap), seen) if seen >= MIN_BARS => {
                Refiner::decide_from_snapshot(snap, &params, &ctx)
            }
            (_, seen) => RefinerDecision {
                action: Signal::Hold,
                confidence: 0.2,
                regime: Regime::Ranging,
                score: 0.0,
                model_version: strategy_version,
                reasons: vec![format!("insufficient history: {seen} bars < {MIN_BARS}")],
            },
        };

        // Circuit breaker: evaluated every tick; reasons join the record.
        let atr_pct = snapshot.as_ref().map(|s| s.atr_pct).unwrap_or(0.0);
        let equity = self.ledger.portfolio_value(&self.mark_prices());
        let daily_pnl = money::to_f64(self.risk.daily_pnl());
        let drawdown = if daily_pnl < 0.0 && money::to_f64(equity) > 0.0 {
            -daily_pnl / money::to_f64(equity)
        } else {
            0.0
        };
        let tripped = self.breaker.evaluate(
            &BreakerInputs {
                daily_drawdown_pct: drawdown,
                consecutive_large_losses: self.risk.consecutive_large_losses(),
                volatility_pct: atr_pct,
                stream_unstable: self.stream.is_unstable(symbol),
            },
            now_ms(),
        );
        if tripped {
            let snap = self.breaker.snapshot();
            decision
                .reasons
                .push(format!("circuit breaker latched: {}", snap.reasons.join("; ")));
            if decision.action != Signal::Hold {
                decision.action = Signal::Hold;
            }
            self.events.publish(EngineEvent::BreakerTripped {
                reasons: snap.reasons,
            });
        }

        // Risk gates for BUYs run before the Decision record so a rejection
        // journals as HOLD with the gate's reasons.
        let mut approved_order = None;
        if decision.action == Signal::Buy {
            let snap = snapshot.as_ref().expect("BUY implies indicators ready");
            let verdict = self.risk.evaluate_buy(&BuyContext {
                symbol,
                price: snap.close,
                atr: snap.atr,
                atr_pct: snap.atr_pct,
                regime: decision.regime,
                balance: self.ledger.balance(),
                equity,
                symbol_exposure: self.ledger.exposure(symbol),
                total_exposure: self.total_exposure(),
                open_lots: self.ledger.open_lot_count(),
                params: &params,
            });
            match verdict {
                RiskVerdict::Approved(order) => approved_order = Some(order),
                RiskVerdict::Rejected { reasons } => {
                    decision.action = Signal::Hold;
                    decision
                        .reasons
                        .extend(reasons.into_iter().map(|r| format!("risk: {r}")));
                }
            }
        }

        // Confidence and auto-paper gates.
        if decision.action != Signal::Hold {
            if decision.confidence < self.status.confidence_threshold() {
                decision.reasons.push(format!(
                    "confidence {:.3} below threshold {:.3}",
                    decision.confidence,
                    self.status.confidence_threshold()
                ));
                decision.action = Signal::Hold;
                approved_order = None;
            } else if !self.status.auto_paper.load(Ordering::Relaxed) {
                decision.reasons.push("auto-paper disabled".to_string());
                decision.action = Signal::Hold;
                approved_order = None;
            }
        }

        // One Decision record per evaluation tick, keyed to the bar ts.
        let record = self.build_decision_record(symbol, latest.ts, &decision, snapshot.as_ref());
        let decision_id = record.id.clone();
        if let Err(e) = self.history.record_decision(&record).await {
            warn!(symbol, error = %e, "failed to journal decision");
            return EvalOutcome::Skipped {
                reason: format!("journal write failed: {e}"),
            };
        }
        self.events.publish(EngineEvent::DecisionMade {
            symbol: symbol.to_string(),
            signal: decision.action,
            confidence: decision.confidence,
            regime: decision.regime,
        });

        if decision.action == Signal::Hold {
            return EvalOutcome::Held { decision_id };
        }
        self.status.signals.fetch_add(1, Ordering::Relaxed);

        // De-dup guard: one execution attempt per bar per symbol.
        {
            let guard = self.last_executed_bar.read();
            if guard.get(symbol) == Some(&latest.ts) {
                debug!(symbol, bar_ts = latest.ts, trigger = ?trigger, "bar already executed, skipping order");
                return EvalOutcome::Held { decision_id };
            }
        }

        let snap = snapshot.expect("non-HOLD implies indicators ready");
        let outcome = match decision.action {
            Signal::Buy => {
                let order = approved_order.expect("approved order present for BUY");
                self.execute_entry(symbol, &latest, &snap, &decision, &decision_id, order)
                    .await
            }
            Signal::Sell => {
                self.execute_signal_exit(symbol, &latest, &snap, &decision, &decision_id)
                    .await
            }
            Signal::Hold => unreachable!(),
        };

        if let Ok(status) = &outcome {
            self.last_executed_bar
                .write()
                .insert(symbol.to_string(), latest.ts);
            return EvalOutcome::Executed {
                decision_id,
                trade_id: status.0.clone(),
                order_status: status.1,
            };
        }
        if let Err(e) = outcome {
            warn!(symbol, error = %e, "execution path failed");
        }
        EvalOutcome::Held { decision_id }
    }

    fn total_exposure(&self) -> Decimal {
        self.config
            .symbols
            .iter()
            .map(|s| self.ledger.exposure(s))
            .sum()
    }

    fn build_decision_record(
        &self,
        symbol: &str,
        bar_ts: i64,
        decision: &RefinerDecision,
        snapshot: Option<&IndicatorSnapshot>,
    ) -> DecisionRecord {
        // Hash the inputs that produced this decision for audit replay.
        let mut hasher = Sha256::new();
        hasher.update(symbol.as_bytes());
        hasher.update(bar_ts.to_be_bytes());
        hasher.update(decision.model_version.to_be_bytes());
        if let Some(snap) = snapshot {
            hasher.update(snap.close.to_bits().to_be_bytes());
            hasher.update(snap.atr.to_bits().to_be_bytes());
            hasher.update(snap.rsi.to_bits().to_be_bytes());
        }
        let inputs_hash = hex::encode(&hasher.finalize()[..16]);

        DecisionRecord {
            id: Uuid::new_v4().to_string(),
            ts: bar_ts,
            symbol: symbol.to_string(),
            timeframe: self.config.timeframe.clone(),
            inputs_hash,
            signal: decision.action,
            confidence: decision.confidence,
            reasons: decision.reasons.clone(),
            model_version: decision.model_version,
            regime: Some(decision.regime),
        }
    }

    // ── Entry path ──────────────────────────────────────────────────────

    async fn execute_entry(
        &self,
        symbol: &str,
        bar: &crate::market::Candle,
        snap: &IndicatorSnapshot,
        decision: &RefinerDecision,
        decision_id: &str,
        order: crate::risk::ApprovedOrder,
    ) -> Result<(Option<String>, OrderStatus)> {
        let key = idempotency_key(symbol, &self.config.timeframe, bar.ts, Side::Buy);
        if let Some(existing) = self.history.find_active_order(&key).await? {
            return self
                .record_skip(symbol, decision_id, &key, Side::Buy, existing.ts)
                .await;
        }

        let sim = ExecutionSimulator::simulate(
            symbol,
            bar.ts,
            Side::Buy,
            snap.close,
            snap.atr_pct,
            order.qty,
            self.config.fee_rate(),
        );

        let order_record = OrderRecord {
            order_id: Uuid::new_v4().to_string(),
            decision_id: decision_id.to_string(),
            idempotency_key: key,
            symbol: symbol.to_string(),
            side: Side::Buy,
            qty: money::qty(order.qty),
            requested_price: money::price(snap.close),
            status: OrderStatus::Accepted,
            ts: now_ms(),
        };
        self.history.record_order(&order_record).await?;

        let lot = self.ledger.open_lot(
            symbol,
            money::price(sim.fill_price),
            money::qty(order.qty),
            money::usd(sim.fees),
            money::price(order.stop_loss),
            money::price(order.take_profit),
            bar.ts,
            money::qty(order.stop_distance),
            decision.model_version,
        );

        let Some(lot) = lot else {
            let rejected = OrderRecord {
                status: OrderStatus::Rejected,
                ts: now_ms(),
                ..order_record
            };
            self.history.record_order(&rejected).await?;
            return Ok((None, OrderStatus::Rejected));
        };

        // Ledger committed — only now may the FILLED fill be journalled.
        let fill = FillRecord {
            fill_id: Uuid::new_v4().to_string(),
            order_id: order_record.order_id.clone(),
            avg_price: money::price(sim.fill_price),
            qty: money::qty(order.qty),
            fees: money::usd(sim.fees),
            status: OrderStatus::Filled,
            ts: now_ms(),
        };
        self.history.record_fill(&fill).await?;

        let trade = TradeRecord {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: Side::Buy,
            price: money::price(sim.fill_price),
            amount: money::qty(order.qty),
            ts: now_ms(),
            fee: money::usd(sim.fees),
            pnl: None,
            r_multiple: None,
            exit_reason: None,
            simulation: sim,
            decision_id: decision_id.to_string(),
            entry_score: decision.score,
            entry_atr_pct: snap.atr_pct,
            regime: Some(decision.regime),
            strategy_version: decision.model_version,
            arbitrage_id: None,
        };
        self.history.record_trade(&trade).await?;
        self.write_snapshot(symbol).await?;

        self.status.trades_executed.fetch_add(1, Ordering::Relaxed);
        self.last_trade_ms
            .write()
            .insert(symbol.to_string(), now_ms());
        self.events.publish(EngineEvent::TradeExecuted {
            symbol: symbol.to_string(),
            trade_id: trade.id.clone(),
        });
        info!(
            symbol,
            lot_id = %lot.id,
            fill = trade.price.to_string(),
            qty = %trade.amount,
            "entry filled"
        );
        Ok((Some(trade.id), OrderStatus::Filled))
    }

    // ── Exit paths ──────────────────────────────────────────────────────

    /// Signal-driven exit: close the full position at the bar close.
    async fn execute_signal_exit(
        &self,
        symbol: &str,
        bar: &crate::market::Candle,
        snap: &IndicatorSnapshot,
        decision: &RefinerDecision,
        decision_id: &str,
    ) -> Result<(Option<String>, OrderStatus)> {
        let holdings = self.ledger.holdings(symbol);
        let Some(qty) = self.risk.evaluate_sell(holdings, None) else {
            return Ok((None, OrderStatus::Rejected));
        };
        self.close_slice(
            symbol,
            bar.ts,
            snap.close,
            snap.atr_pct,
            qty,
            None,
            ExitReason::Signal,
            decision_id,
            decision.score,
            decision.model_version,
            None,
        )
        .await
    }

    /// Scan the symbol's lots against the mark price and close any whose
    /// stop or target was crossed. Stop-loss is checked before take-profit.
    pub async fn check_auto_exits(&self, symbol: &str) {
        let Some(mark) = self.mark_price(symbol) else {
            return;
        };
        let hits = self.ledger.lots_hit(symbol, mark);
        for (idx, (lot, reason)) in hits.into_iter().enumerate() {
            // Synthetic decision so the journal explains the exit; each lot
            // gets its own decision ts to keep order keys distinct.
            let decision_ts = now_ms() + idx as i64;
            let decision = DecisionRecord {
                id: Uuid::new_v4().to_string(),
                ts: decision_ts,
                symbol: symbol.to_string(),
                timeframe: self.config.timeframe.clone(),
                inputs_hash: String::new(),
                signal: Signal::Sell,
                confidence: 1.0,
                reasons: vec![format!("auto exit {reason} for lot {}", lot.id)],
                model_version: lot.strategy_version,
                regime: None,
            };
            if let Err(e) = self.history.record_decision(&decision).await {
                warn!(symbol, error = %e, "failed to journal auto-exit decision");
                continue;
            }
            // Each auto-exit is its own evaluation + signal, so a filled
            // protective exit keeps trades <= signals <= evaluations even
            // when the scan runs off the mark timer between evaluations.
            self.status.evaluations.fetch_add(1, Ordering::Relaxed);
            self.status.signals.fetch_add(1, Ordering::Relaxed);
            let atr_pct = self
                .indicator_snapshot(symbol)
                .map(|s| s.atr_pct)
                .unwrap_or(0.0);
            if let Err(e) = self
                .close_slice(
                    symbol,
                    decision_ts,
                    mark,
                    atr_pct,
                    lot.amount,
                    Some(&lot.id),
                    reason,
                    &decision.id,
                    0.0,
                    lot.strategy_version,
                    None,
                )
                .await
            {
                warn!(symbol, lot_id = %lot.id, error = %e, "auto exit failed");
            }
        }
    }

    /// Shared SELL path: idempotent order, simulated fill, FIFO consume,
    /// realized PnL, journals and snapshot.
    #[allow(clippy::too_many_arguments)]
    async fn close_slice(
        &self,
        symbol: &str,
        decision_ts: i64,
        close: f64,
        atr_pct: f64,
        qty: Decimal,
        target_lot: Option<&str>,
        reason: ExitReason,
        decision_id: &str,
        entry_score: f64,
        strategy_version: u64,
        arbitrage_id: Option<String>,
    ) -> Result<(Option<String>, OrderStatus)> {
        let key = idempotency_key(symbol, &self.config.timeframe, decision_ts, Side::Sell);
        if let Some(existing) = self.history.find_active_order(&key).await? {
            return self
                .record_skip(symbol, decision_id, &key, Side::Sell, existing.ts)
                .await;
        }

        let qty_f = money::to_f64(qty);
        let sim = ExecutionSimulator::simulate(
            symbol,
            decision_ts,
            Side::Sell,
            close,
            atr_pct,
            qty_f,
            self.config.fee_rate(),
        );

        let order_record = OrderRecord {
            order_id: Uuid::new_v4().to_string(),
            decision_id: decision_id.to_string(),
            idempotency_key: key,
            symbol: symbol.to_string(),
            side: Side::Sell,
            qty: money::qty(qty_f),
            requested_price: money::price(close),
            status: OrderStatus::Accepted,
            ts: now_ms(),
        };
        self.history.record_order(&order_record).await?;

        let Some(slice) = self.ledger.consume(symbol, qty, target_lot) else {
            let rejected = OrderRecord {
                status: OrderStatus::Rejected,
                ts: now_ms(),
                ..order_record
            };
            self.history.record_order(&rejected).await?;
            return Ok((None, OrderStatus::Rejected));
        };

        // Settle proceeds and realized PnL for the consumed slice.
        let slice_qty_f = money::to_f64(slice.qty);
        let exit_fee = sim.fee_rate * sim.fill_price * slice_qty_f;
        let entry_fee = money::to_f64(slice.entry_fee_per_unit) * slice_qty_f;
        let outcome: ExitOutcome = ExecutionSimulator::exit_outcome(
            money::to_f64(slice.entry_price),
            sim.fill_price,
            slice_qty_f,
            entry_fee,
            exit_fee,
            money::to_f64(slice.initial_risk_per_unit),
        );
        let proceeds = money::usd(sim.fill_price * slice_qty_f - exit_fee);
        self.ledger.credit_proceeds(proceeds);
        self.risk
            .record_trade_result(money::usd(outcome.pnl), outcome.r_multiple);

        let fill = FillRecord {
            fill_id: Uuid::new_v4().to_string(),
            order_id: order_record.order_id.clone(),
            avg_price: money::price(sim.fill_price),
            qty: slice.qty,
            fees: money::usd(exit_fee),
            status: OrderStatus::Filled,
            ts: now_ms(),
        };
        self.history.record_fill(&fill).await?;

        let trade = TradeRecord {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: Side::Sell,
            price: money::price(sim.fill_price),
            amount: slice.qty,
            ts: now_ms(),
            fee: money::usd(exit_fee),
            pnl: Some(money::usd(outcome.pnl)),
            r_multiple: Some(outcome.r_multiple),
            exit_reason: Some(reason),
            simulation: sim,
            decision_id: decision_id.to_string(),
            entry_score,
            entry_atr_pct: atr_pct,
            regime: None,
            strategy_version,
            arbitrage_id,
        };
        self.history.record_trade(&trade).await?;
        self.write_snapshot(symbol).await?;

        self.status.trades_executed.fetch_add(1, Ordering::Relaxed);
        self.last_trade_ms
            .write()
            .insert(symbol.to_string(), now_ms());
        self.events.publish(EngineEvent::TradeExecuted {
            symbol: symbol.to_string(),
            trade_id: trade.id.clone(),
        });
        info!(
            symbol,
            reason = %reason,
            pnl = outcome.pnl,
            r = outcome.r_multiple,
            "exit filled"
        );
        Ok((Some(trade.id), OrderStatus::Filled))
    }

    async fn record_skip(
        &self,
        symbol: &str,
        decision_id: &str,
        key: &str,
        side: Side,
        _existing_ts: i64,
    ) -> Result<(Option<String>, OrderStatus)> {
        info!(symbol, key, "duplicate order suppressed by idempotency key");
        let skip = OrderRecord {
            order_id: Uuid::new_v4().to_string(),
            decision_id: decision_id.to_string(),
            idempotency_key: key.to_string(),
            symbol: symbol.to_string(),
            side,
            qty: Decimal::ZERO,
            requested_price: Decimal::ZERO,
            status: OrderStatus::Skipped,
            ts: now_ms(),
        };
        self.history.record_order(&skip).await?;
        Ok((None, OrderStatus::Skipped))
    }

    async fn write_snapshot(&self, symbol: &str) -> Result<()> {
        let snapshot = SnapshotRecord {
            ts: now_ms(),
            symbol: symbol.to_string(),
            balance: self.ledger.balance(),
            position_size: self.ledger.holdings(symbol),
            avg_entry_price: self.ledger.avg_entry(symbol),
            total_portfolio_value: self.ledger.portfolio_value(&self.mark_prices()),
        };
        self.history
            .record_snapshot(&snapshot)
            .await
            .context("failed to journal position snapshot")
    }

    // ── Force trade ─────────────────────────────────────────────────────

    /// Operator-initiated trade from the HTTP façade. Reuses the idempotent
    /// order path; the caller-supplied decision id keys the idempotency
    /// lookup so a retried POST cannot double-fill.
    pub async fn force_trade(&self, req: ForceTradeRequest) -> Result<ForceTradeResponse> {
        let symbol = crate::types::normalize_symbol(&req.symbol);
        let side: Side = req.side.parse().map_err(anyhow::Error::msg)?;
        let price = self
            .mark_price(&symbol)
            .with_context(|| format!("no market data for {symbol}"))?;

        let decision_id = req
            .decision_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        // Manual trades key their order on the decision id (stable across
        // retries) rather than a bar ts.
        let decision_ts = stable_ts_from_id(&decision_id);

        self.status.evaluations.fetch_add(1, Ordering::Relaxed);

        let qty = match (req.qty, req.notional_usd) {
            (Some(q), _) if q > 0.0 => q,
            (_, Some(n)) if n > 0.0 => n / price,
            _ => anyhow::bail!("force trade requires qty or notionalUsd"),
        };

        let decision = DecisionRecord {
            id: decision_id.clone(),
            ts: decision_ts,
            symbol: symbol.clone(),
            timeframe: self.config.timeframe.clone(),
            inputs_hash: String::new(),
            signal: match side {
                Side::Buy => Signal::Buy,
                Side::Sell => Signal::Sell,
            },
            confidence: 1.0,
            reasons: vec!["manual force trade".to_string()],
            model_version: self.strategy.version(),
            regime: None,
        };
        self.history.record_decision(&decision).await?;
        self.status.signals.fetch_add(1, Ordering::Relaxed);

        let atr_pct = self
            .indicator_snapshot(&symbol)
            .map(|s| s.atr_pct)
            .unwrap_or(0.0);

        let (trade_id, order_status) = match side {
            Side::Buy => {
                let sl = req
                    .sl_price
                    .unwrap_or_else(|| price * (1.0 - req.sl_pct.unwrap_or(1.0) / 100.0));
                let tp = req
                    .tp_price
                    .unwrap_or_else(|| price * (1.0 + req.tp_pct.unwrap_or(1.5) / 100.0));
                self.force_entry(&symbol, decision_ts, price, atr_pct, qty, sl, tp, &decision_id)
                    .await?
            }
            Side::Sell => {
                let holdings = self.ledger.holdings(&symbol);
                let Some(sell_qty) = self.risk.evaluate_sell(holdings, Some(money::qty(qty)))
                else {
                    anyhow::bail!("no holdings to sell for {symbol}");
                };
                self.close_slice(
                    &symbol,
                    decision_ts,
                    price,
                    atr_pct,
                    sell_qty,
                    None,
                    ExitReason::Manual,
                    &decision_id,
                    1.0,
                    self.strategy.version(),
                    None,
                )
                .await?
            }
        };

        Ok(ForceTradeResponse {
            trade_id,
            decision_id,
            order_status,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn force_entry(
        &self,
        symbol: &str,
        decision_ts: i64,
        price: f64,
        atr_pct: f64,
        qty: f64,
        stop_loss: f64,
        take_profit: f64,
        decision_id: &str,
    ) -> Result<(Option<String>, OrderStatus)> {
        let key = idempotency_key(symbol, &self.config.timeframe, decision_ts, Side::Buy);
        if let Some(existing) = self.history.find_active_order(&key).await? {
            return self
                .record_skip(symbol, decision_id, &key, Side::Buy, existing.ts)
                .await;
        }

        let sim = ExecutionSimulator::simulate(
            symbol,
            decision_ts,
            Side::Buy,
            price,
            atr_pct,
            qty,
            self.config.fee_rate(),
        );

        let order_record = OrderRecord {
            order_id: Uuid::new_v4().to_string(),
            decision_id: decision_id.to_string(),
            idempotency_key: key,
            symbol: symbol.to_string(),
            side: Side::Buy,
            qty: money::qty(qty),
            requested_price: money::price(price),
            status: OrderStatus::Accepted,
            ts: now_ms(),
        };
        self.history.record_order(&order_record).await?;

        let lot = self.ledger.open_lot(
            symbol,
            money::price(sim.fill_price),
            money::qty(qty),
            money::usd(sim.fees),
            money::price(stop_loss),
            money::price(take_profit),
            decision_ts,
            money::qty((price - stop_loss).max(0.0)),
            self.strategy.version(),
        );
        let Some(_lot) = lot else {
            let rejected = OrderRecord {
                status: OrderStatus::Rejected,
                ts: now_ms(),
                ..order_record
            };
            self.history.record_order(&rejected).await?;
            return Ok((None, OrderStatus::Rejected));
        };

        let fill = FillRecord {
            fill_id: Uuid::new_v4().to_string(),
            order_id: order_record.order_id.clone(),
            avg_price: money::price(sim.fill_price),
            qty: money::qty(qty),
            fees: money::usd(sim.fees),
            status: OrderStatus::Filled,
            ts: now_ms(),
        };
        self.history.record_fill(&fill).await?;

        let trade = TradeRecord {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: Side::Buy,
            price: money::price(sim.fill_price),
            amount: money::qty(qty),
            ts: now_ms(),
            fee: money::usd(sim.fees),
            pnl: None,
            r_multiple: None,
            exit_reason: None,
            simulation: sim,
            decision_id: decision_id.to_string(),
            entry_score: 1.0,
            entry_atr_pct: atr_pct,
            regime: None,
            strategy_version: self.strategy.version(),
            arbitrage_id: None,
        };
        self.history.record_trade(&trade).await?;
        self.write_snapshot(symbol).await?;
        self.status.trades_executed.fetch_add(1, Ordering::Relaxed);
        self.last_trade_ms
            .write()
            .insert(symbol.to_string(), now_ms());

        Ok((Some(trade.id), OrderStatus::Filled))
    }
}

/// Map an arbitrary id onto a stable pseudo-timestamp so retried manual
/// requests derive the same idempotency key.
fn stable_ts_from_id(id: &str) -> i64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) >> 1) as i64
}

/// `POST /api/force-trade` request body.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceTradeRequest {
    pub symbol: String,
    pub side: String,
    #[serde(default)]
    pub notional_usd: Option<f64>,
    #[serde(default)]
    pub qty: Option<f64>,
    #[serde(default)]
    pub tp_pct: Option<f64>,
    #[serde(default)]
    pub sl_pct: Option<f64>,
    #[serde(default)]
    pub tp_price: Option<f64>,
    #[serde(default)]
    pub sl_price: Option<f64>,
    #[serde(default)]
    pub decision_id: Option<String>,
}

/// `POST /api/force-trade` response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceTradeResponse {
    pub trade_id: Option<String>,
    pub decision_id: String,
    pub order_status: OrderStatus,
}
