// =============================================================================
// Scheduler — per-symbol evaluation triggers + refinement cadence
// =============================================================================
//
// Owns the `Engine` and drives it:
//
//   * One task per symbol, selecting over {closed-bar channel, 60 s tick,
//     mark-scan tick, shutdown}. Everything that mutates a symbol's ledger
//     or journals runs on that one task — the single-writer actor.
//   * The 60 s tick guarantees a decision is recorded even when the stream
//     stalls; the engine's per-bar guard keeps the two triggers from
//     executing the same bar twice.
//   * A separate 60 s loop starts a refinement cycle when 24 h have passed
//     since the last one and none is in flight.
//
// Shutdown: flip the watch channel, wait up to 30 s for an in-flight
// refinement, then let journals close with the process.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::engine::{Engine, EvalTrigger};
use crate::strategy::refinement::{HeuristicAdvisor, RefinementCycle};
use crate::strategy::walk_forward::TradeSample;

/// Fixed evaluation tick.
pub const EVAL_TICK_SECS: u64 = 60;
/// Refinement cadence and its polling interval.
pub const REFINEMENT_INTERVAL_MS: i64 = 24 * 3_600_000;
pub const REFINEMENT_CHECK_SECS: u64 = 60;
/// Bars seeded at bootstrap.
const BOOTSTRAP_BARS: usize = 300;
/// Closed-bar channel depth per symbol (back-pressure bound).
const HANDLER_CHANNEL_DEPTH: usize = 64;
/// Shutdown grace for an in-flight refinement.
const SHUTDOWN_REFINEMENT_GRACE_SECS: u64 = 30;
/// Cross-venue scan cadence and the paper notional per opportunity.
const ARBITRAGE_SCAN_SECS: u64 = 30;
const ARBITRAGE_NOTIONAL_USD: f64 = 100.0;

pub struct Scheduler {
    engine: Arc<Engine>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            engine,
            shutdown_tx,
        }
    }

    pub fn engine(&self) -> Arc<Engine> {
        self.engine.clone()
    }

    /// Bootstrap, subscribe and spawn all loops. Returns once everything is
    /// launched; the tasks run until shutdown.
    pub async fn start(&self) {
        let symbols = self.engine.config.symbols.clone();

        for symbol in &symbols {
            // REST bootstrap; a failure leaves the symbol unstable and the
            // breaker gates its evaluations.
            match self.engine.stream.bootstrap(symbol, BOOTSTRAP_BARS).await {
                Ok(bars) => info!(symbol, bars, "symbol bootstrapped"),
                Err(e) => warn!(symbol, error = %e, "bootstrap failed, starting cold"),
            }
            self.engine.warm_up(symbol);

            let (bar_tx, bar_rx) = mpsc::channel(HANDLER_CHANNEL_DEPTH);
            self.engine
                .stream
                .subscribe(symbol, bar_tx, self.shutdown_tx.subscribe());

            Self::spawn_symbol_task(
                self.engine.clone(),
                symbol.clone(),
                bar_rx,
                self.shutdown_tx.subscribe(),
            );
        }
        info!(count = symbols.len(), "symbol evaluation tasks launched");

        Self::spawn_refinement_task(self.engine.clone(), self.shutdown_tx.subscribe());
        Self::spawn_arbitrage_task(self.engine.clone(), self.shutdown_tx.subscribe());
    }

    /// The per-symbol single-writer actor.
    fn spawn_symbol_task(
        engine: Arc<Engine>,
        symbol: String,
        mut bars: mpsc::Receiver<crate::market::ClosedBar>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            let mut eval_tick =
                tokio::time::interval(tokio::time::Duration::from_secs(EVAL_TICK_SECS));
            eval_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut mark_tick = tokio::time::interval(tokio::time::Duration::from_millis(
                engine.config.loop_ms.max(1_000),
            ));
            mark_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    maybe_bar = bars.recv() => {
                        match maybe_bar {
                            Some(bar) => {
                                engine.ingest_closed_bar(&bar.symbol, &bar.candle);
                                let outcome = engine
                                    .evaluate_symbol(&bar.symbol, EvalTrigger::CandleClose)
                                    .await;
                                tracing::debug!(symbol = %bar.symbol, ?outcome, "candle-close evaluation");
                            }
                            None => {
                                warn!(symbol = %symbol, "closed-bar channel ended");
                                break;
                            }
                        }
                    }
                    _ = eval_tick.tick() => {
                        let outcome = engine.evaluate_symbol(&symbol, EvalTrigger::Tick).await;
                        tracing::debug!(symbol = %symbol, ?outcome, "tick evaluation");
                    }
                    _ = mark_tick.tick() => {
                        // Fast protective scan between evaluations.
                        engine.check_auto_exits(&symbol).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(symbol = %symbol, "symbol task stopped");
        });
    }

    /// 24 h refinement cadence with a single-flight guard.
    fn spawn_refinement_task(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut check =
                tokio::time::interval(tokio::time::Duration::from_secs(REFINEMENT_CHECK_SECS));
            loop {
                tokio::select! {
                    _ = check.tick() => {
                        let now = chrono::Utc::now().timestamp_millis();
                        let last = engine.strategy.last_refinement_time();
                        let due = last == 0 || now - last >= REFINEMENT_INTERVAL_MS;
                        if due {
                            run_refinement(&engine, false).await;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("refinement task stopped");
        });
    }

    /// Opportunistic cross-venue scan. Paper-sized legs; every fill is
    /// journalled with its arbitrage id.
    fn spawn_arbitrage_task(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let adapters: Vec<Arc<dyn crate::market::adapter::MarketAdapter>> = engine
                .adapters
                .iter()
                .map(|a| a.clone() as Arc<dyn crate::market::adapter::MarketAdapter>)
                .collect();
            let orchestrator = crate::arbitrage::ArbitrageOrchestrator::new(
                adapters,
                engine.history.clone(),
                engine.config.min_expected_edge,
                engine.config.paper_slippage_bps / 10_000.0,
            );

            let mut scan = tokio::time::interval(tokio::time::Duration::from_secs(
                ARBITRAGE_SCAN_SECS,
            ));
            loop {
                tokio::select! {
                    _ = scan.tick() => {
                        for symbol in &engine.config.symbols {
                            match orchestrator.scan(symbol).await {
                                Ok(Some(opportunity)) => {
                                    let qty = ARBITRAGE_NOTIONAL_USD / opportunity.buy_ask;
                                    match orchestrator.execute(&opportunity, qty).await {
                                        Ok(outcome) => info!(symbol = %symbol, ?outcome, "arbitrage executed"),
                                        Err(e) => warn!(symbol = %symbol, error = %e, "arbitrage execution failed"),
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => warn!(symbol = %symbol, error = %e, "arbitrage scan failed"),
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("arbitrage task stopped");
        });
    }

    /// Signal all tasks to stop and wait out an in-flight refinement.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now()
            + tokio::time::Duration::from_secs(SHUTDOWN_REFINEMENT_GRACE_SECS);
        while self.engine.refinement_in_flight.load(Ordering::Relaxed) {
            if tokio::time::Instant::now() >= deadline {
                warn!("refinement still in flight at shutdown deadline, abandoning");
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
        }
        self.engine
            .status
            .running
            .store(false, Ordering::Relaxed);
        info!("scheduler shut down");
    }
}

/// Run one refinement cycle now (scheduled or forced). Swallows every error
/// into strategy warnings per the refinement contract.
pub async fn run_refinement(engine: &Arc<Engine>, force: bool) {
    if engine
        .refinement_in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        if force {
            warn!("refinement already in flight, force request ignored");
        }
        return;
    }

    let now = chrono::Utc::now().timestamp_millis();
    let since = now - REFINEMENT_INTERVAL_MS;
    let samples = match engine.history.trades_since(since).await {
        Ok(trades) => trades
            .iter()
            .filter(|t| t.pnl.is_some())
            .map(|t| TradeSample {
                outcome: crate::strategy::metrics::TradeOutcome {
                    ts: t.ts,
                    symbol: t.symbol.clone(),
                    pnl: t
                        .pnl
                        .map(crate::money::to_f64)
                        .unwrap_or(0.0),
                    r_multiple: t.r_multiple.unwrap_or(0.0),
                    regime: t.regime,
                },
                entry_score: t.entry_score,
                entry_atr_pct: t.entry_atr_pct,
            })
            .collect::<Vec<_>>(),
        Err(e) => {
            error!(error = %e, "failed to load trades for refinement");
            engine
                .strategy
                .push_warning(now, format!("refinement aborted, journal read failed: {e}"));
            engine.refinement_in_flight.store(false, Ordering::SeqCst);
            return;
        }
    };

    info!(samples = samples.len(), force, "refinement cycle starting");
    let outcome = RefinementCycle::run(&engine.strategy, &samples, &HeuristicAdvisor, now);
    info!(?outcome, "refinement cycle finished");
    engine.refinement_in_flight.store(false, Ordering::SeqCst);
}
