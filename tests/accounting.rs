// =============================================================================
// Accounting and strategy properties: PnL identity, walk-forward windows,
// refiner determinism and strategy versioning
// =============================================================================

mod common;

use borealis_engine::execution::ExecutionSimulator;
use borealis_engine::ledger::PositionLedger;
use borealis_engine::money;
use borealis_engine::strategy::metrics::TradeOutcome;
use borealis_engine::strategy::params::StrategyParameters;
use borealis_engine::strategy::refiner::{DecisionContext, Refiner};
use borealis_engine::strategy::walk_forward::WalkForward;
use borealis_engine::strategy::StrategyStore;
use rust_decimal::Decimal;

// S3: 1000 synthetic round trips settle to `1000 + sum(pnl)` exactly.
#[test]
fn pnl_identity_over_thousand_trades() {
    let starting = money::usd(1_000.0);
    let ledger = PositionLedger::new(starting);
    let fee_rate = 0.001;
    let qty = 0.1;

    let mut pnl_sum = Decimal::ZERO;
    for i in 0..1_000u32 {
        let entry = 100.0 + (i % 20) as f64 * 0.2;
        let exit = entry * if i % 2 == 0 { 1.004 } else { 0.996 };

        let entry_fee = money::usd(fee_rate * entry * qty);
        let lot = ledger
            .open_lot(
                "BTC-USDT",
                money::price(entry),
                money::qty(qty),
                entry_fee,
                money::price(entry - 2.0),
                money::price(entry + 4.0),
                i as i64,
                money::qty(2.0),
                1,
            )
            .expect("lot opens");

        let slice = ledger
            .consume("BTC-USDT", lot.amount, Some(&lot.id))
            .expect("slice consumes");
        let exit_fee = money::usd(fee_rate * exit * money::to_f64(slice.qty));
        let proceeds = money::price(exit) * slice.qty - exit_fee;
        ledger.credit_proceeds(proceeds);

        // pnl for this trade, in the same Decimal domain the ledger used:
        // proceeds minus the exact amount the entry debited.
        let cost = slice.entry_price * slice.qty + entry_fee;
        pnl_sum += proceeds - cost;
    }

    let equity = ledger.balance();
    let expected = starting + pnl_sum;
    let drift = (equity - expected).abs();
    assert!(
        drift < Decimal::new(1, 8),
        "equity drifted from pnl identity by {drift}"
    );
    assert_eq!(ledger.holdings("BTC-USDT"), Decimal::ZERO);
}

// The fill model's exit accounting matches the hand-computed formula.
#[test]
fn exit_outcome_matches_manual_formula() {
    for i in 0..50 {
        let entry = 100.0 + i as f64 * 0.2;
        let exit = entry * 1.004;
        let qty = 0.1;
        let entry_fee = 0.001 * entry * qty;
        let exit_fee = 0.001 * exit * qty;
        let outcome =
            ExecutionSimulator::exit_outcome(entry, exit, qty, entry_fee, exit_fee, 2.0);
        let manual = (exit - entry) * qty - entry_fee - exit_fee;
        assert!((outcome.pnl - manual).abs() < 1e-12);
        assert!((outcome.r_multiple - manual / 0.2).abs() < 1e-12);
    }
}

// S4: walk-forward over >= 120 synthetic trades yields N >= 1 windows with
// well-defined statistics and an accepted count bounded by N.
#[test]
fn walk_forward_windows_are_well_defined() {
    let trades: Vec<TradeOutcome> = (0..150)
        .map(|i| TradeOutcome {
            ts: i as i64 * 1_000,
            symbol: "BTC-USDT".into(),
            pnl: if i % 5 == 0 { -4.0 } else { 2.5 },
            r_multiple: if i % 5 == 0 { -1.0 } else { 0.6 },
            regime: None,
        })
        .collect();

    let windows = WalkForward::run(&trades, 5);
    assert!(!windows.is_empty());
    let accepted = windows.iter().filter(|w| w.accepted).count();
    assert!(accepted <= windows.len());
    for w in &windows {
        assert!(w.trades >= 20);
        assert!(w.sharpe.is_finite());
        assert!(w.drawdown_pct.is_finite() && w.drawdown_pct >= 0.0);
        assert!(w.profit_factor >= 0.0);
        assert!(w.start_ts <= w.end_ts);
    }
}

// P5: the refiner is a pure function over candles (100 identical calls).
// P6: +-0.1% perturbations keep the action on >= 60% of 20 trials.
#[test]
fn refiner_is_deterministic_and_robust() {
    let candles: Vec<_> = (0..80)
        .map(|i| common::bar(80 - i, 60_000.0 + 10.0 * i as f64))
        .collect();
    let params = StrategyParameters::default();
    let ctx = DecisionContext {
        has_holdings: false,
        idle_ms: 0,
        strategy_version: 1,
    };

    let report = Refiner::stability_audit(&candles, &params, &ctx);
    assert!(report.deterministic, "decide must be bit-identical over reruns");
    assert_eq!(report.max_confidence_delta, 0.0);
    assert!(
        report.is_robust(),
        "only {}/{} perturbation trials agreed",
        report.robustness_agreements,
        report.robustness_trials
    );
}

// P7: versions are strictly monotonic and history is bounded at 40.
#[test]
fn strategy_versioning_is_monotonic_and_bounded() {
    let store = StrategyStore::ephemeral();
    let mut last = store.version();
    for i in 0..60 {
        let v = store.commit(StrategyParameters::default(), "cycle", i);
        assert!(v > last, "version must strictly increase");
        last = v;
    }
    assert_eq!(store.snapshot().history.len(), 40);
}
