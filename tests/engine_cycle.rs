// =============================================================================
// End-to-end engine cycle scenarios driven through the public pipeline
// =============================================================================

mod common;

use borealis_engine::engine::{EvalOutcome, EvalTrigger, ForceTradeRequest};
use borealis_engine::money;
use borealis_engine::types::{ExitReason, OrderStatus, Side, Signal};
use common::{bar, build_engine, feed_bar, feed_series};
use rust_decimal::Decimal;

// S1/S2: one cycle over 60 synthetic rising candles records a decision for
// the symbol with a legal action and the configured timeframe.
#[tokio::test]
async fn cycle_records_decision_for_symbol() {
    let harness = build_engine(&["BTC-USDT"]);
    feed_series(&harness, "BTC-USDT", 60, 60_000.0, 10.0).await;

    let outcome = harness
        .engine
        .evaluate_symbol("BTC-USDT", EvalTrigger::Tick)
        .await;
    assert!(
        !matches!(outcome, EvalOutcome::Skipped { .. }),
        "evaluation must not skip on fresh data: {outcome:?}"
    );

    let decisions = harness.engine.history.recent_decisions(10).await.unwrap();
    assert!(!decisions.is_empty());
    let newest = &decisions[0];
    assert_eq!(newest.symbol, "BTC-USDT");
    assert_eq!(newest.timeframe, "1h");
    assert!(matches!(
        newest.signal,
        Signal::Buy | Signal::Sell | Signal::Hold
    ));
    assert!((0.1..=1.0).contains(&newest.confidence));
    assert!(!newest.reasons.is_empty());

    let status = harness.engine.status_snapshot();
    assert_eq!(status.evaluations, 1);
    assert!(status.trades_executed <= status.signals);
    assert!(status.signals <= status.evaluations);
}

// The tick trigger keeps recording decisions on the same bar; the journal
// grows but the de-dup guard keeps executions at most one per bar.
#[tokio::test]
async fn repeated_ticks_record_decisions_without_double_execution() {
    let harness = build_engine(&["BTC-USDT"]);
    feed_series(&harness, "BTC-USDT", 60, 60_000.0, 10.0).await;

    for _ in 0..3 {
        harness
            .engine
            .evaluate_symbol("BTC-USDT", EvalTrigger::Tick)
            .await;
    }
    let decisions = harness.engine.history.recent_decisions(10).await.unwrap();
    assert!(decisions.len() >= 3);

    let status = harness.engine.status_snapshot();
    assert_eq!(status.evaluations, 3);
    assert!(status.trades_executed <= 1, "at most one execution per bar");
}

// S5: two force trades with the same decision id produce exactly one filled
// trade and one SKIPPED order, with no second ledger mutation.
#[tokio::test]
async fn duplicate_force_trade_is_idempotent() {
    let harness = build_engine(&["ETH-USDC"]);
    feed_bar(&harness, "ETH-USDC", bar(1, 2_000.0)).await;

    let request = ForceTradeRequest {
        symbol: "ETHUSDC".into(),
        side: "BUY".into(),
        notional_usd: Some(100.0),
        qty: None,
        tp_pct: Some(1.5),
        sl_pct: Some(1.0),
        tp_price: None,
        sl_price: None,
        decision_id: Some("force-1".into()),
    };

    let first = harness.engine.force_trade(request.clone()).await.unwrap();
    assert_eq!(first.order_status, OrderStatus::Filled);
    assert!(first.trade_id.is_some());
    let holdings_after_first = harness.engine.ledger.holdings("ETH-USDC");
    assert!(holdings_after_first > Decimal::ZERO);

    let second = harness.engine.force_trade(request).await.unwrap();
    assert_eq!(second.order_status, OrderStatus::Skipped);
    assert!(second.trade_id.is_none());
    assert_eq!(second.decision_id, "force-1");
    assert_eq!(
        harness.engine.ledger.holdings("ETH-USDC"),
        holdings_after_first,
        "replay must not mutate the ledger"
    );

    let trades = harness.engine.history.recent_trades(10).await.unwrap();
    let buys: Vec<_> = trades.iter().filter(|t| t.side == Side::Buy).collect();
    assert_eq!(buys.len(), 1, "exactly one OPEN trade");
}

// S6: a lot with entry 100, stop 98, target 104 exits once when the mark
// ticks to 98, with STOP_LOSS and pnl near -2 minus fees; later scans do
// not reopen or re-close.
#[tokio::test]
async fn stop_loss_auto_exit_fires_once() {
    let harness = build_engine(&["BTC-USDT"]);
    feed_bar(&harness, "BTC-USDT", bar(2, 100.0)).await;

    let open = harness
        .engine
        .force_trade(ForceTradeRequest {
            symbol: "BTC-USDT".into(),
            side: "BUY".into(),
            notional_usd: None,
            qty: Some(1.0),
            tp_pct: None,
            sl_pct: None,
            tp_price: Some(104.0),
            sl_price: Some(98.0),
            decision_id: None,
        })
        .await
        .unwrap();
    assert_eq!(open.order_status, OrderStatus::Filled);

    // Mark ticks down to the stop.
    feed_bar(&harness, "BTC-USDT", bar(1, 98.0)).await;
    harness.engine.check_auto_exits("BTC-USDT").await;

    let trades = harness.engine.history.recent_trades(10).await.unwrap();
    let exits: Vec<_> = trades.iter().filter(|t| t.side == Side::Sell).collect();
    assert_eq!(exits.len(), 1);
    let exit = exits[0];
    assert_eq!(exit.exit_reason, Some(ExitReason::StopLoss));

    let pnl = money::to_f64(exit.pnl.expect("SELL trades carry pnl"));
    // Entry filled slightly above 100, exit slightly below 98, fees on both
    // legs: the loss lands near -2 and never better than -1.5.
    assert!(pnl < -1.5 && pnl > -3.0, "pnl {pnl} outside expected band");
    assert_eq!(harness.engine.ledger.holdings("BTC-USDT"), Decimal::ZERO);

    // Subsequent scans are no-ops.
    harness.engine.check_auto_exits("BTC-USDT").await;
    harness.engine.check_auto_exits("BTC-USDT").await;
    let trades = harness.engine.history.recent_trades(10).await.unwrap();
    assert_eq!(
        trades.iter().filter(|t| t.side == Side::Sell).count(),
        1,
        "stop exit must not repeat"
    );

    // The protective exit books its own evaluation + signal, so the status
    // counters stay ordered: trades <= signals <= evaluations.
    let status = harness.engine.status_snapshot();
    assert_eq!(status.trades_executed, 2); // entry + stop exit
    assert!(status.trades_executed <= status.signals);
    assert!(status.signals <= status.evaluations);
}

// P3: a filled entry leaves Decision -> Order -> Fill -> Snapshot in the
// journals, in that order.
#[tokio::test]
async fn journal_ordering_for_filled_entry() {
    let harness = build_engine(&["BTC-USDT"]);
    feed_bar(&harness, "BTC-USDT", bar(1, 50_000.0)).await;

    harness
        .engine
        .force_trade(ForceTradeRequest {
            symbol: "BTC-USDT".into(),
            side: "BUY".into(),
            notional_usd: Some(500.0),
            qty: None,
            tp_pct: Some(2.0),
            sl_pct: Some(1.0),
            tp_price: None,
            sl_price: None,
            decision_id: Some("ordering-test".into()),
        })
        .await
        .unwrap();

    let read_lines = |name: &str| -> Vec<serde_json::Value> {
        let path = harness.dir.join(name);
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    };

    let decisions = read_lines("decisions.jsonl");
    let orders = read_lines("orders.jsonl");
    let fills = read_lines("fills.jsonl");
    let snapshots = read_lines("snapshots.jsonl");

    assert_eq!(decisions.len(), 1);
    assert_eq!(orders.len(), 1);
    assert_eq!(fills.len(), 1);
    assert_eq!(snapshots.len(), 1);
    assert_eq!(orders[0]["status"], "ACCEPTED");
    assert_eq!(fills[0]["status"], "FILLED");
    assert_eq!(orders[0]["decision_id"], "ordering-test");
    assert_eq!(fills[0]["order_id"], orders[0]["order_id"]);

    // The snapshot reflects the post-fill ledger.
    let balance: f64 = snapshots[0]["balance"]
        .as_str()
        .map(|s| s.parse().unwrap())
        .unwrap_or_else(|| snapshots[0]["balance"].as_f64().unwrap());
    assert!(balance < 1_000.0, "entry must debit the balance");
}

// P1/P2: holdings never go negative and portfolio value equals balance plus
// marked holdings after a round trip.
#[tokio::test]
async fn accounting_identities_hold_after_round_trip() {
    let harness = build_engine(&["BTC-USDT"]);
    feed_bar(&harness, "BTC-USDT", bar(2, 100.0)).await;

    harness
        .engine
        .force_trade(ForceTradeRequest {
            symbol: "BTC-USDT".into(),
            side: "BUY".into(),
            notional_usd: None,
            qty: Some(2.0),
            tp_pct: None,
            sl_pct: None,
            tp_price: Some(110.0),
            sl_price: Some(95.0),
            decision_id: None,
        })
        .await
        .unwrap();

    harness
        .engine
        .force_trade(ForceTradeRequest {
            symbol: "BTC-USDT".into(),
            side: "SELL".into(),
            notional_usd: None,
            qty: Some(2.0),
            tp_pct: None,
            sl_pct: None,
            tp_price: None,
            sl_price: None,
            decision_id: None,
        })
        .await
        .unwrap();

    assert_eq!(harness.engine.ledger.holdings("BTC-USDT"), Decimal::ZERO);

    let mut marks = std::collections::HashMap::new();
    marks.insert("BTC-USDT".to_string(), 100.0);
    let portfolio = harness.engine.ledger.portfolio_value(&marks);
    assert_eq!(portfolio, harness.engine.ledger.balance());
}
