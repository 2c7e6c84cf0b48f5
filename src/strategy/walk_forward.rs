// =============================================================================
// Walk-forward testing — chronological train/test evaluation of candidates
// =============================================================================
//
// Two entry points:
//   * `split_filter` — the refinement-cycle acceptance test: 70/30 split,
//     forward trades re-filtered under both baseline and candidate
//     parameters, candidate accepted only if it does not degrade drawdown
//     or profit factor and keeps enough forward trades.
//   * `run` — rolling chronological windows with per-window sharpe /
//     profit-factor / drawdown, for the analysis surface.
//
// The split is strictly chronological; no trade from the forward segment
// ever informs the training segment.
// =============================================================================

use serde::Serialize;

use crate::strategy::metrics::{PerformanceMetrics, TradeOutcome};
use crate::strategy::params::StrategyParameters;

/// A closed trade plus the entry conditions parameter filters key on.
#[derive(Debug, Clone)]
pub struct TradeSample {
    pub outcome: TradeOutcome,
    /// Setup score at entry time.
    pub entry_score: f64,
    /// `atr/close` at entry time.
    pub entry_atr_pct: f64,
}

impl TradeSample {
    /// Would this trade have been taken under `params`?
    fn passes(&self, params: &StrategyParameters) -> bool {
        self.entry_score >= params.min_score
            && self.entry_atr_pct >= params.min_atr_pct
            && self.entry_atr_pct <= params.max_atr_pct
    }
}

/// Fraction of trades assigned to the training segment.
const TRAIN_FRACTION: f64 = 0.7;
/// Absolute floor on forward trades for a meaningful comparison.
const MIN_FORWARD_TRADES: usize = 6;

/// Outcome of the 70/30 candidate acceptance test.
#[derive(Debug, Clone, Serialize)]
pub struct SplitVerdict {
    pub accepted: bool,
    pub baseline_forward_trades: usize,
    pub candidate_forward_trades: usize,
    pub baseline_profit_factor: f64,
    pub candidate_profit_factor: f64,
    pub baseline_drawdown_pct: f64,
    pub candidate_drawdown_pct: f64,
    pub reasons: Vec<String>,
}

/// One rolling walk-forward window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    pub start_ts: i64,
    pub end_ts: i64,
    pub trades: usize,
    pub sharpe: f64,
    pub profit_factor: f64,
    pub drawdown_pct: f64,
    pub accepted: bool,
}

pub struct WalkForward;

impl WalkForward {
    /// 70/30 acceptance test for a refinement candidate.
    ///
    /// The candidate is accepted iff, on the forward segment:
    ///   * its drawdown is not worse than the baseline's,
    ///   * its profit factor is at least the baseline's, and
    ///   * it keeps at least `max(6, 0.5 * baseline_count)` trades.
    pub fn split_filter(
        samples: &[TradeSample],
        baseline: &StrategyParameters,
        candidate: &StrategyParameters,
    ) -> SplitVerdict {
        let mut ordered: Vec<&TradeSample> = samples.iter().collect();
        ordered.sort_by_key(|s| s.outcome.ts);

        let split = ((ordered.len() as f64) * TRAIN_FRACTION).floor() as usize;
        let forward = &ordered[split.min(ordered.len())..];

        let baseline_forward: Vec<TradeOutcome> = forward
            .iter()
            .filter(|s| s.passes(baseline))
            .map(|s| s.outcome.clone())
            .collect();
        let candidate_forward: Vec<TradeOutcome> = forward
            .iter()
            .filter(|s| s.passes(candidate))
            .map(|s| s.outcome.clone())
            .collect();

        let base_metrics = PerformanceMetrics::compute(&baseline_forward);
        let cand_metrics = PerformanceMetrics::compute(&candidate_forward);

        let mut reasons = Vec::new();
        let required =
            MIN_FORWARD_TRADES.max((baseline_forward.len() as f64 * 0.5).ceil() as usize);

        let enough_trades = candidate_forward.len() >= required;
        if !enough_trades {
            reasons.push(format!(
                "candidate keeps {} forward trades, requires {required}",
                candidate_forward.len()
            ));
        }

        let drawdown_ok = cand_metrics.drawdown_pct <= base_metrics.drawdown_pct;
        if !drawdown_ok {
            reasons.push(format!(
                "drawdown worsened: {:.4} > {:.4}",
                cand_metrics.drawdown_pct, base_metrics.drawdown_pct
            ));
        }

        // Infinite profit factors (no losses) compare as equal.
        let pf_ok = cand_metrics.profit_factor >= base_metrics.profit_factor
            || (cand_metrics.profit_factor.is_infinite()
                && base_metrics.profit_factor.is_infinite());
        if !pf_ok {
            reasons.push(format!(
                "profit factor degraded: {:.4} < {:.4}",
                cand_metrics.profit_factor, base_metrics.profit_factor
            ));
        }

        SplitVerdict {
            accepted: enough_trades && drawdown_ok && pf_ok,
            baseline_forward_trades: baseline_forward.len(),
            candidate_forward_trades: candidate_forward.len(),
            baseline_profit_factor: base_metrics.profit_factor,
            candidate_profit_factor: cand_metrics.profit_factor,
            baseline_drawdown_pct: base_metrics.drawdown_pct,
            candidate_drawdown_pct: cand_metrics.drawdown_pct,
            reasons,
        }
    }

    /// Rolling windowed analysis over a chronological trade list.
    ///
    /// Splits the trades into up to `max_windows` equal chronological chunks
    /// (at least 20 trades each) and reports per-window statistics. A window
    /// is accepted when it is profitable with bounded drawdown.
    pub fn run(trades: &[TradeOutcome], max_windows: usize) -> Vec<WindowReport> {
        if trades.is_empty() || max_windows == 0 {
            return Vec::new();
        }
        let mut ordered: Vec<&TradeOutcome> = trades.iter().collect();
        ordered.sort_by_key(|t| t.ts);

        let window_size = (ordered.len() / max_windows).max(20).max(1);
        let mut reports = Vec::new();

        for chunk in ordered.chunks(window_size) {
            if chunk.len() < window_size.min(20) && !reports.is_empty() {
                break; // ignore a short tail chunk
            }
            let outcomes: Vec<TradeOutcome> = chunk.iter().map(|t| (*t).clone()).collect();
            let metrics = PerformanceMetrics::compute(&outcomes);
            reports.push(WindowReport {
                start_ts: chunk.first().map(|t| t.ts).unwrap_or(0),
                end_ts: chunk.last().map(|t| t.ts).unwrap_or(0),
                trades: chunk.len(),
                sharpe: metrics.sharpe,
                profit_factor: metrics.profit_factor,
                drawdown_pct: metrics.drawdown_pct,
                accepted: metrics.net_pnl > 0.0 && metrics.drawdown_pct < 0.5,
            });
        }

        reports
    }
}
