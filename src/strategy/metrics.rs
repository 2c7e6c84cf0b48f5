// =============================================================================
// Performance metrics over closed trades — inputs to the refinement cycle
// =============================================================================
//
// Three views over the same trade list:
//   * PerformanceMetrics — aggregate win-rate / profit-factor / drawdown /
//     average R.
//   * ConditionBuckets   — PnL bucketed by the regime active at entry.
//   * LossClusters       — maximal runs of consecutive losing trades.
// =============================================================================

use std::collections::HashMap;

use serde::Serialize;

use crate::types::Regime;

/// Minimal closed-trade view the metrics layer consumes. History records map
/// into this so the strategy layer never depends on the journal schema.
#[derive(Debug, Clone)]
pub struct TradeOutcome {
    pub ts: i64,
    pub symbol: String,
    pub pnl: f64,
    pub r_multiple: f64,
    pub regime: Option<Regime>,
}

/// Aggregate statistics over a chronological trade list.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub profit_factor: f64,
    pub net_pnl: f64,
    pub avg_r: f64,
    pub expectancy: f64,
    /// Peak-to-trough drawdown of the cumulative PnL curve, as a fraction of
    /// the peak (0 when the curve never declines).
    pub drawdown_pct: f64,
    /// Per-trade Sharpe-like ratio: mean / stddev of trade PnL.
    pub sharpe: f64,
}

impl PerformanceMetrics {
    pub fn compute(trades: &[TradeOutcome]) -> Self {
        let total_trades = trades.len();
        if total_trades == 0 {
            return Self::empty();
        }

        let wins = trades.iter().filter(|t| t.pnl > 0.0).count();
        let losses = trades.iter().filter(|t| t.pnl < 0.0).count();
        let gross_profit: f64 = trades.iter().map(|t| t.pnl).filter(|p| *p > 0.0).sum();
        let gross_loss: f64 = trades
            .iter()
            .map(|t| t.pnl)
            .filter(|p| *p < 0.0)
            .map(f64::abs)
            .sum();
        let net_pnl = gross_profit - gross_loss;

        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let avg_r = trades.iter().map(|t| t.r_multiple).sum::<f64>() / total_trades as f64;
        let win_rate = wins as f64 / total_trades as f64;
        let avg_win = if wins > 0 { gross_profit / wins as f64 } else { 0.0 };
        let avg_loss = if losses > 0 { gross_loss / losses as f64 } else { 0.0 };
        let expectancy = win_rate * avg_win - (1.0 - win_rate) * avg_loss;

        // Drawdown over the cumulative PnL curve.
        let mut equity = 0.0_f64;
        let mut peak = 0.0_f64;
        let mut max_dd = 0.0_f64;
        for t in trades {
            equity += t.pnl;
            peak = peak.max(equity);
            if peak > 0.0 {
                max_dd = max_dd.max((peak - equity) / peak);
            }
        }

        let mean = net_pnl / total_trades as f64;
        let variance = trades
            .iter()
            .map(|t| (t.pnl - mean).powi(2))
            .sum::<f64>()
            / total_trades as f64;
        let sharpe = if variance > 0.0 {
            mean / variance.sqrt()
        } else {
            0.0
        };

        Self {
            total_trades,
            wins,
            losses,
            win_rate,
            gross_profit,
            gross_loss,
            profit_factor,
            net_pnl,
            avg_r,
            expectancy,
            drawdown_pct: max_dd,
            sharpe,
        }
    }

    pub fn empty() -> Self {
        Self {
            total_trades: 0,
            wins: 0,
            losses: 0,
            win_rate: 0.0,
            gross_profit: 0.0,
            gross_loss: 0.0,
            profit_factor: 0.0,
            net_pnl: 0.0,
            avg_r: 0.0,
            expectancy: 0.0,
            drawdown_pct: 0.0,
            sharpe: 0.0,
        }
    }
}

/// PnL bucketed by the regime active when the trade was entered.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConditionBuckets {
    pub by_regime: HashMap<String, RegimeBucket>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegimeBucket {
    pub trades: usize,
    pub wins: usize,
    pub net_pnl: f64,
}

impl ConditionBuckets {
    pub fn compute(trades: &[TradeOutcome]) -> Self {
        let mut by_regime: HashMap<String, RegimeBucket> = HashMap::new();
        for t in trades {
            let label = t
                .regime
                .map(|r| r.to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string());
            let bucket = by_regime.entry(label).or_default();
            bucket.trades += 1;
            if t.pnl > 0.0 {
                bucket.wins += 1;
            }
            bucket.net_pnl += t.pnl;
        }
        Self { by_regime }
    }
}

/// One maximal run of consecutive losing trades.
#[derive(Debug, Clone, Serialize)]
pub struct LossCluster {
    pub start_ts: i64,
    pub end_ts: i64,
    pub length: usize,
    pub total_loss: f64,
}

/// All maximal loss runs of length >= 2, chronological.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LossClusters {
    pub clusters: Vec<LossCluster>,
}

impl LossClusters {
    pub fn compute(trades: &[TradeOutcome]) -> Self {
        let mut clusters = Vec::new();
        let mut run: Vec<&TradeOutcome> = Vec::new();

        for t in trades {
            if t.pnl < 0.0 {
                run.push(t);
            } else {
                Self::flush(&mut run, &mut clusters);
            }
        }
        Self::flush(&mut run, &mut clusters);

        Self { clusters }
    }

    fn flush(run: &mut Vec<&TradeOutcome>, clusters: &mut Vec<LossCluster>) {
        if run.len() >= 2 {
            clusters.push(LossCluster {
                start_ts: run.first().map(|t| t.ts).unwrap_or(0),
                end_ts: run.last().map(|t| t.ts).unwrap_or(0),
                length: run.len(),
                total_loss: run.iter().map(|t| t.pnl).sum(),
            });
        }
        run.clear();
    }

    pub fn longest(&self) -> usize {
        self.clusters.iter().map(|c| c.length).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(ts: i64, pnl: f64, r: f64) -> TradeOutcome {
        TradeOutcome {
            ts,
            symbol: "BTC-USDT".into(),
            pnl,
            r_multiple: r,
            regime: Some(if pnl > 0.0 {
                Regime::TrendingUp
            } else {
                Regime::Ranging
            }),
        }
    }

    #[test]
    fn empty_input_gives_empty_metrics() {
        let m = PerformanceMetrics::compute(&[]);
        assert_eq!(m.total_trades, 0);
        assert_eq!(m.profit_factor, 0.0);
    }

    #[test]
    fn profit_factor_and_win_rate() {
        let trades = vec![
            trade(1, 10.0, 1.0),
            trade(2, -5.0, -1.0),
            trade(3, 15.0, 1.5),
            trade(4, -5.0, -1.0),
        ];
        let m = PerformanceMetrics::compute(&trades);
        assert_eq!(m.total_trades, 4);
        assert_eq!(m.wins, 2);
        assert!((m.win_rate - 0.5).abs() < 1e-12);
        assert!((m.profit_factor - 2.5).abs() < 1e-12);
        assert!((m.net_pnl - 15.0).abs() < 1e-12);
        assert!((m.avg_r - 0.125).abs() < 1e-12);
    }

    #[test]
    fn all_wins_gives_infinite_profit_factor() {
        let trades = vec![trade(1, 5.0, 1.0), trade(2, 3.0, 0.5)];
        let m = PerformanceMetrics::compute(&trades);
        assert!(m.profit_factor.is_infinite());
        assert_eq!(m.drawdown_pct, 0.0);
    }

    #[test]
    fn drawdown_measures_peak_to_trough() {
        // Equity: 10 -> 20 -> 5 (drawdown 15/20 = 0.75) -> 25.
        let trades = vec![
            trade(1, 10.0, 1.0),
            trade(2, 10.0, 1.0),
            trade(3, -15.0, -2.0),
            trade(4, 20.0, 2.0),
        ];
        let m = PerformanceMetrics::compute(&trades);
        assert!((m.drawdown_pct - 0.75).abs() < 1e-12);
    }

    #[test]
    fn buckets_group_by_regime() {
        let trades = vec![trade(1, 10.0, 1.0), trade(2, -5.0, -1.0), trade(3, 2.0, 0.2)];
        let b = ConditionBuckets::compute(&trades);
        assert_eq!(b.by_regime.get("TRENDING_UP").unwrap().trades, 2);
        assert_eq!(b.by_regime.get("RANGING").unwrap().trades, 1);
    }

    #[test]
    fn loss_clusters_find_maximal_runs() {
        let trades = vec![
            trade(1, -1.0, -1.0),
            trade(2, -2.0, -1.0),
            trade(3, 5.0, 1.0),
            trade(4, -1.0, -1.0),
            trade(5, -1.0, -1.0),
            trade(6, -1.0, -1.0),
        ];
        let c = LossClusters::compute(&trades);
        assert_eq!(c.clusters.len(), 2);
        assert_eq!(c.longest(), 3);
        assert!((c.clusters[1].total_loss - -3.0).abs() < 1e-12);
    }

    #[test]
    fn single_loss_is_not_a_cluster() {
        let trades = vec![trade(1, 5.0, 1.0), trade(2, -1.0, -1.0), trade(3, 5.0, 1.0)];
        let c = LossClusters::compute(&trades);
        assert!(c.clusters.is_empty());
    }
}
