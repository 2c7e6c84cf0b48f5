// =============================================================================
// Refinement Cycle — 24 h parameter tuning with walk-forward acceptance
// =============================================================================
//
// Steps per cycle:
//   1. Gather closed trades from the last 24 h; require >= 20, else skip
//      with a warning.
//   2. Build performance metrics, regime buckets and loss clusters.
//   3. Ask the advisor for a candidate {min_score, atr_multiplier,
//      stop_loss_atr}; fall back to the deterministic heuristic when the
//      advisor is unavailable or errors.
//   4. Bound every delta to ±15 % of the current value, then re-clamp to the
//      global sanitizer bounds.
//   5. Walk-forward 70/30 acceptance; commit on accept, retain and warn on
//      reject.
//
// Every failure path is swallowed into a strategy warning; the previous
// parameter set always survives a broken cycle.
// =============================================================================

use serde::Serialize;
use tracing::{info, warn};

use crate::strategy::metrics::{ConditionBuckets, LossClusters, PerformanceMetrics};
use crate::strategy::params::{bound_delta, StrategyParameters};
use crate::strategy::state::StrategyStore;
use crate::strategy::walk_forward::{TradeSample, WalkForward};

/// Minimum closed trades in the lookback before a cycle may run.
pub const MIN_TRADES_FOR_REFINEMENT: usize = 20;
/// Maximum per-parameter relative change per cycle.
const MAX_DELTA_PCT: f64 = 0.15;

/// The three tunables a cycle may adjust.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CandidateProposal {
    pub min_score: f64,
    pub atr_multiplier: f64,
    pub stop_loss_atr: f64,
}

/// Seam for the external advisory service. The engine only depends on this
/// trait; the heuristic below is the always-available implementation.
pub trait StrategyAdvisor: Send + Sync {
    fn propose(
        &self,
        current: &StrategyParameters,
        metrics: &PerformanceMetrics,
        buckets: &ConditionBuckets,
        clusters: &LossClusters,
    ) -> anyhow::Result<CandidateProposal>;
}

/// Deterministic fallback advisor.
///
/// * Weak win-rate        -> raise the score floor (fewer, better setups).
/// * Meaningful drawdown  -> tighten the global ATR multiplier.
/// * Weak average R       -> tighten the stop distance.
pub struct HeuristicAdvisor;

impl StrategyAdvisor for HeuristicAdvisor {
    fn propose(
        &self,
        current: &StrategyParameters,
        metrics: &PerformanceMetrics,
        _buckets: &ConditionBuckets,
        clusters: &LossClusters,
    ) -> anyhow::Result<CandidateProposal> {
        let mut min_score = current.min_score;
        let mut atr_multiplier = current.atr_multiplier;
        let mut stop_loss_atr = current.stop_loss_atr;

        if metrics.win_rate < 0.45 {
            min_score *= 1.05;
        }
        if metrics.drawdown_pct > 0.03 || clusters.longest() >= 3 {
            atr_multiplier *= 0.9;
        }
        if metrics.avg_r < 0.1 {
            stop_loss_atr *= 0.92;
        }

        Ok(CandidateProposal {
            min_score,
            atr_multiplier,
            stop_loss_atr,
        })
    }
}

/// What a completed cycle did.
#[derive(Debug, Clone, Serialize)]
pub enum RefinementOutcome {
    /// Too few trades; nothing evaluated.
    Skipped { reason: String },
    /// Candidate accepted and committed as `version`.
    Committed { version: u64 },
    /// Candidate rejected by walk-forward; previous parameters retained.
    Rejected { reasons: Vec<String> },
}

pub struct RefinementCycle;

impl RefinementCycle {
    /// Run one refinement cycle over the given closed-trade samples.
    ///
    /// The caller is responsible for cadence (24 h) and the single-flight
    /// guard; this function is synchronous and side-effects only through
    /// `store`.
    pub fn run(
        store: &StrategyStore,
        samples: &[TradeSample],
        advisor: &dyn StrategyAdvisor,
        now_ms: i64,
    ) -> RefinementOutcome {
        if samples.len() < MIN_TRADES_FOR_REFINEMENT {
            let reason = format!(
                "refinement skipped: {} closed trades < {MIN_TRADES_FOR_REFINEMENT}",
                samples.len()
            );
            store.push_warning(now_ms, reason.clone());
            store.mark_refinement(now_ms);
            return RefinementOutcome::Skipped { reason };
        }

        let current = store.parameters();
        let outcomes: Vec<_> = samples.iter().map(|s| s.outcome.clone()).collect();
        let metrics = PerformanceMetrics::compute(&outcomes);
        let buckets = ConditionBuckets::compute(&outcomes);
        let clusters = LossClusters::compute(&outcomes);

        let proposal = match advisor.propose(&current, &metrics, &buckets, &clusters) {
            Ok(p) => p,
            Err(e) => {
                store.push_warning(now_ms, format!("advisor failed ({e}), using heuristic"));
                match HeuristicAdvisor.propose(&current, &metrics, &buckets, &clusters) {
                    Ok(p) => p,
                    Err(e) => {
                        // The heuristic is infallible in practice; treat a
                        // failure like any other broken cycle.
                        store.push_warning(now_ms, format!("heuristic failed: {e}"));
                        store.mark_refinement(now_ms);
                        return RefinementOutcome::Skipped {
                            reason: "no candidate available".to_string(),
                        };
                    }
                }
            }
        };

        let candidate = StrategyParameters {
            min_score: bound_delta(current.min_score, proposal.min_score, MAX_DELTA_PCT),
            atr_multiplier: bound_delta(
                current.atr_multiplier,
                proposal.atr_multiplier,
                MAX_DELTA_PCT,
            ),
            stop_loss_atr: bound_delta(current.stop_loss_atr, proposal.stop_loss_atr, MAX_DELTA_PCT),
            ..current.clone()
        }
        .sanitize();

        if candidate == current {
            info!("refinement produced no parameter change");
            store.mark_refinement(now_ms);
            return RefinementOutcome::Skipped {
                reason: "candidate identical to current parameters".to_string(),
            };
        }

        let verdict = WalkForward::split_filter(samples, &current, &candidate);
        if verdict.accepted {
            let notes = format!(
                "refinement accepted: pf {:.3}->{:.3}, dd {:.4}->{:.4}, forward {}->{}",
                verdict.baseline_profit_factor,
                verdict.candidate_profit_factor,
                verdict.baseline_drawdown_pct,
                verdict.candidate_drawdown_pct,
                verdict.baseline_forward_trades,
                verdict.candidate_forward_trades,
            );
            let version = store.commit(candidate, &notes, now_ms);
            info!(version, "refinement committed new strategy version");
            RefinementOutcome::Committed { version }
        } else {
            warn!(reasons = ?verdict.reasons, "refinement candidate rejected");
            for reason in &verdict.reasons {
                store.push_warning(now_ms, format!("walk-forward rejection: {reason}"));
            }
            store.mark_refinement(now_ms);
            RefinementOutcome::Rejected {
                reasons: verdict.reasons,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::metrics::TradeOutcome;
    use crate::types::Regime;

    fn sample(ts: i64, pnl: f64, score: f64) -> TradeSample {
        TradeSample {
            outcome: TradeOutcome {
                ts,
                symbol: "BTC-USDT".into(),
                pnl,
                r_multiple: pnl / 10.0,
                regime: Some(Regime::TrendingUp),
            },
            entry_score: score,
            entry_atr_pct: 0.01,
        }
    }

    #[test]
    fn too_few_trades_skips_with_warning() {
        let store = StrategyStore::ephemeral();
        let samples: Vec<TradeSample> = (0..5).map(|i| sample(i, 1.0, 0.7)).collect();
        let outcome = RefinementCycle::run(&store, &samples, &HeuristicAdvisor, 1_000);
        assert!(matches!(outcome, RefinementOutcome::Skipped { .. }));
        assert_eq!(store.version(), 1);
        assert!(!store.snapshot().warnings.is_empty());
        assert_eq!(store.last_refinement_time(), 1_000);
    }

    #[test]
    fn weak_performance_proposes_tighter_parameters() {
        let current = StrategyParameters::default();
        let metrics = PerformanceMetrics::compute(
            &(0..30)
                .map(|i| TradeOutcome {
                    ts: i,
                    symbol: "BTC-USDT".into(),
                    pnl: if i % 3 == 0 { 2.0 } else { -3.0 },
                    r_multiple: -0.2,
                    regime: None,
                })
                .collect::<Vec<_>>(),
        );
        let proposal = HeuristicAdvisor
            .propose(
                &current,
                &metrics,
                &ConditionBuckets::default(),
                &LossClusters::default(),
            )
            .unwrap();
        assert!(proposal.min_score > current.min_score);
        assert!(proposal.stop_loss_atr < current.stop_loss_atr);
    }

    #[test]
    fn advisor_error_falls_back_to_heuristic() {
        struct FailingAdvisor;
        impl StrategyAdvisor for FailingAdvisor {
            fn propose(
                &self,
                _: &StrategyParameters,
                _: &PerformanceMetrics,
                _: &ConditionBuckets,
                _: &LossClusters,
            ) -> anyhow::Result<CandidateProposal> {
                anyhow::bail!("advisor offline")
            }
        }

        let store = StrategyStore::ephemeral();
        // Weak win-rate so the heuristic proposes a change; forward trades
        // carry scores high enough to survive the raised floor.
        let samples: Vec<TradeSample> = (0..40)
            .map(|i| sample(i, if i % 3 == 0 { 4.0 } else { -2.0 }, 0.9))
            .collect();
        let outcome = RefinementCycle::run(&store, &samples, &FailingAdvisor, 5_000);
        // Either committed or rejected; either way the cycle completed and
        // recorded the advisor failure.
        assert!(!matches!(outcome, RefinementOutcome::Skipped { .. }) || store.version() == 1);
        assert!(store
            .snapshot()
            .warnings
            .iter()
            .any(|w| w.message.contains("advisor failed")));
    }

    #[test]
    fn rejection_retains_previous_parameters() {
        struct AggressiveAdvisor;
        impl StrategyAdvisor for AggressiveAdvisor {
            fn propose(
                &self,
                current: &StrategyParameters,
                _: &PerformanceMetrics,
                _: &ConditionBuckets,
                _: &LossClusters,
            ) -> anyhow::Result<CandidateProposal> {
                Ok(CandidateProposal {
                    min_score: current.min_score * 1.15,
                    atr_multiplier: current.atr_multiplier,
                    stop_loss_atr: current.stop_loss_atr,
                })
            }
        }

        let store = StrategyStore::ephemeral();
        let before = store.parameters();
        // All trades sit just above the current floor; the raised floor
        // filters everything and walk-forward must reject.
        let samples: Vec<TradeSample> = (0..40).map(|i| sample(i, 3.0, 0.64)).collect();
        let outcome = RefinementCycle::run(&store, &samples, &AggressiveAdvisor, 9_000);
        assert!(matches!(outcome, RefinementOutcome::Rejected { .. }));
        assert_eq!(store.parameters(), before);
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn commit_bumps_version_and_timestamp() {
        struct SmallTweakAdvisor;
        impl StrategyAdvisor for SmallTweakAdvisor {
            fn propose(
                &self,
                current: &StrategyParameters,
                _: &PerformanceMetrics,
                _: &ConditionBuckets,
                _: &LossClusters,
            ) -> anyhow::Result<CandidateProposal> {
                Ok(CandidateProposal {
                    min_score: current.min_score * 0.98,
                    atr_multiplier: current.atr_multiplier,
                    stop_loss_atr: current.stop_loss_atr,
                })
            }
        }

        let store = StrategyStore::ephemeral();
        let samples: Vec<TradeSample> = (0..40).map(|i| sample(i, 3.0, 0.9)).collect();
        let outcome = RefinementCycle::run(&store, &samples, &SmallTweakAdvisor, 7_000);
        match outcome {
            RefinementOutcome::Committed { version } => {
                assert_eq!(version, 2);
                assert_eq!(store.last_refinement_time(), 7_000);
            }
            other => panic!("expected commit, got {other:?}"),
        }
    }
}
