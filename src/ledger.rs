// =============================================================================
// Position Ledger — FIFO lots per symbol with Decimal accounting
// =============================================================================
//
// Lots live in a per-symbol ring in insertion order; `consume` walks that
// order (or a single targeted lot) and returns the weighted entry price,
// initial risk and entry fee of the consumed slice, so partial exits settle
// against the exact slice they close. Holdings and average entry are
// recomputed from the remaining lots after every mutation and zeroed when
// the residual drops below dust.
//
// All monetary fields are `rust_decimal::Decimal`; the balance is only ever
// debited/credited here, and portfolio value is recomputed on demand, never
// mutated in place.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::money;
use crate::types::ExitReason;

/// Residual below which a symbol's holdings collapse to zero.
fn dust() -> Decimal {
    Decimal::new(1, 6) // 1e-6
}

/// One open position slice with its own stop and target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lot {
    pub id: String,
    pub symbol: String,
    pub entry_price: Decimal,
    pub amount: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub ts: i64,
    pub initial_risk_per_unit: Decimal,
    pub entry_fee_per_unit: Decimal,
    pub strategy_version: u64,
}

/// Weighted view of the slice removed by one `consume` call.
#[derive(Debug, Clone)]
pub struct ConsumedSlice {
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub initial_risk_per_unit: Decimal,
    pub entry_fee_per_unit: Decimal,
    pub lot_ids: Vec<String>,
}

struct Inner {
    balance: Decimal,
    lots: HashMap<String, VecDeque<Lot>>,
    holdings: HashMap<String, Decimal>,
    avg_entry: HashMap<String, Decimal>,
}

/// Thread-safe owner of all lots and the quote balance.
pub struct PositionLedger {
    inner: RwLock<Inner>,
}

impl PositionLedger {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            inner: RwLock::new(Inner {
                balance: starting_balance,
                lots: HashMap::new(),
                holdings: HashMap::new(),
                avg_entry: HashMap::new(),
            }),
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn balance(&self) -> Decimal {
        self.inner.read().balance
    }

    pub fn holdings(&self, symbol: &str) -> Decimal {
        *self
            .inner
            .read()
            .holdings
            .get(symbol)
            .unwrap_or(&Decimal::ZERO)
    }

    pub fn avg_entry(&self, symbol: &str) -> Decimal {
        *self
            .inner
            .read()
            .avg_entry
            .get(symbol)
            .unwrap_or(&Decimal::ZERO)
    }

    /// Open lots for a symbol, insertion order.
    pub fn open_lots(&self, symbol: &str) -> Vec<Lot> {
        self.inner
            .read()
            .lots
            .get(symbol)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total open lots across all symbols.
    pub fn open_lot_count(&self) -> usize {
        self.inner.read().lots.values().map(VecDeque::len).sum()
    }

    /// Notional exposure of a symbol at its average entry.
    pub fn exposure(&self, symbol: &str) -> Decimal {
        let inner = self.inner.read();
        let holdings = inner.holdings.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let avg = inner.avg_entry.get(symbol).copied().unwrap_or(Decimal::ZERO);
        holdings * avg
    }

    /// `balance + Σ holdings[sym] * mark[sym]` — recomputed, never cached.
    pub fn portfolio_value(&self, mark_prices: &HashMap<String, f64>) -> Decimal {
        let inner = self.inner.read();
        let mut total = inner.balance;
        for (symbol, holdings) in &inner.holdings {
            let mark = mark_prices
                .get(symbol)
                .map(|p| money::price(*p))
                .or_else(|| inner.avg_entry.get(symbol).copied())
                .unwrap_or(Decimal::ZERO);
            total += *holdings * mark;
        }
        total
    }

    // ── Entry ───────────────────────────────────────────────────────────

    /// Open a new lot, debiting `fill_price * qty + fees` from the balance.
    ///
    /// Returns `None` (no mutation) when the lot violates its invariants or
    /// the balance cannot cover the cost.
    #[allow(clippy::too_many_arguments)]
    pub fn open_lot(
        &self,
        symbol: &str,
        fill_price: Decimal,
        qty: Decimal,
        fees: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        ts: i64,
        initial_risk_per_unit: Decimal,
        strategy_version: u64,
    ) -> Option<Lot> {
        if qty <= Decimal::ZERO {
            warn!(symbol, %qty, "rejecting lot with non-positive amount");
            return None;
        }
        if !(stop_loss < fill_price && fill_price < take_profit) {
            warn!(
                symbol,
                %stop_loss,
                %fill_price,
                %take_profit,
                "rejecting lot violating stop < entry < target"
            );
            return None;
        }

        let cost = fill_price * qty + fees;
        let mut inner = self.inner.write();
        if cost > inner.balance {
            warn!(symbol, %cost, balance = %inner.balance, "rejecting lot exceeding balance");
            return None;
        }

        let entry_fee_per_unit = if qty > Decimal::ZERO {
            (fees / qty).round_dp(money::QTY_DP)
        } else {
            Decimal::ZERO
        };

        let lot = Lot {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            entry_price: fill_price.round_dp(money::PRICE_DP),
            amount: qty.round_dp(money::QTY_DP),
            stop_loss: stop_loss.round_dp(money::PRICE_DP),
            take_profit: take_profit.round_dp(money::PRICE_DP),
            ts,
            initial_risk_per_unit,
            entry_fee_per_unit,
            strategy_version,
        };

        inner.balance -= cost;
        inner
            .lots
            .entry(symbol.to_string())
            .or_default()
            .push_back(lot.clone());
        Self::recompute_symbol(&mut inner, symbol);

        info!(
            symbol,
            lot_id = %lot.id,
            entry = %lot.entry_price,
            amount = %lot.amount,
            stop = %lot.stop_loss,
            target = %lot.take_profit,
            "lot opened"
        );
        Some(lot)
    }

    // ── Exit ────────────────────────────────────────────────────────────

    /// Remove `qty` from the symbol's lots in FIFO order, or only from the
    /// targeted lot when `target_lot` is given.
    ///
    /// Returns the weighted slice actually consumed (which may be smaller
    /// than requested when holdings run out), or `None` when nothing was
    /// held.
    pub fn consume(
        &self,
        symbol: &str,
        qty: Decimal,
        target_lot: Option<&str>,
    ) -> Option<ConsumedSlice> {
        if qty <= Decimal::ZERO {
            return None;
        }
        let mut inner = self.inner.write();
        let ring = inner.lots.get_mut(symbol)?;

        let mut remaining = qty;
        let mut consumed_qty = Decimal::ZERO;
        let mut cost_accum = Decimal::ZERO; // Σ entry_price * slice
        let mut risk_accum = Decimal::ZERO; // Σ risk_per_unit * slice
        let mut fee_accum = Decimal::ZERO; // Σ entry_fee_per_unit * slice
        let mut lot_ids = Vec::new();

        for lot in ring.iter_mut() {
            if remaining <= Decimal::ZERO {
                break;
            }
            if let Some(target) = target_lot {
                if lot.id != target {
                    continue;
                }
            }
            let slice = remaining.min(lot.amount);
            lot.amount -= slice;
            remaining -= slice;
            consumed_qty += slice;
            cost_accum += lot.entry_price * slice;
            risk_accum += lot.initial_risk_per_unit * slice;
            fee_accum += lot.entry_fee_per_unit * slice;
            lot_ids.push(lot.id.clone());
        }

        ring.retain(|lot| lot.amount > dust());
        let ring_empty = ring.is_empty();
        if ring_empty {
            inner.lots.remove(symbol);
        }
        Self::recompute_symbol(&mut inner, symbol);

        if consumed_qty <= Decimal::ZERO {
            return None;
        }

        Some(ConsumedSlice {
            qty: consumed_qty,
            entry_price: (cost_accum / consumed_qty).round_dp(money::PRICE_DP),
            initial_risk_per_unit: (risk_accum / consumed_qty).round_dp(money::QTY_DP),
            entry_fee_per_unit: (fee_accum / consumed_qty).round_dp(money::QTY_DP),
            lot_ids,
        })
    }

    /// Credit exit proceeds (`fill * qty - fees`) back to the balance.
    pub fn credit_proceeds(&self, amount: Decimal) {
        self.inner.write().balance += amount;
    }

    // ── Auto-exit scan ──────────────────────────────────────────────────

    /// Lots whose stop or target the mark price has crossed, insertion
    /// order. The stop-loss is checked before the take-profit for each lot.
    pub fn lots_hit(&self, symbol: &str, mark_price: f64) -> Vec<(Lot, ExitReason)> {
        let mark = money::price(mark_price);
        let inner = self.inner.read();
        let Some(ring) = inner.lots.get(symbol) else {
            return Vec::new();
        };
        ring.iter()
            .filter_map(|lot| {
                if mark <= lot.stop_loss {
                    Some((lot.clone(), ExitReason::StopLoss))
                } else if mark >= lot.take_profit {
                    Some((lot.clone(), ExitReason::TakeProfit))
                } else {
                    None
                }
            })
            .collect()
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Recompute holdings and average entry for a symbol from its remaining
    /// lots. A residual below dust collapses both to zero.
    fn recompute_symbol(inner: &mut Inner, symbol: &str) {
        let (total, cost) = inner
            .lots
            .get(symbol)
            .map(|ring| {
                ring.iter().fold((Decimal::ZERO, Decimal::ZERO), |(t, c), lot| {
                    (t + lot.amount, c + lot.entry_price * lot.amount)
                })
            })
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));

        if total < dust() {
            inner.holdings.insert(symbol.to_string(), Decimal::ZERO);
            inner.avg_entry.insert(symbol.to_string(), Decimal::ZERO);
        } else {
            inner.holdings.insert(symbol.to_string(), total);
            inner
                .avg_entry
                .insert(symbol.to_string(), (cost / total).round_dp(money::PRICE_DP));
        }
    }
}
