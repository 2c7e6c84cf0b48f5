// =============================================================================
// File-backed history store — one JSONL journal per record kind
// =============================================================================
//
// Journals are append-only. Each record is serialised to a single line and
// flushed with a durable sync before the call returns, so a crash can lose
// at most the record being written, never corrupt earlier lines. On open,
// existing journals are replayed to rebuild the in-memory tails and the
// idempotency index, which is what makes restarts honour previously
// accepted orders.
// =============================================================================

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::history::{
    DecisionRecord, FillRecord, HistoryStore, OrderRecord, SnapshotRecord, TradeRecord,
};
use crate::types::OrderStatus;

/// In-memory tail bound per journal; reads never touch disk after open.
const MAX_TAIL: usize = 10_000;

struct Journal {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl Journal {
    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open journal {}", path.display()))?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    /// Append one record as a JSON line, flush, and sync to disk.
    fn append<T: serde::Serialize>(&self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialise record")?;
        let mut writer = self.writer.lock();
        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush())
            .and_then(|_| writer.get_ref().sync_data())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(())
    }

    /// Replay existing lines, skipping unparseable ones with a warning.
    fn replay<T: serde::de::DeserializeOwned>(&self) -> Vec<T> {
        let Ok(file) = File::open(&self.path) else {
            return Vec::new();
        };
        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = idx + 1,
                    error = %e,
                    "skipping unparseable journal line"
                ),
            }
        }
        records
    }
}

/// JSONL-backed [`HistoryStore`].
pub struct FileHistoryStore {
    decisions: Journal,
    orders: Journal,
    fills: Journal,
    trades: Journal,
    snapshots: Journal,

    // In-memory tails rebuilt on open.
    decision_tail: Mutex<Vec<DecisionRecord>>,
    trade_tail: Mutex<Vec<TradeRecord>>,
    /// idempotency_key -> newest non-SKIPPED order.
    active_orders: Mutex<HashMap<String, OrderRecord>>,
}

impl FileHistoryStore {
    /// Open (or create) the journal directory and replay existing journals.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create journal dir {}", dir.display()))?;

        let decisions = Journal::open(dir.join("decisions.jsonl"))?;
        let orders = Journal::open(dir.join("orders.jsonl"))?;
        let fills = Journal::open(dir.join("fills.jsonl"))?;
        let trades = Journal::open(dir.join("trades.jsonl"))?;
        let snapshots = Journal::open(dir.join("snapshots.jsonl"))?;

        let mut decision_tail: Vec<DecisionRecord> = decisions.replay();
        let mut trade_tail: Vec<TradeRecord> = trades.replay();
        let order_records: Vec<OrderRecord> = orders.replay();

        let mut active_orders = HashMap::new();
        for order in order_records {
            if order.status != OrderStatus::Skipped {
                active_orders.insert(order.idempotency_key.clone(), order);
            }
        }

        if decision_tail.len() > MAX_TAIL {
            decision_tail.drain(..decision_tail.len() - MAX_TAIL);
        }
        if trade_tail.len() > MAX_TAIL {
            trade_tail.drain(..trade_tail.len() - MAX_TAIL);
        }

        info!(
            dir = %dir.display(),
            decisions = decision_tail.len(),
            trades = trade_tail.len(),
            active_orders = active_orders.len(),
            "file history store opened"
        );

        Ok(Self {
            decisions,
            orders,
            fills,
            trades,
            snapshots,
            decision_tail: Mutex::new(decision_tail),
            trade_tail: Mutex::new(trade_tail),
            active_orders: Mutex::new(active_orders),
        })
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn record_decision(&self, record: &DecisionRecord) -> Result<()> {
        self.decisions.append(record)?;
        let mut tail = self.decision_tail.lock();
        tail.push(record.clone());
        if tail.len() > MAX_TAIL {
            tail.remove(0);
        }
        Ok(())
    }

    async fn record_order(&self, record: &OrderRecord) -> Result<()> {
        self.orders.append(record)?;
        if record.status != OrderStatus::Skipped {
            self.active_orders
                .lock()
                .insert(record.idempotency_key.clone(), record.clone());
        }
        Ok(())
    }

    async fn record_fill(&self, record: &FillRecord) -> Result<()> {
        self.fills.append(record)
    }

    async fn record_trade(&self, record: &TradeRecord) -> Result<()> {
        self.trades.append(record)?;
        let mut tail = self.trade_tail.lock();
        tail.push(record.clone());
        if tail.len() > MAX_TAIL {
            tail.remove(0);
        }
        Ok(())
    }

    async fn record_snapshot(&self, record: &SnapshotRecord) -> Result<()> {
        self.snapshots.append(record)
    }

    async fn find_active_order(&self, idempotency_key: &str) -> Result<Option<OrderRecord>> {
        Ok(self.active_orders.lock().get(idempotency_key).cloned())
    }

    async fn recent_decisions(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        let tail = self.decision_tail.lock();
        Ok(tail.iter().rev().take(limit).cloned().collect())
    }

    async fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let tail = self.trade_tail.lock();
        Ok(tail.iter().rev().take(limit).cloned().collect())
    }

    async fn trades_since(&self, ts: i64) -> Result<Vec<TradeRecord>> {
        let tail = self.trade_tail.lock();
        Ok(tail.iter().filter(|t| t.ts >= ts).cloned().collect())
    }
}
