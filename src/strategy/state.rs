// =============================================================================
// Strategy State — versioned parameter sets with bounded history + warnings
// =============================================================================
//
// Commits are append-only: each accepted candidate bumps the monotonic
// version and pushes a history entry; history is pruned to the last 40
// entries and warnings to the last 20. Persistence uses the atomic
// tmp + rename pattern so a crash mid-write cannot corrupt the file.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::strategy::params::StrategyParameters;

/// Bounded lengths for the durable buffers.
const MAX_HISTORY: usize = 40;
const MAX_WARNINGS: usize = 20;

/// One committed parameter set with its audit context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyHistoryEntry {
    pub version: u64,
    pub committed_at: i64,
    pub notes: String,
    pub parameters: StrategyParameters,
}

/// A recorded refinement warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyWarning {
    pub at: i64,
    pub message: String,
}

/// Durable snapshot of the strategy state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyState {
    pub version: u64,
    pub parameters: StrategyParameters,
    /// Epoch millis of the last completed refinement cycle (0 = never).
    pub last_refinement_time: i64,
    pub history: Vec<StrategyHistoryEntry>,
    pub warnings: Vec<StrategyWarning>,
}

impl Default for StrategyState {
    fn default() -> Self {
        Self {
            version: 1,
            parameters: StrategyParameters::default(),
            last_refinement_time: 0,
            history: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// Thread-safe owner of the strategy state with durable saves.
pub struct StrategyStore {
    state: RwLock<StrategyState>,
    path: Option<PathBuf>,
}

impl StrategyStore {
    /// Load from `path` if it exists, otherwise start from defaults.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<StrategyState>(&content) {
                Ok(state) => {
                    info!(
                        path = %path.display(),
                        version = state.version,
                        "strategy state loaded"
                    );
                    state
                }
                Err(e) => {
                    warn!(error = %e, "strategy state file unreadable, starting fresh");
                    StrategyState::default()
                }
            },
            Err(_) => StrategyState::default(),
        };
        Self {
            state: RwLock::new(state),
            path: Some(path),
        }
    }

    /// In-memory store without persistence (tests, ephemeral runs).
    pub fn ephemeral() -> Self {
        Self {
            state: RwLock::new(StrategyState::default()),
            path: None,
        }
    }

    /// Immutable snapshot of the current parameters. Evaluators call this
    /// once at the start of a tick and never re-read mid-pipeline.
    pub fn parameters(&self) -> StrategyParameters {
        self.state.read().parameters.clone()
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    pub fn last_refinement_time(&self) -> i64 {
        self.state.read().last_refinement_time
    }

    pub fn snapshot(&self) -> StrategyState {
        self.state.read().clone()
    }

    /// Commit an accepted candidate: sanitize, bump the version, append the
    /// superseded set to history, persist.
    pub fn commit(&self, candidate: StrategyParameters, notes: &str, ts: i64) -> u64 {
        let new_version;
        {
            let mut s = self.state.write();
            let outgoing = StrategyHistoryEntry {
                version: s.version,
                committed_at: ts,
                notes: notes.to_string(),
                parameters: s.parameters.clone(),
            };
            s.history.push(outgoing);
            while s.history.len() > MAX_HISTORY {
                s.history.remove(0);
            }
            s.version += 1;
            s.parameters = candidate.sanitize();
            s.last_refinement_time = ts;
            new_version = s.version;
        }
        info!(version = new_version, notes, "strategy parameters committed");
        self.persist();
        new_version
    }

    /// Record a completed refinement cycle that did not change parameters.
    pub fn mark_refinement(&self, ts: i64) {
        self.state.write().last_refinement_time = ts;
        self.persist();
    }

    /// Append a warning, pruning to the bounded length.
    pub fn push_warning(&self, at: i64, message: impl Into<String>) {
        let message = message.into();
        warn!(warning = %message, "strategy warning recorded");
        {
            let mut s = self.state.write();
            s.warnings.push(StrategyWarning { at, message });
            while s.warnings.len() > MAX_WARNINGS {
                s.warnings.remove(0);
            }
        }
        self.persist();
    }

    /// Atomic tmp + rename save. Best-effort: a failed save is logged, the
    /// in-memory state remains authoritative until the next attempt.
    fn persist(&self) {
        let Some(path) = &self.path else { return };
        if let Err(e) = self.persist_to(path) {
            warn!(error = %e, path = %path.display(), "failed to persist strategy state");
        }
    }

    fn persist_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(&*self.state.read())
            .context("failed to serialise strategy state")?;
        let tmp = path.with_extension("json.tmp");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename {} into place", tmp.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_bumps_version_monotonically() {
        let store = StrategyStore::ephemeral();
        assert_eq!(store.version(), 1);
        let v2 = store.commit(StrategyParameters::default(), "first", 1_000);
        let v3 = store.commit(StrategyParameters::default(), "second", 2_000);
        assert_eq!(v2, 2);
        assert_eq!(v3, 3);
        assert_eq!(store.last_refinement_time(), 2_000);
    }

    #[test]
    fn history_is_bounded_to_forty() {
        let store = StrategyStore::ephemeral();
        for i in 0..50 {
            store.commit(StrategyParameters::default(), "cycle", i);
        }
        let snap = store.snapshot();
        assert_eq!(snap.history.len(), 40);
        // Oldest surviving entry is the one evicted last.
        assert_eq!(snap.history.first().unwrap().version, 11);
    }

    #[test]
    fn warnings_are_bounded_to_twenty() {
        let store = StrategyStore::ephemeral();
        for i in 0..30 {
            store.push_warning(i, format!("warning {i}"));
        }
        let snap = store.snapshot();
        assert_eq!(snap.warnings.len(), 20);
        assert_eq!(snap.warnings.first().unwrap().message, "warning 10");
    }

    #[test]
    fn commit_sanitizes_candidate() {
        let store = StrategyStore::ephemeral();
        let wild = StrategyParameters {
            min_score: 5.0,
            ..StrategyParameters::default()
        };
        store.commit(wild, "wild", 0);
        assert_eq!(store.parameters().min_score, 0.95);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = std::env::temp_dir().join(format!("borealis-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("strategy.json");
        {
            let store = StrategyStore::open(&path);
            store.commit(StrategyParameters::default(), "persisted", 42);
        }
        let reloaded = StrategyStore::open(&path);
        assert_eq!(reloaded.version(), 2);
        assert_eq!(reloaded.last_refinement_time(), 42);
        let _ = std::fs::remove_dir_all(dir);
    }
}
