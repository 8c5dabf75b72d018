//! Durable aggregate counters.
//!
//! Running node counts per label and relationship counts per
//! (start-label, type, end-label) key, maintained incrementally by signed
//! deltas and persisted as an atomic snapshot at checkpoint. The store
//! remembers the id of the last transaction whose deltas were applied, which
//! is what makes count application idempotent across restarts: a replayed
//! transaction whose id is already reflected gets no updater.

use crate::error::{EngineError, Result};
use crate::model::{LabelId, RelTypeId, TxId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Key of a relationship counter.
pub type RelationshipCountKey = (LabelId, RelTypeId, LabelId);

#[derive(Debug, Default, Serialize, Deserialize)]
struct CountsSnapshot {
    last_applied_tx: TxId,
    nodes: Vec<(LabelId, i64)>,
    relationships: Vec<(LabelId, RelTypeId, LabelId, i64)>,
}

/// Durable store of aggregate counters.
#[derive(Debug)]
pub struct CountsStore {
    path: Option<PathBuf>,
    nodes: Mutex<HashMap<LabelId, i64>>,
    relationships: Mutex<HashMap<RelationshipCountKey, i64>>,
    last_applied: AtomicU64,
}

impl CountsStore {
    /// Opens the counts store at `path`, loading the snapshot if present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let store = Self {
            path: Some(path.clone()),
            nodes: Mutex::new(HashMap::new()),
            relationships: Mutex::new(HashMap::new()),
            last_applied: AtomicU64::new(0),
        };
        if path.exists() {
            let bytes = fs::read(&path)?;
            let snapshot: CountsSnapshot = serde_json::from_slice(&bytes)
                .map_err(|e| EngineError::Corruption(format!("counts snapshot: {e}")))?;
            store.last_applied
                .store(snapshot.last_applied_tx, Ordering::SeqCst);
            *store.nodes.lock() = snapshot.nodes.into_iter().collect();
            *store.relationships.lock() = snapshot
                .relationships
                .into_iter()
                .map(|(s, t, e, count)| ((s, t, e), count))
                .collect();
        }
        Ok(store)
    }

    /// A counts store with no backing file. Used for scratch engines and
    /// direct-simulation tests.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            nodes: Mutex::new(HashMap::new()),
            relationships: Mutex::new(HashMap::new()),
            last_applied: AtomicU64::new(0),
        }
    }

    /// Id of the last transaction whose deltas are reflected here.
    pub fn last_applied_tx_id(&self) -> TxId {
        self.last_applied.load(Ordering::SeqCst)
    }

    /// Opens a transaction-scoped updater.
    ///
    /// Returns `None` when the store already reflects `tx_id`. That is the
    /// normal replay-skip outcome, not an error, and it is valid in every
    /// apply mode: the persisted watermark is authoritative.
    pub fn open_updater(&self, tx_id: TxId) -> Option<CountsUpdater<'_>> {
        if tx_id <= self.last_applied.load(Ordering::SeqCst) {
            debug!(tx_id, "counts already reflect transaction; skipping");
            return None;
        }
        Some(CountsUpdater {
            store: self,
            tx_id,
            nodes: Vec::new(),
            relationships: Vec::new(),
        })
    }

    pub fn node_count(&self, label: LabelId) -> i64 {
        *self.nodes.lock().get(&label).unwrap_or(&0)
    }

    pub fn relationship_count(&self, start: LabelId, rel_type: RelTypeId, end: LabelId) -> i64 {
        *self
            .relationships
            .lock()
            .get(&(start, rel_type, end))
            .unwrap_or(&0)
    }

    /// Persists the snapshot atomically: write a sidecar file, fsync it,
    /// then rename over the old snapshot. No-op for in-memory stores.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = CountsSnapshot {
            last_applied_tx: self.last_applied.load(Ordering::SeqCst),
            nodes: self.nodes.lock().iter().map(|(k, v)| (*k, *v)).collect(),
            relationships: self
                .relationships
                .lock()
                .iter()
                .map(|((s, t, e), count)| (*s, *t, *e, *count))
                .collect(),
        };
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        let tmp = tmp_path(path);
        fs::write(&tmp, &bytes)?;
        File::open(&tmp)?.sync_data()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn absorb(&self, updater_tx: TxId, nodes: &[(LabelId, i64)], rels: &[(RelationshipCountKey, i64)]) {
        {
            let mut counts = self.nodes.lock();
            for (label, delta) in nodes {
                *counts.entry(*label).or_insert(0) += delta;
            }
        }
        {
            let mut counts = self.relationships.lock();
            for (key, delta) in rels {
                *counts.entry(*key).or_insert(0) += delta;
            }
        }
        self.last_applied.fetch_max(updater_tx, Ordering::SeqCst);
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Transaction-scoped counter updater.
///
/// Deltas are buffered and folded into the store on [`CountsUpdater::close`],
/// together with the last-applied watermark, so a transaction's count deltas
/// become visible as one unit.
#[derive(Debug)]
pub struct CountsUpdater<'a> {
    store: &'a CountsStore,
    tx_id: TxId,
    nodes: Vec<(LabelId, i64)>,
    relationships: Vec<(RelationshipCountKey, i64)>,
}

impl CountsUpdater<'_> {
    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    pub fn increment_node_count(&mut self, label: LabelId, delta: i64) {
        self.nodes.push((label, delta));
    }

    pub fn increment_relationship_count(
        &mut self,
        start: LabelId,
        rel_type: RelTypeId,
        end: LabelId,
        delta: i64,
    ) {
        self.relationships.push(((start, rel_type, end), delta));
    }

    /// Applies the buffered deltas and advances the watermark.
    pub fn close(self) -> Result<()> {
        self.store
            .absorb(self.tx_id, &self.nodes, &self.relationships);
        Ok(())
    }
}
