//! The embedded engine facade.
//!
//! [`Engine::open`] brings a store directory to a consistent state (lock,
//! snapshot load, log repair and replay) and then serves transactions.
//! Writes go through [`Engine::begin`] and the commit pipeline; reads go
//! straight to the stores and indexes.

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::health::DatabaseHealth;
use crate::index::schema::MemoryAuxIndex;
use crate::locks::LockService;
use crate::model::{
    EntityRef, LabelId, NodeId, NodeRecord, PropertyValue, RelTypeId, RelationshipId,
    RelationshipRecord, TxId,
};
use crate::store::counts::CountsStore;
use crate::store::txid::TxIdStore;
use crate::store::Storage;
use crate::txn::apply::TransactionApplyMode;
use crate::txn::command::TxToApply;
use crate::txn::commit::CommitPipeline;
use crate::txn::recovery;
use crate::txn::registry::TransactionRegistry;
use crate::txn::transaction::{Transaction, TransactionHandle};
use crate::txn::translator::TransactionStateTranslator;
use crate::wal::{self, LogAppender, WalAppender};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

const WAL_FILE: &str = "wal";
const SNAPSHOT_FILE: &str = "store.json";
const COUNTS_FILE: &str = "counts.json";
const LOCK_FILE: &str = "LOCK";

/// An embedded transactional graph engine over one store directory.
pub struct Engine {
    config: Config,
    dir: PathBuf,
    /// Held for the engine's lifetime; the advisory lock dies with it.
    _lock_file: File,
    storage: Arc<Storage>,
    health: Arc<DatabaseHealth>,
    id_store: Arc<TxIdStore>,
    appender: Arc<WalAppender>,
    pipeline: CommitPipeline,
    registry: TransactionRegistry,
    translator: TransactionStateTranslator,
    commits_since_checkpoint: AtomicU64,
}

impl Engine {
    /// Opens the store at `dir` with default configuration.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(dir, Config::default())
    }

    /// Opens the store at `dir`, creating it if needed, and runs recovery.
    pub fn open_with_config(dir: impl AsRef<Path>, config: Config) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let lock_file = File::create(dir.join(LOCK_FILE))?;
        lock_file.try_lock_exclusive().map_err(|_| {
            EngineError::DatabaseUnavailable(format!(
                "store directory {} is locked by another process",
                dir.display()
            ))
        })?;

        let counts = CountsStore::open(dir.join(COUNTS_FILE))?;
        let storage = Arc::new(Storage::new(&config, counts));
        storage
            .aux()
            .register("memory", Arc::new(MemoryAuxIndex::new()));

        let mut base_tx = 0;
        if let Some(snapshot) = Storage::load_snapshot(dir.join(SNAPSHOT_FILE))? {
            base_tx = snapshot.last_committed_tx;
            storage.restore(snapshot);
        }

        let entries = wal::scan_and_repair(dir.join(WAL_FILE))?;

        let id_store = Arc::new(TxIdStore::new(base_tx));
        let appender = Arc::new(WalAppender::open(
            dir.join(WAL_FILE),
            Arc::clone(&id_store),
            config.sync_on_commit,
        )?);
        let health = Arc::new(DatabaseHealth::new());
        let pipeline = CommitPipeline::new(
            Arc::clone(&appender) as Arc<dyn LogAppender>,
            Arc::clone(&storage),
            Arc::clone(&health),
            Arc::clone(&id_store),
        );

        let outcome = recovery::replay(&pipeline, entries)?;
        let last_committed = base_tx
            .max(outcome.last_tx_id)
            .max(storage.counts().last_applied_tx_id());
        id_store.reinitialize(last_committed);

        let registry = TransactionRegistry::new(&config, Arc::new(LockService::new()));
        registry.start();
        let translator = TransactionStateTranslator::standard(Arc::clone(storage.schema()));

        info!(
            dir = %dir.display(),
            last_committed,
            recovered = outcome.recovered,
            "engine open"
        );
        Ok(Self {
            config,
            dir,
            _lock_file: lock_file,
            storage,
            health,
            id_store,
            appender,
            pipeline,
            registry,
            translator,
            commits_since_checkpoint: AtomicU64::new(0),
        })
    }

    /// Begins a write transaction.
    pub fn begin(&self) -> Result<TransactionHandle<'_>> {
        self.health.assert_healthy()?;
        let inner = self.registry.acquire(self.id_store.last_committed())?;
        Ok(TransactionHandle::new(self, inner))
    }

    pub(crate) fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub(crate) fn commit_pooled(&self, tx: &Arc<Transaction>) -> Result<Option<TxId>> {
        self.health.assert_healthy()?;
        tx.check_terminated()?;

        let representation = {
            let state = tx.state().lock();
            if state.is_empty() {
                return Ok(None);
            }
            self.translator.translate(
                &state,
                self.storage.as_ref(),
                tx.last_committed_when_started(),
            )?
        };
        if representation.is_empty() {
            return Ok(None);
        }

        let mut batch = TxToApply::new(representation);
        let tx_id = self
            .pipeline
            .commit(&mut batch, TransactionApplyMode::Internal)?;

        if let Some(interval) = self.config.checkpoint_interval_txs {
            let commits = self.commits_since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1;
            if commits >= interval {
                self.checkpoint()?;
            }
        }
        Ok(Some(tx_id))
    }

    pub(crate) fn release_pooled(&self, tx: Arc<Transaction>) {
        self.registry.release(tx);
    }

    /// Applies a batch of externally produced transactions (replication,
    /// batch import). Ids must already be assigned.
    pub fn apply_external(&self, batch: &mut TxToApply) -> Result<TxId> {
        self.health.assert_healthy()?;
        self.pipeline
            .commit(batch, TransactionApplyMode::External)
    }

    /// Persists the store snapshot and counters, then truncates the log.
    /// Commits are held off for the duration, nothing can land between the
    /// snapshot and the truncation. Transactions already appended but still
    /// applying are drained first so the snapshot covers every id the
    /// truncation discards.
    pub fn checkpoint(&self) -> Result<()> {
        self.appender.checkpoint_with(|| {
            let last_committed = self.id_store.last_committed();
            self.id_store.await_closed_up_to(last_committed);
            self.storage
                .write_snapshot(self.dir.join(SNAPSHOT_FILE), last_committed)?;
            self.storage.counts().flush()
        })?;
        self.commits_since_checkpoint.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Stops issuing transactions, terminates open ones, and checkpoints.
    pub fn shutdown(&self) -> Result<()> {
        self.registry.stop();
        self.registry.dispose_all();
        if self.health.is_healthy() {
            self.checkpoint()?;
        }
        info!("engine shut down");
        Ok(())
    }

    // ------------------------------------------------------------------
    // reads

    pub fn node(&self, id: NodeId) -> Option<NodeRecord> {
        self.storage.records().node(id)
    }

    pub fn relationship(&self, id: RelationshipId) -> Option<RelationshipRecord> {
        self.storage.records().relationship(id)
    }

    /// Number of nodes carrying `label`; [`crate::model::ANY_LABEL`] counts
    /// every node.
    pub fn node_count(&self, label: LabelId) -> i64 {
        self.storage.counts().node_count(label)
    }

    /// Relationship count for a wildcard-bearing key; at most one of `start`
    /// and `end` may name a concrete label.
    pub fn relationship_count(&self, start: LabelId, rel_type: RelTypeId, end: LabelId) -> i64 {
        self.storage.counts().relationship_count(start, rel_type, end)
    }

    pub fn nodes_with_label(&self, label: LabelId) -> Vec<NodeId> {
        self.storage.label_scan().nodes_with_label(label)
    }

    /// Finds nodes by an indexed (label, property) value; falls back to a
    /// label scan when no index covers the pair.
    pub fn find_nodes_by_property(
        &self,
        label: LabelId,
        property: &str,
        value: &PropertyValue,
    ) -> Vec<NodeId> {
        if let Some(hits) = self.storage.schema().lookup(label, property, value) {
            return hits;
        }
        self.nodes_with_label(label)
            .into_iter()
            .filter(|id| {
                self.node(*id)
                    .map(|n| n.properties.get(property) == Some(value))
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn aux_lookup(
        &self,
        index: &str,
        key: &str,
        value: &PropertyValue,
    ) -> Result<Vec<EntityRef>> {
        Ok(self.storage.aux().provider(index)?.lookup(key, value))
    }

    pub fn register_aux_index_provider(
        &self,
        name: impl Into<String>,
        provider: Arc<dyn crate::index::schema::AuxIndexProvider>,
    ) {
        self.storage.aux().register(name, provider);
    }

    pub fn active_transactions(&self) -> Vec<Arc<Transaction>> {
        self.registry.active_transactions()
    }

    pub fn health(&self) -> &DatabaseHealth {
        &self.health
    }

    pub fn last_committed_tx_id(&self) -> TxId {
        self.id_store.last_committed()
    }

    pub fn last_closed_tx_id(&self) -> TxId {
        self.id_store.last_closed()
    }

    /// Total close notifications since open, a commit-pipeline metric.
    pub fn transactions_closed(&self) -> u64 {
        self.id_store.transactions_closed()
    }
}
