//! Storage engine: record stores, counters, indexes, and command
//! application.
//!
//! [`Storage`] bundles everything below the commit pipeline: the record
//! stores, the aggregate counters, the schema and auxiliary indexes, and the
//! label scan store. It owns validation of index preconditions before a
//! transaction is appended and application of the command list afterwards,
//! and it can write and restore a point-in-time snapshot for checkpoints.

pub mod counts;
pub mod records;
pub mod txid;

pub use counts::{CountsStore, CountsUpdater};
pub use records::{RecordCache, RecordStores};
pub use txid::TxIdStore;

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::index::label_scan::LabelScanSync;
use crate::index::schema::{AuxIndexes, SchemaIndexes, SchemaRule};
use crate::model::{NodeId, NodeRecord, RelationshipId, RelationshipRecord, TxId};
use crate::txn::apply::{
    ApplierChain, AuxIndexApplier, CacheInvalidationApplier, CountsApplier, HighIdApplier,
    SchemaIndexApplier, StoreApplier, TransactionApplyMode,
};
use crate::txn::command::TxToApply;
use crate::txn::state::RecordAccess;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Serialized point-in-time image of the stores, written at checkpoint.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub last_committed_tx: TxId,
    pub nodes: Vec<NodeRecord>,
    pub relationships: Vec<RelationshipRecord>,
    pub schema_rules: Vec<SchemaRule>,
}

/// Everything below the commit pipeline.
#[derive(Debug)]
pub struct Storage {
    records: RecordStores,
    counts: CountsStore,
    schema: Arc<SchemaIndexes>,
    aux: AuxIndexes,
    label_scan: LabelScanSync,
}

impl Storage {
    pub fn new(config: &Config, counts: CountsStore) -> Self {
        Self {
            records: RecordStores::new(config.record_cache_capacity),
            counts,
            schema: Arc::new(SchemaIndexes::new(config.max_index_entries)),
            aux: AuxIndexes::new(),
            label_scan: LabelScanSync::new(),
        }
    }

    pub fn records(&self) -> &RecordStores {
        &self.records
    }

    pub fn counts(&self) -> &CountsStore {
        &self.counts
    }

    pub fn schema(&self) -> &Arc<SchemaIndexes> {
        &self.schema
    }

    pub fn aux(&self) -> &AuxIndexes {
        &self.aux
    }

    pub fn label_scan(&self) -> &LabelScanSync {
        &self.label_scan
    }

    /// Derives and validates the logical index updates for a transaction,
    /// caching them on the batch element. Runs once per element; later batch
    /// elements validate only after earlier ones have been applied, since
    /// they may depend on state those writes produce.
    pub fn ensure_validated(&self, tx: &mut TxToApply) -> Result<()> {
        if tx.validated_index_updates.is_some() {
            return Ok(());
        }
        let updates = self.schema.derive_updates(&tx.representation.commands);
        self.schema
            .validate_updates(&tx.representation.commands, &updates)?;
        tx.validated_index_updates = Some(updates);
        Ok(())
    }

    /// Applies one validated transaction through the applier chain.
    pub fn apply_one(&self, tx: &TxToApply, mode: TransactionApplyMode) -> Result<()> {
        let mut chain = ApplierChain::new();
        chain.push(Box::new(StoreApplier::new(&self.records)));
        if mode.needs_high_id_tracking() {
            chain.push(Box::new(HighIdApplier::new(&self.records)));
        }
        if mode.needs_cache_invalidation() {
            chain.push(Box::new(CacheInvalidationApplier::new(&self.records)));
        }
        chain.push(Box::new(SchemaIndexApplier::new(
            &self.schema,
            &self.label_scan,
        )));
        chain.push(Box::new(AuxIndexApplier::new(&self.aux)));
        chain.push(Box::new(CountsApplier::new(&self.counts)));
        chain.apply(tx)
    }

    /// Builds a snapshot of the current store contents.
    pub fn snapshot(&self, last_committed_tx: TxId) -> StoreSnapshot {
        StoreSnapshot {
            last_committed_tx,
            nodes: self.records.all_nodes(),
            relationships: self.records.all_relationships(),
            schema_rules: self.schema.rules(),
        }
    }

    /// Restores stores and derived structures from a snapshot. Only valid on
    /// a freshly constructed storage.
    pub fn restore(&self, snapshot: StoreSnapshot) {
        info!(
            nodes = snapshot.nodes.len(),
            relationships = snapshot.relationships.len(),
            rules = snapshot.schema_rules.len(),
            last_committed_tx = snapshot.last_committed_tx,
            "restoring store snapshot"
        );
        for rule in snapshot.schema_rules {
            self.schema.create_rule(rule);
        }
        for node in snapshot.nodes {
            self.records.note_node_high_id(node.id);
            self.label_scan.rebuild(node.id, &node.labels);
            for rule in self.schema.rules() {
                if node.has_label(rule.label) {
                    if let Some(value) = node.properties.get(&rule.property) {
                        self.schema.rebuild_entry(rule.id, node.id, value);
                    }
                }
            }
            self.records.write_node(node);
        }
        for relationship in snapshot.relationships {
            self.records.note_relationship_high_id(relationship.id);
            self.records.write_relationship(relationship);
        }
    }

    /// Writes the snapshot file atomically (sidecar, fsync, rename).
    pub fn write_snapshot(&self, path: impl AsRef<Path>, last_committed_tx: TxId) -> Result<()> {
        let path = path.as_ref();
        let snapshot = self.snapshot(last_committed_tx);
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        let tmp = sidecar(path);
        fs::write(&tmp, &bytes)?;
        File::open(&tmp)?.sync_data()?;
        fs::rename(&tmp, path)?;
        debug!(last_committed_tx, "store snapshot written");
        Ok(())
    }

    /// Loads a snapshot file if one exists.
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Option<StoreSnapshot>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        let snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Corruption(format!("store snapshot: {e}")))?;
        Ok(Some(snapshot))
    }
}

impl RecordAccess for Storage {
    fn node(&self, id: NodeId) -> Option<NodeRecord> {
        self.records.node(id)
    }

    fn relationship(&self, id: RelationshipId) -> Option<RelationshipRecord> {
        self.records.relationship(id)
    }

    fn relationships_of(&self, node: NodeId) -> Vec<RelationshipRecord> {
        self.records.relationships_of(node)
    }
}

fn sidecar(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
