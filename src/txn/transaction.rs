//! Pooled transaction objects and the public write-transaction handle.
//!
//! [`Transaction`] is the pooled inner object: it owns the edit set, the
//! lock-client lease, and the lifecycle flags, and it cycles between the
//! registry's pool and active use. [`TransactionHandle`] is the short-lived
//! public face handed to callers by [`crate::Engine::begin`]; dropping it
//! without committing rolls the transaction back and returns the pooled
//! object to the registry.

use crate::error::{EngineError, Result};
use crate::index::schema::AuxChange;
use crate::locks::{LockClient, LockResource};
use crate::model::{
    EntityRef, LabelId, NodeId, PropertyValue, RelTypeId, RelationshipId, TxId,
};
use crate::txn::state::TxState;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// A pooled transaction object.
#[derive(Debug)]
pub struct Transaction {
    seq: u64,
    state: Mutex<TxState>,
    open: AtomicBool,
    terminated: AtomicBool,
    disposed: AtomicBool,
    /// Registry generation observed when this cycle started. A stale
    /// generation at release time means the registry disposed everything
    /// while this transaction was out.
    generation: AtomicU64,
    lock_client: Mutex<Option<LockClient>>,
    last_committed_when_started: AtomicU64,
    reuse_count: AtomicU64,
}

impl Transaction {
    pub(crate) fn new(seq: u64, lock_client: LockClient) -> Self {
        Self {
            seq,
            state: Mutex::new(TxState::default()),
            open: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            lock_client: Mutex::new(Some(lock_client)),
            last_committed_when_started: AtomicU64::new(0),
            reuse_count: AtomicU64::new(0),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Starts a new use cycle of this pooled object.
    pub(crate) fn initialize(&self, last_committed: TxId, generation: u64) {
        self.terminated.store(false, Ordering::SeqCst);
        self.generation.store(generation, Ordering::SeqCst);
        self.last_committed_when_started
            .store(last_committed, Ordering::SeqCst);
        self.reuse_count.fetch_add(1, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Requests cooperative cancellation. The transaction observes the flag
    /// at its next safe point and aborts with [`EngineError::Terminated`].
    pub fn mark_for_termination(&self) {
        trace!(seq = self.seq, "transaction marked for termination");
        self.terminated.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn check_terminated(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(EngineError::Terminated);
        }
        Ok(())
    }

    pub(crate) fn state(&self) -> &Mutex<TxState> {
        &self.state
    }

    pub fn last_committed_when_started(&self) -> TxId {
        self.last_committed_when_started.load(Ordering::SeqCst)
    }

    /// Times this object has been handed out, a pooling metric.
    pub fn reuse_count(&self) -> u64 {
        self.reuse_count.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire_lock(&self, resource: LockResource) -> Result<()> {
        let client = self.lock_client.lock();
        match client.as_ref() {
            Some(client) => client.acquire_exclusive(resource),
            None => Err(EngineError::InvalidArgument(
                "transaction has been disposed".into(),
            )),
        }
    }

    /// Ends the current use cycle: clears the edit set, releases every held
    /// lock, and marks the object idle. The lock client stays leased for the
    /// next cycle.
    pub(crate) fn close(&self) {
        self.state.lock().clear();
        if let Some(client) = self.lock_client.lock().as_ref() {
            client.release_all();
        }
        self.open.store(false, Ordering::SeqCst);
    }

    /// Permanently retires the pooled object and its lock client.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close();
        if let Some(client) = self.lock_client.lock().take() {
            client.close();
        }
        trace!(seq = self.seq, "pooled transaction disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// A live write transaction.
///
/// Mutations accumulate in the transaction's edit set and become visible only
/// through [`TransactionHandle::commit`]. Dropping the handle without
/// committing rolls everything back.
pub struct TransactionHandle<'db> {
    engine: &'db crate::engine::Engine,
    inner: Arc<Transaction>,
    finished: bool,
}

impl<'db> TransactionHandle<'db> {
    pub(crate) fn new(engine: &'db crate::engine::Engine, inner: Arc<Transaction>) -> Self {
        Self {
            engine,
            inner,
            finished: false,
        }
    }

    pub fn inner(&self) -> &Arc<Transaction> {
        &self.inner
    }

    /// Creates a node with the given labels and properties, returning its id.
    pub fn create_node(
        &mut self,
        labels: &[LabelId],
        properties: &[(&str, PropertyValue)],
    ) -> Result<NodeId> {
        self.inner.check_terminated()?;
        let id = self.engine.storage().records().allocate_node_id();
        self.inner.acquire_lock(LockResource::Node(id))?;
        let mut state = self.inner.state().lock();
        state.created_nodes.insert(id);
        for label in labels {
            state.added_labels.entry(id).or_default().insert(*label);
        }
        for (key, value) in properties {
            state
                .node_properties_set
                .entry(id)
                .or_default()
                .insert((*key).to_string(), value.clone());
        }
        Ok(id)
    }

    pub fn delete_node(&mut self, id: NodeId) -> Result<()> {
        self.inner.check_terminated()?;
        self.inner.acquire_lock(LockResource::Node(id))?;
        self.ensure_node_exists(id)?;
        self.inner.state().lock().deleted_nodes.insert(id);
        Ok(())
    }

    pub fn add_label(&mut self, node: NodeId, label: LabelId) -> Result<()> {
        self.inner.check_terminated()?;
        self.inner.acquire_lock(LockResource::Node(node))?;
        self.ensure_node_exists(node)?;
        let mut state = self.inner.state().lock();
        state.removed_labels.entry(node).or_default().remove(&label);
        state.added_labels.entry(node).or_default().insert(label);
        Ok(())
    }

    pub fn remove_label(&mut self, node: NodeId, label: LabelId) -> Result<()> {
        self.inner.check_terminated()?;
        self.inner.acquire_lock(LockResource::Node(node))?;
        self.ensure_node_exists(node)?;
        let mut state = self.inner.state().lock();
        state.added_labels.entry(node).or_default().remove(&label);
        state.removed_labels.entry(node).or_default().insert(label);
        Ok(())
    }

    pub fn set_node_property(
        &mut self,
        node: NodeId,
        key: &str,
        value: PropertyValue,
    ) -> Result<()> {
        self.inner.check_terminated()?;
        self.inner.acquire_lock(LockResource::Node(node))?;
        self.ensure_node_exists(node)?;
        let mut state = self.inner.state().lock();
        if let Some(removed) = state.node_properties_removed.get_mut(&node) {
            removed.remove(key);
        }
        state
            .node_properties_set
            .entry(node)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove_node_property(&mut self, node: NodeId, key: &str) -> Result<()> {
        self.inner.check_terminated()?;
        self.inner.acquire_lock(LockResource::Node(node))?;
        self.ensure_node_exists(node)?;
        let mut state = self.inner.state().lock();
        if let Some(set) = state.node_properties_set.get_mut(&node) {
            set.remove(key);
        }
        state
            .node_properties_removed
            .entry(node)
            .or_default()
            .insert(key.to_string());
        Ok(())
    }

    /// Creates a relationship between two existing nodes, returning its id.
    pub fn create_relationship(
        &mut self,
        start: NodeId,
        rel_type: RelTypeId,
        end: NodeId,
    ) -> Result<RelationshipId> {
        self.inner.check_terminated()?;
        let id = self.engine.storage().records().allocate_relationship_id();
        self.inner.acquire_lock(LockResource::Relationship(id))?;
        self.inner.state().lock().created_relationships.insert(id, (start, rel_type, end));
        Ok(id)
    }

    pub fn delete_relationship(&mut self, id: RelationshipId) -> Result<()> {
        self.inner.check_terminated()?;
        self.inner.acquire_lock(LockResource::Relationship(id))?;
        let exists = {
            let state = self.inner.state().lock();
            state
                .relationship_after_image(id, self.engine.storage().as_ref())
                .map(|r| r.in_use)
                .unwrap_or(false)
        };
        if !exists {
            return Err(EngineError::NotFound("relationship"));
        }
        self.inner.state().lock().deleted_relationships.insert(id);
        Ok(())
    }

    pub fn set_relationship_property(
        &mut self,
        id: RelationshipId,
        key: &str,
        value: PropertyValue,
    ) -> Result<()> {
        self.inner.check_terminated()?;
        self.inner.acquire_lock(LockResource::Relationship(id))?;
        self.inner
            .state()
            .lock()
            .relationship_properties_set
            .entry(id)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Creates a schema index rule over (label, property); `unique` makes it
    /// additionally back a uniqueness constraint. Returns the rule id.
    pub fn create_index(
        &mut self,
        label: LabelId,
        property: &str,
        unique: bool,
    ) -> Result<u64> {
        self.inner.check_terminated()?;
        self.inner.acquire_lock(LockResource::Schema)?;
        let rule_id = self.engine.storage().schema().allocate_rule_id();
        self.inner
            .state()
            .lock()
            .created_schema_rules
            .push(crate::index::schema::SchemaRule {
                id: rule_id,
                label,
                property: property.to_string(),
                unique,
            });
        Ok(rule_id)
    }

    pub fn drop_index(&mut self, rule_id: u64) -> Result<()> {
        self.inner.check_terminated()?;
        self.inner.acquire_lock(LockResource::Schema)?;
        if self.engine.storage().schema().rule(rule_id).is_none() {
            return Err(EngineError::NotFound("schema rule"));
        }
        self.inner.state().lock().dropped_schema_rules.push(rule_id);
        Ok(())
    }

    /// Records an auxiliary index change dispatched to the named provider at
    /// apply time.
    pub fn add_to_aux_index(
        &mut self,
        index: &str,
        entity: EntityRef,
        key: &str,
        change: AuxChange,
    ) -> Result<()> {
        self.inner.check_terminated()?;
        // fail early when nobody can apply the change
        self.engine.storage().aux().provider(index)?;
        self.inner.state().lock().aux_changes.push((
            index.to_string(),
            entity,
            key.to_string(),
            change,
        ));
        Ok(())
    }

    /// The node image as this transaction sees it.
    pub fn node(&self, id: NodeId) -> Option<crate::model::NodeRecord> {
        self.inner
            .state()
            .lock()
            .node_after_image(id, self.engine.storage().as_ref())
            .filter(|r| r.in_use)
    }

    pub fn relationship(&self, id: RelationshipId) -> Option<crate::model::RelationshipRecord> {
        self.inner
            .state()
            .lock()
            .relationship_after_image(id, self.engine.storage().as_ref())
            .filter(|r| r.in_use)
    }

    /// Commits the transaction. Read-only transactions commit without
    /// touching the log and return `None`.
    pub fn commit(mut self) -> Result<Option<TxId>> {
        let result = self.engine.commit_pooled(&self.inner);
        self.finished = true;
        self.engine.release_pooled(Arc::clone(&self.inner));
        result
    }

    /// Discards every change made by this transaction.
    pub fn rollback(mut self) {
        self.finished = true;
        self.engine.release_pooled(Arc::clone(&self.inner));
    }
}

impl Drop for TransactionHandle<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.engine.release_pooled(Arc::clone(&self.inner));
        }
    }
}

impl TransactionHandle<'_> {
    fn ensure_node_exists(&self, id: NodeId) -> Result<()> {
        let exists = self
            .inner
            .state()
            .lock()
            .node_after_image(id, self.engine.storage().as_ref())
            .map(|r| r.in_use)
            .unwrap_or(false);
        if !exists {
            return Err(EngineError::NotFound("node"));
        }
        Ok(())
    }
}
