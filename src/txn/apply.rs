//! Command application: apply modes, the applier chain, and the individual
//! appliers.
//!
//! Applying a transaction walks its command list once, dispatching every
//! command to every applier in chain order. Each applier reacts only to the
//! command kinds it owns. The chain guarantees that once `begin` has run,
//! `end` runs on every applier even when a visit fails partway through; the
//! first error is returned after the chain has wound down. That keeps
//! transaction-scoped resources (the counts updater above all) from leaking
//! on a failed apply.

use crate::error::Result;
use crate::index::label_scan::{LabelScanSync, LabelUpdate};
use crate::index::schema::{AuxIndexes, IndexUpdate, SchemaAction, SchemaIndexes};
use crate::store::counts::{CountsStore, CountsUpdater};
use crate::store::records::RecordStores;
use crate::txn::command::{Command, TxToApply};
use tracing::trace;

/// Who is applying and why; decides which appliers join the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionApplyMode {
    /// A transaction committed by this engine instance. Ids were allocated
    /// here and caches were maintained on the write path already.
    Internal,
    /// A transaction produced elsewhere (replication pull, batch import).
    External,
    /// Log replay after a restart.
    Recovery,
}

impl TransactionApplyMode {
    /// Externally produced commands carry ids allocated elsewhere, so the
    /// high-id watermarks have to be dragged along while applying.
    pub fn needs_high_id_tracking(self) -> bool {
        !matches!(self, TransactionApplyMode::Internal)
    }

    /// Whether cached records may predate these commands and must be evicted.
    pub fn needs_cache_invalidation(self) -> bool {
        !matches!(self, TransactionApplyMode::Internal)
    }

    /// Recovery replays from the log, so there is nothing to append and no
    /// commit ordering to wait for.
    pub fn is_recovery(self) -> bool {
        matches!(self, TransactionApplyMode::Recovery)
    }
}

/// One stage of the applier chain.
pub trait CommandApplier {
    fn begin(&mut self, _tx: &TxToApply) -> Result<()> {
        Ok(())
    }
    fn visit(&mut self, command: &Command) -> Result<()>;
    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Ordered chain of appliers sharing one pass over a command list.
pub struct ApplierChain<'a> {
    appliers: Vec<Box<dyn CommandApplier + 'a>>,
}

impl<'a> ApplierChain<'a> {
    pub fn new() -> Self {
        Self {
            appliers: Vec::new(),
        }
    }

    pub fn push(&mut self, applier: Box<dyn CommandApplier + 'a>) {
        self.appliers.push(applier);
    }

    /// Applies one transaction's commands through every applier.
    ///
    /// After `begin`, `end` is invoked on every applier no matter what; the
    /// first error encountered anywhere wins.
    pub fn apply(&mut self, tx: &TxToApply) -> Result<()> {
        let mut first_error: Option<crate::error::EngineError> = None;
        for applier in &mut self.appliers {
            if let Err(e) = applier.begin(tx) {
                first_error = Some(e);
                break;
            }
        }
        if first_error.is_none() {
            'commands: for command in &tx.representation.commands {
                for applier in &mut self.appliers {
                    if let Err(e) = applier.visit(command) {
                        first_error = Some(e);
                        break 'commands;
                    }
                }
            }
        }
        for applier in &mut self.appliers {
            if let Err(e) = applier.end() {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for ApplierChain<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes record after images into the stores.
pub struct StoreApplier<'a> {
    records: &'a RecordStores,
}

impl<'a> StoreApplier<'a> {
    pub fn new(records: &'a RecordStores) -> Self {
        Self { records }
    }
}

impl CommandApplier for StoreApplier<'_> {
    fn visit(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::Node { after, .. } => self.records.write_node(after.clone()),
            Command::Relationship { after, .. } => {
                self.records.write_relationship(after.clone())
            }
            _ => {}
        }
        Ok(())
    }
}

/// Drags the id allocation watermarks along with externally allocated ids.
pub struct HighIdApplier<'a> {
    records: &'a RecordStores,
}

impl<'a> HighIdApplier<'a> {
    pub fn new(records: &'a RecordStores) -> Self {
        Self { records }
    }
}

impl CommandApplier for HighIdApplier<'_> {
    fn visit(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::Node { id, .. } => self.records.note_node_high_id(*id),
            Command::Relationship { id, .. } => self.records.note_relationship_high_id(*id),
            _ => {}
        }
        Ok(())
    }
}

/// Evicts cached records overwritten by commands this instance did not
/// produce.
pub struct CacheInvalidationApplier<'a> {
    records: &'a RecordStores,
}

impl<'a> CacheInvalidationApplier<'a> {
    pub fn new(records: &'a RecordStores) -> Self {
        Self { records }
    }
}

impl CommandApplier for CacheInvalidationApplier<'_> {
    fn visit(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::Node { id, .. } => self.records.node_cache().invalidate(id),
            Command::Relationship { id, .. } => {
                self.records.relationship_cache().invalidate(id)
            }
            _ => {}
        }
        Ok(())
    }
}

/// Maintains schema index rules and entries, and feeds the label scan store.
///
/// Index entry updates were validated before append; they are applied at
/// `end`, together with the collected label membership changes, so record
/// writes land before index readers can observe them.
pub struct SchemaIndexApplier<'a> {
    schema: &'a SchemaIndexes,
    label_scan: &'a LabelScanSync,
    index_updates: Vec<IndexUpdate>,
    label_updates: Vec<LabelUpdate>,
}

impl<'a> SchemaIndexApplier<'a> {
    pub fn new(schema: &'a SchemaIndexes, label_scan: &'a LabelScanSync) -> Self {
        Self {
            schema,
            label_scan,
            index_updates: Vec::new(),
            label_updates: Vec::new(),
        }
    }
}

impl CommandApplier for SchemaIndexApplier<'_> {
    fn begin(&mut self, tx: &TxToApply) -> Result<()> {
        if let Some(updates) = &tx.validated_index_updates {
            self.index_updates = updates.clone();
        }
        Ok(())
    }

    fn visit(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::SchemaRule { rule, action } => match action {
                SchemaAction::Create => self.schema.create_rule(rule.clone()),
                SchemaAction::Drop => self.schema.drop_rule(rule.id),
            },
            Command::Node { id, before, after } => {
                if before.labels != after.labels {
                    self.label_updates.push(LabelUpdate {
                        node: *id,
                        before: before.labels.clone(),
                        after: after.labels.clone(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        let label_updates = std::mem::take(&mut self.label_updates);
        self.label_scan.apply(label_updates);
        for update in self.index_updates.drain(..) {
            self.schema.apply_update(&update);
        }
        Ok(())
    }
}

/// Routes auxiliary index commands to their registered provider.
pub struct AuxIndexApplier<'a> {
    aux: &'a AuxIndexes,
}

impl<'a> AuxIndexApplier<'a> {
    pub fn new(aux: &'a AuxIndexes) -> Self {
        Self { aux }
    }
}

impl CommandApplier for AuxIndexApplier<'_> {
    fn visit(&mut self, command: &Command) -> Result<()> {
        if let Command::AuxIndex {
            index,
            entity,
            key,
            change,
        } = command
        {
            self.aux.provider(index)?.apply(*entity, key, change)?;
        }
        Ok(())
    }
}

/// Folds count deltas into the counts store through a transaction-scoped
/// updater.
///
/// A transaction the store already reflects gets no updater; the visits then
/// do nothing and `end` closes nothing. That branch is taken on every replay
/// of an already-counted transaction and is perfectly ordinary.
pub struct CountsApplier<'a> {
    counts: &'a CountsStore,
    updater: Option<CountsUpdater<'a>>,
}

impl<'a> CountsApplier<'a> {
    pub fn new(counts: &'a CountsStore) -> Self {
        Self {
            counts,
            updater: None,
        }
    }
}

impl CommandApplier for CountsApplier<'_> {
    fn begin(&mut self, tx: &TxToApply) -> Result<()> {
        if let Some(tx_id) = tx.tx_id {
            self.updater = self.counts.open_updater(tx_id);
            if self.updater.is_none() {
                trace!(tx_id, "counts updater skipped, deltas already applied");
            }
        }
        Ok(())
    }

    fn visit(&mut self, command: &Command) -> Result<()> {
        let Some(updater) = &mut self.updater else {
            return Ok(());
        };
        match command {
            Command::NodeCounts { label, delta } => {
                updater.increment_node_count(*label, *delta);
            }
            Command::RelationshipCounts {
                start,
                rel_type,
                end,
                delta,
            } => {
                updater.increment_relationship_count(*start, *rel_type, *end, *delta);
            }
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        if let Some(updater) = self.updater.take() {
            updater.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::model::ANY_LABEL;
    use crate::txn::command::TransactionRepresentation;

    struct FailingApplier;

    impl CommandApplier for FailingApplier {
        fn visit(&mut self, _command: &Command) -> Result<()> {
            Err(EngineError::ApplyFailed("injected".into()))
        }
    }

    struct EndCounter<'a> {
        ended: &'a mut bool,
    }

    impl CommandApplier for EndCounter<'_> {
        fn visit(&mut self, _command: &Command) -> Result<()> {
            Ok(())
        }
        fn end(&mut self) -> Result<()> {
            *self.ended = true;
            Ok(())
        }
    }

    #[test]
    fn end_runs_even_when_a_visit_fails() {
        let mut ended = false;
        let tx = TxToApply::with_id(
            TransactionRepresentation::new(
                vec![Command::NodeCounts {
                    label: ANY_LABEL,
                    delta: 1,
                }],
                0,
            ),
            1,
        );
        let mut chain = ApplierChain::new();
        chain.push(Box::new(FailingApplier));
        chain.push(Box::new(EndCounter { ended: &mut ended }));
        let err = chain.apply(&tx).unwrap_err();
        assert!(matches!(err, EngineError::ApplyFailed(_)));
        drop(chain);
        assert!(ended);
    }

    #[test]
    fn counts_applier_skips_already_applied_transaction() {
        let counts = CountsStore::in_memory();
        let tx = TxToApply::with_id(
            TransactionRepresentation::new(
                vec![Command::NodeCounts { label: 3, delta: 1 }],
                0,
            ),
            5,
        );
        let apply = |counts: &CountsStore| {
            let mut chain = ApplierChain::new();
            chain.push(Box::new(CountsApplier::new(counts)));
            chain.apply(&tx).unwrap();
        };
        apply(&counts);
        assert_eq!(counts.node_count(3), 1);
        // replaying the same id leaves the counters alone
        apply(&counts);
        assert_eq!(counts.node_count(3), 1);
    }

    #[test]
    fn store_applier_writes_after_images() {
        let records = RecordStores::new(16);
        let mut after = crate::model::NodeRecord::unused(2);
        after.in_use = true;
        let tx = TxToApply::with_id(
            TransactionRepresentation::new(
                vec![Command::Node {
                    id: 2,
                    before: crate::model::NodeRecord::unused(2),
                    after,
                }],
                0,
            ),
            1,
        );
        let mut chain = ApplierChain::new();
        chain.push(Box::new(StoreApplier::new(&records)));
        chain.push(Box::new(HighIdApplier::new(&records)));
        chain.apply(&tx).unwrap();
        assert!(records.node(2).is_some());
        assert_eq!(records.node_high_id(), 3);
    }
}
