//! Commands: ordered, serializable descriptions of physical mutations.
//!
//! A committed transaction is represented as an ordered command list. The
//! list is what gets appended to the write-ahead log and what the applier
//! chain dispatches over; commands are totally ordered within a transaction
//! and carry everything needed to reapply them during recovery.

use crate::index::schema::{AuxChange, SchemaAction, SchemaRule};
use crate::index::IndexUpdate;
use crate::model::{
    EntityRef, LabelId, NodeId, NodeRecord, RelTypeId, RelationshipId, RelationshipRecord, TxId,
};
use serde::{Deserialize, Serialize};

/// One physical mutation instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Overwrite a node record with its after image.
    Node {
        id: NodeId,
        before: NodeRecord,
        after: NodeRecord,
    },
    /// Overwrite a relationship record with its after image.
    Relationship {
        id: RelationshipId,
        before: RelationshipRecord,
        after: RelationshipRecord,
    },
    /// Create or drop a schema index rule.
    SchemaRule {
        rule: SchemaRule,
        action: SchemaAction,
    },
    /// Change an entry in a named auxiliary index.
    AuxIndex {
        index: String,
        entity: EntityRef,
        key: String,
        change: AuxChange,
    },
    /// Signed delta for a per-label node counter.
    NodeCounts { label: LabelId, delta: i64 },
    /// Signed delta for a (start-label, type, end-label) relationship
    /// counter.
    RelationshipCounts {
        start: LabelId,
        rel_type: RelTypeId,
        end: LabelId,
        delta: i64,
    },
}

/// The serializable form of a committed transaction: its ordered commands
/// plus the last-committed id observed when the transaction started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRepresentation {
    pub commands: Vec<Command>,
    pub started_after_tx: TxId,
}

impl TransactionRepresentation {
    pub fn new(commands: Vec<Command>, started_after_tx: TxId) -> Self {
        Self {
            commands,
            started_after_tx,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// A transaction queued for application, optionally chained with others into
/// a batch (recovery and bulk rebuild apply whole chains in one go).
#[derive(Debug)]
pub struct TxToApply {
    pub representation: TransactionRepresentation,
    /// Assigned at append time; already present when replaying the log.
    pub tx_id: Option<TxId>,
    /// Index updates derived during validation. Derived lazily per batch
    /// element because later elements may depend on store state written by
    /// earlier ones.
    pub validated_index_updates: Option<Vec<IndexUpdate>>,
    pub next: Option<Box<TxToApply>>,
}

impl TxToApply {
    pub fn new(representation: TransactionRepresentation) -> Self {
        Self {
            representation,
            tx_id: None,
            validated_index_updates: None,
            next: None,
        }
    }

    /// A transaction recovered from the log, id already assigned.
    pub fn with_id(representation: TransactionRepresentation, tx_id: TxId) -> Self {
        Self {
            representation,
            tx_id: Some(tx_id),
            validated_index_updates: None,
            next: None,
        }
    }

    /// Appends another transaction to the end of this chain.
    pub fn chain(&mut self, next: TxToApply) {
        match &mut self.next {
            Some(tail) => tail.chain(next),
            None => self.next = Some(Box::new(next)),
        }
    }

    pub fn len(&self) -> usize {
        let mut count = 1;
        let mut cur = self.next.as_deref();
        while let Some(tx) = cur {
            count += 1;
            cur = tx.next.as_deref();
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_appends_at_tail() {
        let rep = |label| TransactionRepresentation::new(
            vec![Command::NodeCounts { label, delta: 1 }],
            0,
        );
        let mut batch = TxToApply::new(rep(1));
        batch.chain(TxToApply::new(rep(2)));
        batch.chain(TxToApply::new(rep(3)));
        assert_eq!(batch.len(), 3);
        let second = batch.next.as_deref().unwrap();
        assert!(matches!(
            second.representation.commands[0],
            Command::NodeCounts { label: 2, .. }
        ));
    }
}
