//! Core data model: entity ids, property values, and record images.
//!
//! Records are the unit of physical mutation. A command carries a before and
//! an after image of one record; applying a command overwrites the record by
//! id, which makes store application naturally idempotent under replay.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of a node.
pub type NodeId = u64;
/// Identifier of a relationship.
pub type RelationshipId = u64;
/// Identifier of a node label token.
pub type LabelId = u32;
/// Identifier of a relationship type token.
pub type RelTypeId = u32;
/// Identifier of a committed transaction, assigned at log-append time.
pub type TxId = u64;

/// Wildcard label used as a key component in aggregate counts.
pub const ANY_LABEL: LabelId = LabelId::MAX;
/// Wildcard relationship type used as a key component in aggregate counts.
pub const ANY_REL_TYPE: RelTypeId = RelTypeId::MAX;

/// A property value attached to a node or relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

/// Reference to either kind of entity, used by auxiliary index commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityRef {
    Node(NodeId),
    Relationship(RelationshipId),
}

/// Physical image of a node record.
///
/// A record with `in_use == false` is a tombstone; creation and deletion are
/// both expressed as an overwrite from one image to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub in_use: bool,
    /// Sorted, deduplicated label ids.
    pub labels: Vec<LabelId>,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl NodeRecord {
    /// An unused (not-in-use) image for the given id.
    pub fn unused(id: NodeId) -> Self {
        Self {
            id,
            in_use: false,
            labels: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn has_label(&self, label: LabelId) -> bool {
        self.labels.binary_search(&label).is_ok()
    }

    /// Adds a label, keeping the label list sorted and unique.
    pub fn add_label(&mut self, label: LabelId) {
        if let Err(pos) = self.labels.binary_search(&label) {
            self.labels.insert(pos, label);
        }
    }

    pub fn remove_label(&mut self, label: LabelId) {
        if let Ok(pos) = self.labels.binary_search(&label) {
            self.labels.remove(pos);
        }
    }
}

/// Physical image of a relationship record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub id: RelationshipId,
    pub in_use: bool,
    pub start: NodeId,
    pub end: NodeId,
    pub rel_type: RelTypeId,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl RelationshipRecord {
    /// An unused (not-in-use) image for the given id.
    pub fn unused(id: RelationshipId) -> Self {
        Self {
            id,
            in_use: false,
            start: 0,
            end: 0,
            rel_type: 0,
            properties: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_stay_sorted_and_unique() {
        let mut record = NodeRecord::unused(1);
        record.in_use = true;
        record.add_label(7);
        record.add_label(3);
        record.add_label(7);
        assert_eq!(record.labels, vec![3, 7]);
        assert!(record.has_label(3));
        record.remove_label(3);
        assert_eq!(record.labels, vec![7]);
        assert!(!record.has_label(3));
    }
}
