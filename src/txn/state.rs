//! In-memory transaction edit set and the record-access seam.
//!
//! `TxState` accumulates entity-level edits while a transaction is open.
//! Nothing here touches the stores; the translator turns a finished edit set
//! into commands against before images read through [`RecordAccess`].

use crate::index::schema::{AuxChange, SchemaRule};
use crate::model::{
    EntityRef, LabelId, NodeId, NodeRecord, PropertyValue, RelTypeId, RelationshipId,
    RelationshipRecord,
};
use std::collections::{BTreeMap, BTreeSet};

/// Read access to committed record images, implemented by the store layer.
pub trait RecordAccess {
    fn node(&self, id: NodeId) -> Option<NodeRecord>;
    fn relationship(&self, id: RelationshipId) -> Option<RelationshipRecord>;
    /// Committed relationships with `node` as either endpoint. Constraint
    /// checks use this to keep node deletion from leaving dangling
    /// relationships behind.
    fn relationships_of(&self, node: NodeId) -> Vec<RelationshipRecord>;
}

/// One transaction's accumulated logical changes.
#[derive(Debug, Default)]
pub struct TxState {
    pub created_nodes: BTreeSet<NodeId>,
    pub deleted_nodes: BTreeSet<NodeId>,
    pub added_labels: BTreeMap<NodeId, BTreeSet<LabelId>>,
    pub removed_labels: BTreeMap<NodeId, BTreeSet<LabelId>>,
    pub node_properties_set: BTreeMap<NodeId, BTreeMap<String, PropertyValue>>,
    pub node_properties_removed: BTreeMap<NodeId, BTreeSet<String>>,
    pub created_relationships: BTreeMap<RelationshipId, (NodeId, RelTypeId, NodeId)>,
    pub deleted_relationships: BTreeSet<RelationshipId>,
    pub relationship_properties_set: BTreeMap<RelationshipId, BTreeMap<String, PropertyValue>>,
    pub created_schema_rules: Vec<SchemaRule>,
    pub dropped_schema_rules: Vec<u64>,
    pub aux_changes: Vec<(String, EntityRef, String, AuxChange)>,
}

impl TxState {
    pub fn is_empty(&self) -> bool {
        self.created_nodes.is_empty()
            && self.deleted_nodes.is_empty()
            && self.added_labels.is_empty()
            && self.removed_labels.is_empty()
            && self.node_properties_set.is_empty()
            && self.node_properties_removed.is_empty()
            && self.created_relationships.is_empty()
            && self.deleted_relationships.is_empty()
            && self.relationship_properties_set.is_empty()
            && self.created_schema_rules.is_empty()
            && self.dropped_schema_rules.is_empty()
            && self.aux_changes.is_empty()
    }

    pub fn clear(&mut self) {
        *self = TxState::default();
    }

    /// Every node id touched by this transaction, in id order.
    pub fn affected_nodes(&self) -> BTreeSet<NodeId> {
        let mut ids = BTreeSet::new();
        ids.extend(self.created_nodes.iter().copied());
        ids.extend(self.deleted_nodes.iter().copied());
        ids.extend(self.added_labels.keys().copied());
        ids.extend(self.removed_labels.keys().copied());
        ids.extend(self.node_properties_set.keys().copied());
        ids.extend(self.node_properties_removed.keys().copied());
        ids
    }

    /// Every relationship id touched by this transaction, in id order.
    pub fn affected_relationships(&self) -> BTreeSet<RelationshipId> {
        let mut ids = BTreeSet::new();
        ids.extend(self.created_relationships.keys().copied());
        ids.extend(self.deleted_relationships.iter().copied());
        ids.extend(self.relationship_properties_set.keys().copied());
        ids
    }

    /// The node image this transaction would leave behind for `id`, starting
    /// from the committed image in `reader`. `None` means the node neither
    /// exists nor is created here.
    pub fn node_after_image(&self, id: NodeId, reader: &dyn RecordAccess) -> Option<NodeRecord> {
        let mut record = if self.created_nodes.contains(&id) {
            let mut r = NodeRecord::unused(id);
            r.in_use = true;
            r
        } else {
            reader.node(id)?
        };
        if self.deleted_nodes.contains(&id) {
            return Some(NodeRecord::unused(id));
        }
        if let Some(labels) = self.added_labels.get(&id) {
            for label in labels {
                record.add_label(*label);
            }
        }
        if let Some(labels) = self.removed_labels.get(&id) {
            for label in labels {
                record.remove_label(*label);
            }
        }
        if let Some(props) = self.node_properties_set.get(&id) {
            for (key, value) in props {
                record.properties.insert(key.clone(), value.clone());
            }
        }
        if let Some(keys) = self.node_properties_removed.get(&id) {
            for key in keys {
                record.properties.remove(key);
            }
        }
        Some(record)
    }

    /// The relationship image this transaction would leave behind for `id`.
    pub fn relationship_after_image(
        &self,
        id: RelationshipId,
        reader: &dyn RecordAccess,
    ) -> Option<RelationshipRecord> {
        let mut record = if let Some((start, rel_type, end)) = self.created_relationships.get(&id) {
            RelationshipRecord {
                id,
                in_use: true,
                start: *start,
                end: *end,
                rel_type: *rel_type,
                properties: BTreeMap::new(),
            }
        } else {
            reader.relationship(id)?
        };
        if self.deleted_relationships.contains(&id) {
            return Some(RelationshipRecord::unused(id));
        }
        if let Some(props) = self.relationship_properties_set.get(&id) {
            for (key, value) in props {
                record.properties.insert(key.clone(), value.clone());
            }
        }
        Some(record)
    }
}
