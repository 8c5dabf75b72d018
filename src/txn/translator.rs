//! Translation of transaction state into an ordered command list.
//!
//! The translator visits the edit set in a fixed order (nodes by id, then
//! relationships by id, then schema changes), accumulating before and after
//! record images through the [`RecordAccess`] seam, and only materializes
//! commands once every visit has completed. Aggregate count deltas are
//! accumulated alongside by diffing the label and type sets implied by the
//! visited changes, and are emitted as the trailing commands.
//!
//! Constraint checks run before anything else. A violation aborts the whole
//! translation with nothing emitted, which is what makes a failed commit
//! atomic: there is no partial command list to apply.

use crate::error::{EngineError, Result};
use crate::index::schema::{SchemaAction, SchemaIndexes};
use crate::model::{LabelId, NodeId, NodeRecord, RelTypeId, TxId, ANY_LABEL, ANY_REL_TYPE};
use crate::txn::command::{Command, TransactionRepresentation};
use crate::txn::state::{RecordAccess, TxState};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// A pluggable constraint check run against the full edit set before any
/// command is produced.
pub trait ConstraintCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, state: &TxState, reader: &dyn RecordAccess) -> Result<()>;
}

/// Enforces unique schema index rules: no two nodes may end up with the same
/// value for a uniquely indexed (label, property) pair.
pub struct UniquenessCheck {
    schema: Arc<SchemaIndexes>,
}

impl UniquenessCheck {
    pub fn new(schema: Arc<SchemaIndexes>) -> Self {
        Self { schema }
    }
}

impl ConstraintCheck for UniquenessCheck {
    fn name(&self) -> &'static str {
        "uniqueness"
    }

    fn check(&self, state: &TxState, reader: &dyn RecordAccess) -> Result<()> {
        for rule in self.schema.unique_rules() {
            let mut seen: BTreeMap<String, NodeId> = BTreeMap::new();
            for id in state.affected_nodes() {
                let Some(after) = state.node_after_image(id, reader) else {
                    continue;
                };
                if !after.in_use || !after.has_label(rule.label) {
                    continue;
                }
                let Some(value) = after.properties.get(&rule.property) else {
                    continue;
                };
                let key = serde_json::to_string(value)
                    .map_err(|e| EngineError::Serialization(e.to_string()))?;
                if let Some(other) = seen.insert(key, id) {
                    if other != id {
                        return Err(EngineError::ConstraintViolation(format!(
                            "nodes {other} and {id} both assign the uniquely indexed \
                             property {:?} of label {}",
                            rule.property, rule.label
                        )));
                    }
                }
                for existing in self.schema.lookup_by_rule(rule.id, value) {
                    if existing == id {
                        continue;
                    }
                    // The existing holder may be releasing the value in this
                    // same transaction.
                    let still_holds = state
                        .node_after_image(existing, reader)
                        .map(|r| {
                            r.in_use
                                && r.has_label(rule.label)
                                && r.properties.get(&rule.property) == Some(value)
                        })
                        .unwrap_or(true);
                    if still_holds {
                        return Err(EngineError::ConstraintViolation(format!(
                            "node {existing} already holds the uniquely indexed \
                             property {:?} of label {}",
                            rule.property, rule.label
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Enforces that relationship endpoints exist once the transaction is done,
/// and that a deleted node leaves no relationship dangling: every committed
/// relationship touching it must be deleted in the same transaction.
pub struct ExistenceCheck;

impl ConstraintCheck for ExistenceCheck {
    fn name(&self) -> &'static str {
        "existence"
    }

    fn check(&self, state: &TxState, reader: &dyn RecordAccess) -> Result<()> {
        for (rel, (start, _, end)) in &state.created_relationships {
            for node in [start, end] {
                let alive = state
                    .node_after_image(*node, reader)
                    .map(|r| r.in_use)
                    .unwrap_or(false);
                if !alive {
                    return Err(EngineError::ConstraintViolation(format!(
                        "relationship {rel} references node {node} which does not exist"
                    )));
                }
            }
        }
        for node in &state.deleted_nodes {
            for rel in reader.relationships_of(*node) {
                let gone = state
                    .relationship_after_image(rel.id, reader)
                    .map(|r| !r.in_use)
                    .unwrap_or(true);
                if !gone {
                    return Err(EngineError::ConstraintViolation(format!(
                        "node {node} cannot be deleted while relationship {} references it",
                        rel.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CountsDelta {
    nodes: BTreeMap<LabelId, i64>,
    relationships: BTreeMap<(LabelId, RelTypeId, LabelId), i64>,
}

impl CountsDelta {
    fn note_node(&mut self, before: &NodeRecord, after: &NodeRecord) {
        match (before.in_use, after.in_use) {
            (false, true) => {
                *self.nodes.entry(ANY_LABEL).or_insert(0) += 1;
                for label in &after.labels {
                    *self.nodes.entry(*label).or_insert(0) += 1;
                }
            }
            (true, false) => {
                *self.nodes.entry(ANY_LABEL).or_insert(0) -= 1;
                for label in &before.labels {
                    *self.nodes.entry(*label).or_insert(0) -= 1;
                }
            }
            (true, true) => {
                for label in &after.labels {
                    if !before.has_label(*label) {
                        *self.nodes.entry(*label).or_insert(0) += 1;
                    }
                }
                for label in &before.labels {
                    if !after.has_label(*label) {
                        *self.nodes.entry(*label).or_insert(0) -= 1;
                    }
                }
            }
            (false, false) => {}
        }
    }

    /// Only wildcard-bearing keys are maintained; a fully concrete
    /// (start, type, end) triple is answered by intersecting queries, which
    /// keeps the stored key set linear in the label count.
    fn note_relationship(
        &mut self,
        rel_type: RelTypeId,
        start_labels: &[LabelId],
        end_labels: &[LabelId],
        delta: i64,
    ) {
        *self
            .relationships
            .entry((ANY_LABEL, ANY_REL_TYPE, ANY_LABEL))
            .or_insert(0) += delta;
        *self
            .relationships
            .entry((ANY_LABEL, rel_type, ANY_LABEL))
            .or_insert(0) += delta;
        for start in start_labels {
            *self
                .relationships
                .entry((*start, rel_type, ANY_LABEL))
                .or_insert(0) += delta;
        }
        for end in end_labels {
            *self
                .relationships
                .entry((ANY_LABEL, rel_type, *end))
                .or_insert(0) += delta;
        }
    }

    fn extract_into(self, commands: &mut Vec<Command>) {
        for (label, delta) in self.nodes {
            if delta != 0 {
                commands.push(Command::NodeCounts { label, delta });
            }
        }
        for ((start, rel_type, end), delta) in self.relationships {
            if delta != 0 {
                commands.push(Command::RelationshipCounts {
                    start,
                    rel_type,
                    end,
                    delta,
                });
            }
        }
    }
}

/// Converts an open transaction's edit set into an ordered command list,
/// decorated by pluggable constraint checks.
pub struct TransactionStateTranslator {
    checks: Vec<Box<dyn ConstraintCheck>>,
}

impl TransactionStateTranslator {
    pub fn new() -> Self {
        Self { checks: Vec::new() }
    }

    /// The standard decoration: uniqueness and existence checks.
    pub fn standard(schema: Arc<SchemaIndexes>) -> Self {
        Self::new()
            .with_check(Box::new(UniquenessCheck::new(schema)))
            .with_check(Box::new(ExistenceCheck))
    }

    pub fn with_check(mut self, check: Box<dyn ConstraintCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Translates `state` into a [`TransactionRepresentation`].
    ///
    /// Runs every constraint check first; a violation aborts with nothing
    /// emitted. Must complete before the log or stores are touched.
    pub fn translate(
        &self,
        state: &TxState,
        reader: &dyn RecordAccess,
        started_after_tx: TxId,
    ) -> Result<TransactionRepresentation> {
        for check in &self.checks {
            trace!(check = check.name(), "running constraint check");
            check.check(state, reader)?;
        }

        let mut counts = CountsDelta::default();
        let mut node_changes = Vec::new();
        for id in state.affected_nodes() {
            let before = if state.created_nodes.contains(&id) {
                NodeRecord::unused(id)
            } else {
                reader
                    .node(id)
                    .ok_or(EngineError::NotFound("node"))?
            };
            let after = state
                .node_after_image(id, reader)
                .unwrap_or_else(|| NodeRecord::unused(id));
            if before == after {
                continue;
            }
            counts.note_node(&before, &after);
            node_changes.push((id, before, after));
        }

        let mut relationship_changes = Vec::new();
        for id in state.affected_relationships() {
            let before = if state.created_relationships.contains_key(&id) {
                crate::model::RelationshipRecord::unused(id)
            } else {
                reader
                    .relationship(id)
                    .ok_or(EngineError::NotFound("relationship"))?
            };
            let after = state
                .relationship_after_image(id, reader)
                .unwrap_or_else(|| crate::model::RelationshipRecord::unused(id));
            if before == after {
                continue;
            }
            match (before.in_use, after.in_use) {
                (false, true) => {
                    let start = endpoint_labels(state, reader, after.start, true);
                    let end = endpoint_labels(state, reader, after.end, true);
                    counts.note_relationship(after.rel_type, &start, &end, 1);
                }
                (true, false) => {
                    let start = endpoint_labels(state, reader, before.start, false);
                    let end = endpoint_labels(state, reader, before.end, false);
                    counts.note_relationship(before.rel_type, &start, &end, -1);
                }
                _ => {}
            }
            relationship_changes.push((id, before, after));
        }

        // All visits are done; materialize commands in their final order.
        let mut commands = Vec::new();
        for (id, before, after) in node_changes {
            commands.push(Command::Node { id, before, after });
        }
        for (id, before, after) in relationship_changes {
            commands.push(Command::Relationship { id, before, after });
        }
        for rule in &state.created_schema_rules {
            commands.push(Command::SchemaRule {
                rule: rule.clone(),
                action: SchemaAction::Create,
            });
        }
        for rule_id in &state.dropped_schema_rules {
            commands.push(Command::SchemaRule {
                rule: crate::index::schema::SchemaRule {
                    id: *rule_id,
                    label: 0,
                    property: String::new(),
                    unique: false,
                },
                action: SchemaAction::Drop,
            });
        }
        for (index, entity, key, change) in &state.aux_changes {
            commands.push(Command::AuxIndex {
                index: index.clone(),
                entity: *entity,
                key: key.clone(),
                change: change.clone(),
            });
        }
        counts.extract_into(&mut commands);

        Ok(TransactionRepresentation::new(commands, started_after_tx))
    }
}

impl Default for TransactionStateTranslator {
    fn default() -> Self {
        Self::new()
    }
}

/// Label set of a relationship endpoint, for count keys. Creations use the
/// post-transaction image; deletions use the committed image so decrements
/// mirror the increments recorded when the relationship appeared.
fn endpoint_labels(
    state: &TxState,
    reader: &dyn RecordAccess,
    node: NodeId,
    after: bool,
) -> Vec<LabelId> {
    if after {
        state
            .node_after_image(node, reader)
            .filter(|r| r.in_use)
            .map(|r| r.labels)
            .unwrap_or_default()
    } else {
        reader
            .node(node)
            .map(|r| r.labels)
            .or_else(|| {
                state
                    .node_after_image(node, reader)
                    .filter(|r| r.in_use)
                    .map(|r| r.labels)
            })
            .unwrap_or_default()
    }
}
