//! Schema index rules, logical index updates, and auxiliary index
//! providers.
//!
//! Schema indexes map a (label, property) pair to node ids. Logical updates
//! are derived from a transaction's physical node commands during commit
//! validation and applied by the schema-index applier; the index structures
//! themselves are deliberately simple, the core's concern is the update
//! derivation, validation, and application protocol around them.

use crate::error::{EngineError, Result};
use crate::model::{EntityRef, LabelId, NodeId, PropertyValue};
use crate::txn::command::Command;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A schema index rule over one (label, property) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRule {
    pub id: u64,
    pub label: LabelId,
    pub property: String,
    /// Unique rules additionally back a uniqueness constraint.
    pub unique: bool,
}

/// Whether a schema rule command creates or drops its rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaAction {
    Create,
    Drop,
}

/// One logical index change derived from a physical node change.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexUpdate {
    pub rule_id: u64,
    pub node: NodeId,
    pub before: Option<PropertyValue>,
    pub after: Option<PropertyValue>,
}

/// Indexed property values are keyed by their canonical JSON encoding so
/// floats and strings share one map.
fn value_key(value: &PropertyValue) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// The engine's schema indexes.
#[derive(Debug)]
pub struct SchemaIndexes {
    rules: DashMap<u64, SchemaRule>,
    entries: DashMap<u64, Mutex<HashMap<String, BTreeSet<NodeId>>>>,
    next_rule_id: AtomicU64,
    max_entries: u64,
}

impl SchemaIndexes {
    pub fn new(max_entries: u64) -> Self {
        Self {
            rules: DashMap::new(),
            entries: DashMap::new(),
            next_rule_id: AtomicU64::new(1),
            max_entries,
        }
    }

    pub fn allocate_rule_id(&self) -> u64 {
        self.next_rule_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn create_rule(&self, rule: SchemaRule) {
        debug!(rule = rule.id, label = rule.label, property = %rule.property, unique = rule.unique, "schema index created");
        self.next_rule_id.fetch_max(rule.id + 1, Ordering::SeqCst);
        self.entries.entry(rule.id).or_default();
        self.rules.insert(rule.id, rule);
    }

    pub fn drop_rule(&self, rule_id: u64) {
        debug!(rule = rule_id, "schema index dropped");
        self.rules.remove(&rule_id);
        self.entries.remove(&rule_id);
    }

    pub fn rules(&self) -> Vec<SchemaRule> {
        self.rules.iter().map(|e| e.value().clone()).collect()
    }

    pub fn rule(&self, rule_id: u64) -> Option<SchemaRule> {
        self.rules.get(&rule_id).map(|r| r.clone())
    }

    pub fn unique_rules(&self) -> Vec<SchemaRule> {
        self.rules
            .iter()
            .filter(|e| e.value().unique)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Derives the logical index updates implied by a command list.
    ///
    /// Rules created by the same command list take part, so a transaction
    /// that creates an index and then writes indexed nodes validates against
    /// its own rule.
    pub fn derive_updates(&self, commands: &[Command]) -> Vec<IndexUpdate> {
        let mut rules: Vec<SchemaRule> = self.rules();
        let mut dropped: HashSet<u64> = HashSet::new();
        for command in commands {
            if let Command::SchemaRule { rule, action } = command {
                match action {
                    SchemaAction::Create => rules.push(rule.clone()),
                    SchemaAction::Drop => {
                        dropped.insert(rule.id);
                    }
                }
            }
        }
        rules.retain(|r| !dropped.contains(&r.id));

        let mut updates = Vec::new();
        for command in commands {
            let Command::Node { id, before, after } = command else {
                continue;
            };
            for rule in &rules {
                let was = (before.in_use && before.has_label(rule.label))
                    .then(|| before.properties.get(&rule.property).cloned())
                    .flatten();
                let is = (after.in_use && after.has_label(rule.label))
                    .then(|| after.properties.get(&rule.property).cloned())
                    .flatten();
                if was != is {
                    updates.push(IndexUpdate {
                        rule_id: rule.id,
                        node: *id,
                        before: was,
                        after: is,
                    });
                }
            }
        }
        updates
    }

    /// Checks that the derived updates can be applied: every target rule
    /// still exists (or is created in the same command list) and no index
    /// would exceed its entry capacity.
    pub fn validate_updates(&self, commands: &[Command], updates: &[IndexUpdate]) -> Result<()> {
        let mut created: HashSet<u64> = HashSet::new();
        for command in commands {
            if let Command::SchemaRule {
                rule,
                action: SchemaAction::Create,
            } = command
            {
                created.insert(rule.id);
            }
        }
        let mut additions: HashMap<u64, u64> = HashMap::new();
        for update in updates {
            if !created.contains(&update.rule_id) && !self.rules.contains_key(&update.rule_id) {
                return Err(EngineError::ValidationFailed(format!(
                    "index rule {} no longer exists",
                    update.rule_id
                )));
            }
            if update.after.is_some() && update.before.is_none() {
                *additions.entry(update.rule_id).or_insert(0) += 1;
            }
        }
        for (rule_id, added) in additions {
            let current = self
                .entries
                .get(&rule_id)
                .map(|m| m.lock().values().map(|s| s.len() as u64).sum())
                .unwrap_or(0);
            if current + added > self.max_entries {
                return Err(EngineError::ValidationFailed(format!(
                    "index rule {rule_id} exceeds its capacity of {} entries",
                    self.max_entries
                )));
            }
        }
        Ok(())
    }

    /// Applies one validated update. Removals of missing entries are
    /// tolerated so replay stays idempotent.
    pub fn apply_update(&self, update: &IndexUpdate) {
        let Some(index) = self.entries.get(&update.rule_id) else {
            return;
        };
        let mut index = index.lock();
        if let Some(before) = &update.before {
            if let Some(nodes) = index.get_mut(&value_key(before)) {
                nodes.remove(&update.node);
            }
        }
        if let Some(after) = &update.after {
            index.entry(value_key(after)).or_default().insert(update.node);
        }
    }

    /// Node ids currently indexed under `value` for the rule covering
    /// (label, property), if such a rule exists.
    pub fn lookup(
        &self,
        label: LabelId,
        property: &str,
        value: &PropertyValue,
    ) -> Option<Vec<NodeId>> {
        let rule = self
            .rules
            .iter()
            .find(|e| e.value().label == label && e.value().property == property)?;
        let nodes = self.lookup_by_rule(rule.value().id, value);
        Some(nodes)
    }

    pub fn lookup_by_rule(&self, rule_id: u64, value: &PropertyValue) -> Vec<NodeId> {
        self.entries
            .get(&rule_id)
            .and_then(|m| m.lock().get(&value_key(value)).map(|s| s.iter().copied().collect()))
            .unwrap_or_default()
    }

    /// Rebuilds index entries from scratch, used when loading a store
    /// snapshot at startup.
    pub fn rebuild_entry(&self, rule_id: u64, node: NodeId, value: &PropertyValue) {
        if let Some(index) = self.entries.get(&rule_id) {
            index
                .lock()
                .entry(value_key(value))
                .or_default()
                .insert(node);
        }
    }
}

/// How an auxiliary index entry changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuxChange {
    Add(PropertyValue),
    Remove,
}

/// An auxiliary (non-schema) index engine, looked up by provider key.
/// Invoked only from the auxiliary-index applier.
pub trait AuxIndexProvider: Send + Sync {
    fn apply(&self, entity: EntityRef, key: &str, change: &AuxChange) -> Result<()>;
    fn lookup(&self, key: &str, value: &PropertyValue) -> Vec<EntityRef>;
}

/// Registry of auxiliary index providers.
#[derive(Default)]
pub struct AuxIndexes {
    providers: DashMap<String, Arc<dyn AuxIndexProvider>>,
}

impl AuxIndexes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn AuxIndexProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn provider(&self, name: &str) -> Result<Arc<dyn AuxIndexProvider>> {
        self.providers
            .get(name)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| {
                EngineError::InvalidArgument(format!("no auxiliary index provider named {name:?}"))
            })
    }
}

impl std::fmt::Debug for AuxIndexes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuxIndexes")
            .field("providers", &self.providers.len())
            .finish()
    }
}

/// Simple in-memory auxiliary index, the default provider.
#[derive(Debug, Default)]
pub struct MemoryAuxIndex {
    entries: DashMap<(String, String), BTreeSet<EntityRef>>,
}

impl MemoryAuxIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

// BTreeSet needs Ord on EntityRef.
impl PartialOrd for EntityRef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntityRef {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn rank(e: &EntityRef) -> (u8, u64) {
            match e {
                EntityRef::Node(id) => (0, *id),
                EntityRef::Relationship(id) => (1, *id),
            }
        }
        rank(self).cmp(&rank(other))
    }
}

impl AuxIndexProvider for MemoryAuxIndex {
    fn apply(&self, entity: EntityRef, key: &str, change: &AuxChange) -> Result<()> {
        match change {
            AuxChange::Add(value) => {
                self.entries
                    .entry((key.to_string(), value_key(value)))
                    .or_default()
                    .insert(entity);
            }
            AuxChange::Remove => {
                for mut slot in self.entries.iter_mut() {
                    if slot.key().0 == key {
                        slot.value_mut().remove(&entity);
                    }
                }
            }
        }
        Ok(())
    }

    fn lookup(&self, key: &str, value: &PropertyValue) -> Vec<EntityRef> {
        self.entries
            .get(&(key.to_string(), value_key(value)))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}
