//! In-memory record stores with high-id tracking and a concurrent record
//! cache.
//!
//! The stores are the authoritative post-apply state; records are applied by
//! overwrite-by-id, so replaying a command a second time is harmless. The
//! cache fronts the read path and is evicted by the cache-invalidation
//! applier (and on every direct store write).

use crate::model::{NodeId, NodeRecord, RelationshipId, RelationshipRecord};
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Lock-free cache with approximate eviction, keyed by record id.
///
/// Uses DashMap for the underlying storage; eviction under pressure is
/// approximate and may not remove the coldest entry, which is acceptable for
/// a read cache.
pub struct RecordCache<K, V> {
    map: DashMap<K, V>,
    capacity: usize,
    size: AtomicUsize,
}

impl<K, V> std::fmt::Debug for RecordCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCache")
            .field("capacity", &self.capacity)
            .field("size", &self.size.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<K, V> RecordCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            map: DashMap::with_capacity(capacity.min(1024)),
            capacity,
            size: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    pub fn put(&self, key: K, value: V) {
        if self.map.contains_key(&key) {
            self.map.insert(key, value);
            return;
        }
        while self.size.load(Ordering::Relaxed) >= self.capacity {
            if !self.evict_one() {
                break;
            }
        }
        if self.map.insert(key, value).is_none() {
            self.size.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drops a single entry, used by the cache-invalidation applier.
    pub fn invalidate(&self, key: &K) {
        if self.map.remove(key).is_some() {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn clear(&self) {
        self.map.clear();
        self.size.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn evict_one(&self) -> bool {
        let victim = self.map.iter().next().map(|entry| entry.key().clone());
        match victim {
            Some(key) => {
                self.invalidate(&key);
                true
            }
            None => false,
        }
    }
}

/// Node and relationship stores plus their caches and high-id watermarks.
#[derive(Debug)]
pub struct RecordStores {
    nodes: DashMap<NodeId, NodeRecord>,
    relationships: DashMap<RelationshipId, RelationshipRecord>,
    node_cache: RecordCache<NodeId, NodeRecord>,
    relationship_cache: RecordCache<RelationshipId, RelationshipRecord>,
    /// First id never handed out for nodes.
    node_high_id: AtomicU64,
    relationship_high_id: AtomicU64,
}

impl RecordStores {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            nodes: DashMap::new(),
            relationships: DashMap::new(),
            node_cache: RecordCache::new(cache_capacity),
            relationship_cache: RecordCache::new(cache_capacity),
            node_high_id: AtomicU64::new(0),
            relationship_high_id: AtomicU64::new(0),
        }
    }

    /// Reads a node through the cache, falling back to the store.
    pub fn node(&self, id: NodeId) -> Option<NodeRecord> {
        if let Some(cached) = self.node_cache.get(&id) {
            return cached.in_use.then_some(cached);
        }
        let record = self.nodes.get(&id).map(|r| r.clone())?;
        self.node_cache.put(id, record.clone());
        record.in_use.then_some(record)
    }

    pub fn relationship(&self, id: RelationshipId) -> Option<RelationshipRecord> {
        if let Some(cached) = self.relationship_cache.get(&id) {
            return cached.in_use.then_some(cached);
        }
        let record = self.relationships.get(&id).map(|r| r.clone())?;
        self.relationship_cache.put(id, record.clone());
        record.in_use.then_some(record)
    }

    /// Overwrites a node record by id and drops any cached copy.
    pub fn write_node(&self, record: NodeRecord) {
        let id = record.id;
        self.nodes.insert(id, record);
        self.node_cache.invalidate(&id);
    }

    pub fn write_relationship(&self, record: RelationshipRecord) {
        let id = record.id;
        self.relationships.insert(id, record);
        self.relationship_cache.invalidate(&id);
    }

    /// Allocates a fresh node id on the normal write path.
    pub fn allocate_node_id(&self) -> NodeId {
        self.node_high_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn allocate_relationship_id(&self) -> RelationshipId {
        self.relationship_high_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Raises the node high-id watermark to cover `id`. Used by the high-id
    /// applier when replaying ids that were allocated elsewhere.
    pub fn note_node_high_id(&self, id: NodeId) {
        self.node_high_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    pub fn note_relationship_high_id(&self, id: RelationshipId) {
        self.relationship_high_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    pub fn node_high_id(&self) -> NodeId {
        self.node_high_id.load(Ordering::SeqCst)
    }

    pub fn relationship_high_id(&self) -> RelationshipId {
        self.relationship_high_id.load(Ordering::SeqCst)
    }

    pub fn node_cache(&self) -> &RecordCache<NodeId, NodeRecord> {
        &self.node_cache
    }

    pub fn relationship_cache(&self) -> &RecordCache<RelationshipId, RelationshipRecord> {
        &self.relationship_cache
    }

    /// All in-use node records, unordered. Snapshot/checkpoint use only.
    pub fn all_nodes(&self) -> Vec<NodeRecord> {
        self.nodes
            .iter()
            .filter(|e| e.value().in_use)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn all_relationships(&self) -> Vec<RelationshipRecord> {
        self.relationships
            .iter()
            .filter(|e| e.value().in_use)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Relationships attached to a node, used by constraint checks.
    pub fn relationships_of(&self, node: NodeId) -> Vec<RelationshipRecord> {
        self.relationships
            .iter()
            .filter(|e| e.value().in_use && (e.value().start == node || e.value().end == node))
            .map(|e| e.value().clone())
            .collect()
    }
}
