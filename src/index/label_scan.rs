//! Label scan store with work-combining writes.
//!
//! Every committing transaction routes its label updates through
//! [`LabelScanSync`]. Instead of serializing whole commits behind one lock,
//! updates are enqueued with a ticket and whichever thread wins the writer
//! lock drains and applies everything pending, so concurrent small updates
//! coalesce into fewer batches without lengthening any single committer's
//! critical section.

use crate::model::{LabelId, NodeId};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// One node's label membership change.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelUpdate {
    pub node: NodeId,
    pub before: Vec<LabelId>,
    pub after: Vec<LabelId>,
}

#[derive(Debug, Default)]
struct LabelScanStore {
    by_label: DashMap<LabelId, BTreeSet<NodeId>>,
}

impl LabelScanStore {
    fn apply(&self, update: &LabelUpdate) {
        for label in &update.before {
            if !update.after.contains(label) {
                if let Some(mut nodes) = self.by_label.get_mut(label) {
                    nodes.remove(&update.node);
                }
            }
        }
        for label in &update.after {
            if !update.before.contains(label) {
                self.by_label.entry(*label).or_default().insert(update.node);
            }
        }
    }

    fn nodes_with_label(&self, label: LabelId) -> Vec<NodeId> {
        self.by_label
            .get(&label)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Work-combining front for the label scan store.
#[derive(Debug, Default)]
pub struct LabelScanSync {
    store: LabelScanStore,
    pending: Mutex<Vec<(u64, LabelUpdate)>>,
    next_ticket: AtomicU64,
    writer: Mutex<()>,
    completed: Mutex<u64>,
    completed_cond: Condvar,
}

impl LabelScanSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a batch of label updates and returns once they are applied,
    /// either by this thread or by another committer that drained the queue.
    pub fn apply(&self, updates: Vec<LabelUpdate>) {
        if updates.is_empty() {
            return;
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut pending = self.pending.lock();
            for update in updates {
                pending.push((ticket, update));
            }
        }
        loop {
            if *self.completed.lock() >= ticket {
                return;
            }
            if let Some(_writer) = self.writer.try_lock() {
                let drained: Vec<(u64, LabelUpdate)> =
                    std::mem::take(&mut *self.pending.lock());
                if !drained.is_empty() {
                    let high_ticket = drained.iter().map(|(t, _)| *t).max().unwrap_or(ticket);
                    trace!(batch = drained.len(), "label scan batch applied");
                    for (_, update) in &drained {
                        self.store.apply(update);
                    }
                    let mut completed = self.completed.lock();
                    if high_ticket > *completed {
                        *completed = high_ticket;
                    }
                    self.completed_cond.notify_all();
                }
            } else {
                let mut completed = self.completed.lock();
                if *completed >= ticket {
                    return;
                }
                self.completed_cond.wait_for(
                    &mut completed,
                    std::time::Duration::from_millis(1),
                );
            }
        }
    }

    pub fn nodes_with_label(&self, label: LabelId) -> Vec<NodeId> {
        self.store.nodes_with_label(label)
    }

    /// Rebuilds membership directly, used when loading a snapshot.
    pub fn rebuild(&self, node: NodeId, labels: &[LabelId]) {
        self.store.apply(&LabelUpdate {
            node,
            before: Vec::new(),
            after: labels.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn update(node: NodeId, before: Vec<LabelId>, after: Vec<LabelId>) -> LabelUpdate {
        LabelUpdate { node, before, after }
    }

    #[test]
    fn add_and_remove_membership() {
        let sync = LabelScanSync::new();
        sync.apply(vec![update(1, vec![], vec![5])]);
        sync.apply(vec![update(2, vec![], vec![5])]);
        assert_eq!(sync.nodes_with_label(5), vec![1, 2]);
        sync.apply(vec![update(1, vec![5], vec![])]);
        assert_eq!(sync.nodes_with_label(5), vec![2]);
    }

    #[test]
    fn concurrent_updates_all_land() {
        let sync = Arc::new(LabelScanSync::new());
        let mut handles = Vec::new();
        for worker in 0..8u64 {
            let sync = Arc::clone(&sync);
            handles.push(std::thread::spawn(move || {
                for i in 0..50u64 {
                    let node = worker * 100 + i;
                    sync.apply(vec![update(node, vec![], vec![1])]);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sync.nodes_with_label(1).len(), 8 * 50);
    }
}
