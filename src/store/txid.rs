//! Transaction id bookkeeping.
//!
//! Ids are assigned at log-append time and never reused; the closed
//! watermark trails behind and gates store application so commands are never
//! applied out of log order.

use crate::model::TxId;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks the committing, committed, and closed transaction id watermarks.
#[derive(Debug)]
pub struct TxIdStore {
    /// Next id to hand out at append time.
    next: AtomicU64,
    /// Highest id durably appended to the log.
    last_committed: AtomicU64,
    /// Highest id whose application has finished (successfully or not).
    last_closed: Mutex<TxId>,
    closed_cond: Condvar,
    close_events: AtomicU64,
}

impl TxIdStore {
    pub fn new(last_committed: TxId) -> Self {
        Self {
            next: AtomicU64::new(last_committed + 1),
            last_committed: AtomicU64::new(last_committed),
            last_closed: Mutex::new(last_committed),
            closed_cond: Condvar::new(),
            close_events: AtomicU64::new(0),
        }
    }

    /// Hands out the next committing id. Only called with the log appender's
    /// lock held, which is what makes id order equal log order.
    pub fn next_committing_id(&self) -> TxId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Returns an id handed out by [`TxIdStore::next_committing_id`] whose
    /// append failed. Valid only under the appender lock, where no higher id
    /// can have been assigned in between.
    pub fn release_unused_id(&self, id: TxId) {
        let _ = self
            .next
            .compare_exchange(id + 1, id, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn transaction_committed(&self, id: TxId) {
        self.last_committed.fetch_max(id, Ordering::SeqCst);
    }

    pub fn last_committed(&self) -> TxId {
        self.last_committed.load(Ordering::SeqCst)
    }

    /// Marks a transaction's application finished. The commit pipeline calls
    /// this exactly once per transaction, regardless of apply outcome.
    pub fn transaction_closed(&self, id: TxId) {
        self.close_events.fetch_add(1, Ordering::SeqCst);
        let mut closed = self.last_closed.lock();
        if id > *closed {
            *closed = id;
        }
        self.closed_cond.notify_all();
    }

    pub fn last_closed(&self) -> TxId {
        *self.last_closed.lock()
    }

    /// Blocks until every transaction with a smaller id has closed, keeping
    /// apply order identical to log order under concurrent commits.
    pub fn await_turn(&self, id: TxId) {
        let mut closed = self.last_closed.lock();
        while *closed + 1 < id {
            self.closed_cond.wait(&mut closed);
        }
    }

    /// Blocks until every transaction up to and including `id` has closed.
    /// Checkpoint uses this to drain in-flight applies before it persists
    /// the stores and truncates the log.
    pub fn await_closed_up_to(&self, id: TxId) {
        let mut closed = self.last_closed.lock();
        while *closed < id {
            self.closed_cond.wait(&mut closed);
        }
    }

    /// Resets every watermark, used once after recovery replay.
    pub fn reinitialize(&self, last_committed: TxId) {
        self.next.store(last_committed + 1, Ordering::SeqCst);
        self.last_committed.store(last_committed, Ordering::SeqCst);
        *self.last_closed.lock() = last_committed;
        self.closed_cond.notify_all();
    }

    /// Total number of close events observed, exposed as a metric.
    pub fn transactions_closed(&self) -> u64 {
        self.close_events.load(Ordering::SeqCst)
    }
}
