//! Registry and pool of transaction objects.
//!
//! Transaction objects are pooled in two tiers: a small per-thread cache in
//! front of a bounded shared pool. Acquisition prefers the local tier, falls
//! back to the shared pool, and only then constructs a new object (with a
//! fresh lock-client lease). The registry also tracks every live object in a
//! lock-free map so the whole population can be enumerated and disposed.
//!
//! Disposal invalidates pooled objects wholesale by bumping a generation
//! counter: locally cached objects from an older generation are discarded on
//! their next touch instead of being chased across threads.

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::locks::LockService;
use crate::model::TxId;
use crate::txn::transaction::Transaction;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

struct LocalSlot {
    registry: u64,
    generation: u64,
    tx: Arc<Transaction>,
}

thread_local! {
    static LOCAL_POOL: RefCell<Vec<LocalSlot>> = const { RefCell::new(Vec::new()) };
}

/// Owns every transaction object ever handed out and pools the idle ones.
pub struct TransactionRegistry {
    registry_id: u64,
    all: DashMap<u64, Arc<Transaction>>,
    /// Idle objects tagged with the generation their release observed; pops
    /// re-check the tag so a release racing `dispose_all` cannot smuggle a
    /// retired object back out.
    global_pool: Mutex<Vec<(u64, Arc<Transaction>)>>,
    pool_capacity: usize,
    local_pool_capacity: usize,
    locks: Arc<LockService>,
    next_seq: AtomicU64,
    generation: AtomicU64,
    running: AtomicBool,
}

impl TransactionRegistry {
    pub fn new(config: &Config, locks: Arc<LockService>) -> Self {
        Self {
            registry_id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::SeqCst),
            all: DashMap::new(),
            global_pool: Mutex::new(Vec::new()),
            pool_capacity: config.pool_capacity,
            local_pool_capacity: config.local_pool_capacity,
            locks,
            next_seq: AtomicU64::new(1),
            generation: AtomicU64::new(1),
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Stops issuing transactions. Already-acquired ones keep working until
    /// released.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Acquires a transaction object, preferring the thread-local tier, then
    /// the shared pool, then constructing a new object.
    pub fn acquire(&self, last_committed: TxId) -> Result<Arc<Transaction>> {
        if !self.is_running() {
            return Err(EngineError::DatabaseUnavailable(
                "transaction registry is stopped".into(),
            ));
        }
        let generation = self.generation.load(Ordering::SeqCst);

        let local = LOCAL_POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            let index = pool.iter().position(|slot| {
                slot.registry == self.registry_id
                    && slot.generation == generation
                    && !slot.tx.is_disposed()
            });
            index.map(|i| pool.swap_remove(i).tx)
        });
        // stale slots from other registries or old generations linger until
        // their thread touches them again; discard any we walked past
        LOCAL_POOL.with(|pool| {
            pool.borrow_mut().retain(|slot| {
                if slot.registry != self.registry_id {
                    return true;
                }
                let live = slot.generation == generation && !slot.tx.is_disposed();
                if !live {
                    self.forget(&slot.tx);
                    slot.tx.dispose();
                }
                live
            });
        });

        let tx = match local {
            Some(tx) => tx,
            None => loop {
                let popped = self.global_pool.lock().pop();
                match popped {
                    Some((gen, tx)) if gen == generation && !tx.is_disposed() => break tx,
                    Some((_, tx)) => {
                        self.forget(&tx);
                        tx.dispose();
                    }
                    None => break self.construct(),
                }
            },
        };
        tx.initialize(last_committed, generation);
        Ok(tx)
    }

    /// Returns a transaction object after its use cycle ends.
    ///
    /// Terminated or generation-stale objects are disposed instead of being
    /// pooled, so a cancelled transaction's object never carries state into
    /// a later cycle.
    pub fn release(&self, tx: Arc<Transaction>) {
        let generation = self.generation.load(Ordering::SeqCst);
        let stale = tx.generation() != generation;
        let terminated = tx.is_terminated();
        tx.close();
        if stale || terminated || !self.is_running() {
            debug!(
                seq = tx.seq(),
                stale, terminated, "disposing released transaction"
            );
            self.forget(&tx);
            tx.dispose();
            return;
        }

        let pooled_locally = LOCAL_POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            let local_here = pool
                .iter()
                .filter(|slot| slot.registry == self.registry_id)
                .count();
            if local_here < self.local_pool_capacity {
                pool.push(LocalSlot {
                    registry: self.registry_id,
                    generation,
                    tx: Arc::clone(&tx),
                });
                true
            } else {
                false
            }
        });
        if pooled_locally {
            return;
        }

        let mut global = self.global_pool.lock();
        if global.len() < self.pool_capacity {
            global.push((generation, tx));
        } else {
            drop(global);
            self.forget(&tx);
            tx.dispose();
        }
    }

    /// Terminates every open transaction and retires every pooled object.
    ///
    /// Open transactions observe the termination flag at their next safe
    /// point; their objects are disposed when released. Pooled objects are
    /// disposed here, and the generation bump invalidates every thread-local
    /// slot in one step.
    pub fn dispose_all(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, "disposing all pooled transactions");
        for entry in self.all.iter() {
            if entry.value().is_open() {
                entry.value().mark_for_termination();
            }
        }
        let drained: Vec<(u64, Arc<Transaction>)> =
            std::mem::take(&mut *self.global_pool.lock());
        for (_, tx) in drained {
            self.forget(&tx);
            tx.dispose();
        }
    }

    /// Every transaction object currently in an open use cycle.
    pub fn active_transactions(&self) -> Vec<Arc<Transaction>> {
        self.all
            .iter()
            .filter(|e| e.value().is_open())
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Total number of objects the registry still tracks, pooled or active.
    pub fn tracked(&self) -> usize {
        self.all.len()
    }

    fn construct(&self) -> Arc<Transaction> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let tx = Arc::new(Transaction::new(seq, self.locks.new_client()));
        self.all.insert(seq, Arc::clone(&tx));
        debug!(seq, "constructed pooled transaction");
        tx
    }

    fn forget(&self, tx: &Arc<Transaction>) {
        self.all.remove(&tx.seq());
    }
}
