//! The commit pipeline: validate, append, apply, close.
//!
//! Stage order is the durability contract. Index preconditions are validated
//! before anything is written; the append makes the transaction durable and
//! assigns its id; application makes it visible; and the close notification
//! fires exactly once per transaction regardless of how application went, so
//! the closed watermark never stalls.
//!
//! An append failure leaves the stores untouched and is safe to retry. An
//! apply failure happens after the durable append, so the log and the stores
//! may now disagree; the pipeline raises the database health signal and the
//! error surfaces as [`EngineError::ApplyFailed`], halting further commits
//! until restart and recovery.

use crate::error::{EngineError, Result};
use crate::health::DatabaseHealth;
use crate::model::TxId;
use crate::store::txid::TxIdStore;
use crate::store::Storage;
use crate::txn::apply::TransactionApplyMode;
use crate::txn::command::TxToApply;
use crate::wal::LogAppender;
use std::sync::Arc;
use tracing::{debug, error};

pub struct CommitPipeline {
    appender: Arc<dyn LogAppender>,
    storage: Arc<Storage>,
    health: Arc<DatabaseHealth>,
    id_store: Arc<TxIdStore>,
}

impl CommitPipeline {
    pub fn new(
        appender: Arc<dyn LogAppender>,
        storage: Arc<Storage>,
        health: Arc<DatabaseHealth>,
        id_store: Arc<TxIdStore>,
    ) -> Self {
        Self {
            appender,
            storage,
            health,
            id_store,
        }
    }

    /// Commits a batch, returning the id of its last transaction.
    ///
    /// Batch elements are validated lazily, right before their own append,
    /// because an element may depend on store state written by the elements
    /// before it.
    pub fn commit(&self, batch: &mut TxToApply, mode: TransactionApplyMode) -> Result<TxId> {
        let mut last_id = 0;
        let mut current = Some(batch);
        while let Some(tx) = current {
            last_id = self.commit_one(tx, mode)?;
            current = tx.next.as_deref_mut();
        }
        Ok(last_id)
    }

    fn commit_one(&self, tx: &mut TxToApply, mode: TransactionApplyMode) -> Result<TxId> {
        self.storage.ensure_validated(tx)?;

        let tx_id = match tx.tx_id {
            Some(id) => id,
            None => {
                let id = self.appender.append(&tx.representation)?;
                tx.tx_id = Some(id);
                id
            }
        };

        // Application must happen in log order even when committers race.
        if !mode.is_recovery() {
            self.id_store.await_turn(tx_id);
        }
        let applied = self.storage.apply_one(tx, mode);
        self.id_store.transaction_closed(tx_id);

        match applied {
            Ok(()) => {
                debug!(tx_id, ?mode, "transaction applied");
                Ok(tx_id)
            }
            Err(e) => {
                let failure = EngineError::ApplyFailed(e.to_string());
                error!(tx_id, %failure, "apply failed after durable append");
                self.health.panic(&failure);
                Err(failure)
            }
        }
    }
}
