//! Durable log appender.
//!
//! Appends are serialized behind one file lock, and the committing
//! transaction id is assigned under that same lock. That single critical
//! section is what makes transaction id order identical to log order, which
//! the apply stage later relies on.
//!
//! A failed append rolls the file back to its pre-append length and returns
//! the just-assigned id, so a clean failure leaves no hole in the id
//! sequence and no torn frame in the log. If even the rollback fails the
//! appender poisons itself: a torn frame may now sit in the log, and any
//! further append behind it could be lost to tail repair on restart, so all
//! appends are refused until a checkpoint truncates the file.

use crate::error::{EngineError, Result};
use crate::model::TxId;
use crate::store::txid::TxIdStore;
use crate::txn::command::TransactionRepresentation;
use crate::wal::record::{self, HEADER_LEN};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Appends a transaction to the durable log and returns its assigned id.
///
/// The object seam between the commit pipeline and the log, so tests can
/// stand in a stub appender.
pub trait LogAppender: Send + Sync {
    fn append(&self, representation: &TransactionRepresentation) -> Result<TxId>;
}

/// File-backed [`LogAppender`].
#[derive(Debug)]
pub struct WalAppender {
    file: Mutex<File>,
    id_store: Arc<TxIdStore>,
    sync_on_commit: bool,
    /// Set when a failed append could not be rolled back; the log may hold a
    /// torn frame, so appends are refused until the next checkpoint.
    poisoned: AtomicBool,
}

impl WalAppender {
    /// Opens (or creates) the log at `path` and positions for appending.
    /// The file header is written and synced on first creation.
    pub fn open(
        path: impl AsRef<Path>,
        id_store: Arc<TxIdStore>,
        sync_on_commit: bool,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        if file.metadata()?.len() == 0 {
            file.write_all(&record::encode_header())?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file: Mutex::new(file),
            id_store,
            sync_on_commit,
            poisoned: AtomicBool::new(false),
        })
    }

    /// Runs `persist` and then truncates the log back to its header, all
    /// under the append lock so no commit can slip between the persisted
    /// snapshot and the truncation.
    pub fn checkpoint_with<F>(&self, persist: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut file = self.file.lock();
        persist()?;
        file.set_len(HEADER_LEN)?;
        file.seek(SeekFrom::End(0))?;
        file.sync_data()?;
        // any torn frame is gone with the truncation
        self.poisoned.store(false, Ordering::SeqCst);
        debug!("log truncated at checkpoint");
        Ok(())
    }
}

impl LogAppender for WalAppender {
    fn append(&self, representation: &TransactionRepresentation) -> Result<TxId> {
        let mut file = self.file.lock();
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(EngineError::AppendFailed(
                "log holds a torn frame from an earlier failed rollback; \
                 checkpoint or restart to repair it"
                    .into(),
            ));
        }
        let rollback_to = file.metadata()?.len();
        let tx_id = self.id_store.next_committing_id();

        let result = (|| -> Result<()> {
            let frame = record::encode_entry(tx_id, representation)?;
            file.write_all(&frame)?;
            if self.sync_on_commit {
                file.sync_data()?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.id_store.transaction_committed(tx_id);
                Ok(tx_id)
            }
            Err(e) => {
                // Undo the torn frame and hand the id back; both are valid
                // because the append lock is still held.
                if let Err(trunc) = file.set_len(rollback_to) {
                    error!(%trunc, "could not roll back torn log frame; refusing further appends");
                    self.poisoned.store(true, Ordering::SeqCst);
                }
                let _ = file.seek(SeekFrom::End(0));
                self.id_store.release_unused_id(tx_id);
                Err(EngineError::AppendFailed(e.to_string()))
            }
        }
    }
}

/// Reads the log at `path`, truncating any damaged tail in place, and
/// returns the intact entries in log order.
pub fn scan_and_repair(path: impl Into<PathBuf>) -> Result<Vec<(TxId, TransactionRepresentation)>> {
    let path = path.into();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = std::fs::read(&path)?;
    let outcome = record::scan(&bytes)?;
    if outcome.truncated_tail {
        warn!(
            valid_len = outcome.valid_len,
            file_len = bytes.len(),
            "log has a damaged tail; truncating to last intact entry"
        );
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(outcome.valid_len)?;
        file.sync_data()?;
    }
    Ok(outcome.entries)
}
