//! Log replay at startup.
//!
//! The log is truncated at every checkpoint, so whatever it holds at open
//! time postdates the last snapshot and is replayed in full, in log order,
//! through the same commit pipeline that applied it the first time. Replay
//! uses [`TransactionApplyMode::Recovery`]: the append stage is skipped
//! (ids are already assigned) and idempotent application does the rest,
//! counters included, thanks to the counts store's last-applied watermark.

use crate::error::Result;
use crate::model::TxId;
use crate::txn::apply::TransactionApplyMode;
use crate::txn::command::{TransactionRepresentation, TxToApply};
use crate::txn::commit::CommitPipeline;
use tracing::info;

/// What replay found and did.
#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    /// Number of transactions replayed.
    pub recovered: u64,
    /// Highest transaction id seen in the log, 0 when the log was empty.
    pub last_tx_id: TxId,
}

/// Replays recovered log entries through the commit pipeline.
pub fn replay(
    pipeline: &CommitPipeline,
    entries: Vec<(TxId, TransactionRepresentation)>,
) -> Result<RecoveryOutcome> {
    let mut outcome = RecoveryOutcome::default();
    for (tx_id, representation) in entries {
        let mut tx = TxToApply::with_id(representation, tx_id);
        pipeline.commit(&mut tx, TransactionApplyMode::Recovery)?;
        outcome.recovered += 1;
        outcome.last_tx_id = outcome.last_tx_id.max(tx_id);
    }
    if outcome.recovered > 0 {
        info!(
            recovered = outcome.recovered,
            last_tx_id = outcome.last_tx_id,
            "log replay complete"
        );
    }
    Ok(outcome)
}
