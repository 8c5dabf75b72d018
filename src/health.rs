//! Process-wide database health signal.
//!
//! An apply failure after a durable log append leaves the log and the stores
//! potentially disagreeing. The health signal records that condition and
//! makes every subsequent commit attempt fail fast until the process is
//! restarted and recovery has re-established consistency.

use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::error;

/// Shared fault flag consulted at the start of every commit.
#[derive(Debug, Default)]
pub struct DatabaseHealth {
    panicked: AtomicBool,
    cause: Mutex<Option<String>>,
    panic_events: AtomicU64,
}

impl DatabaseHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the process-wide fault flag.
    ///
    /// Every call is counted, but only the first cause is retained.
    pub fn panic(&self, cause: &EngineError) {
        self.panic_events.fetch_add(1, Ordering::SeqCst);
        let mut stored = self.cause.lock();
        if !self.panicked.swap(true, Ordering::SeqCst) {
            error!(%cause, "Database panicked; commits halted until restart");
            *stored = Some(cause.to_string());
        }
    }

    pub fn is_healthy(&self) -> bool {
        !self.panicked.load(Ordering::SeqCst)
    }

    /// Fails fast once the database has panicked.
    pub fn assert_healthy(&self) -> Result<()> {
        if self.is_healthy() {
            return Ok(());
        }
        let cause = self
            .cause
            .lock()
            .clone()
            .unwrap_or_else(|| "unknown cause".into());
        Err(EngineError::DatabaseUnavailable(format!(
            "database panicked: {cause}"
        )))
    }

    /// Number of times the panic signal has been raised.
    pub fn panic_count(&self) -> u64 {
        self.panic_events.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_halts_and_keeps_first_cause() {
        let health = DatabaseHealth::new();
        assert!(health.assert_healthy().is_ok());

        health.panic(&EngineError::ApplyFailed("disk gone".into()));
        health.panic(&EngineError::ApplyFailed("second".into()));

        assert!(!health.is_healthy());
        assert_eq!(health.panic_count(), 2);
        let err = health.assert_healthy().unwrap_err();
        assert!(err.to_string().contains("disk gone"));
    }
}
