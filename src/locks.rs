//! Entity-level lock service.
//!
//! Each open transaction exclusively owns one [`LockClient`] lease for its
//! entire lifetime. Locks taken through a client are released together when
//! the owning transaction closes; the client itself is closed exactly once,
//! when its pooled transaction is disposed, and refuses any use afterwards.

use crate::error::{EngineError, Result};
use crate::model::{NodeId, RelationshipId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// A lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockResource {
    Node(NodeId),
    Relationship(RelationshipId),
    Schema,
}

/// Issues per-transaction lock clients over a shared lock table.
#[derive(Debug, Default)]
pub struct LockService {
    table: Arc<DashMap<LockResource, u64>>,
    next_client_id: AtomicU64,
}

impl LockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh client lease. One client per open transaction.
    pub fn new_client(&self) -> LockClient {
        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst) + 1;
        LockClient {
            id,
            table: Arc::clone(&self.table),
            held: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }
}

/// Per-transaction lease granting entity-level exclusive locks.
#[derive(Debug)]
pub struct LockClient {
    id: u64,
    table: Arc<DashMap<LockResource, u64>>,
    held: Mutex<HashSet<LockResource>>,
    closed: AtomicBool,
}

impl LockClient {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Acquires an exclusive lock on a resource, blocking while another
    /// client holds it. Re-acquiring a held lock is a no-op.
    pub fn acquire_exclusive(&self, resource: LockResource) -> Result<()> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(EngineError::InvalidArgument(
                    "lock client is closed".into(),
                ));
            }
            let owner = *self.table.entry(resource).or_insert(self.id);
            if owner == self.id {
                self.held.lock().insert(resource);
                trace!(client = self.id, ?resource, "lock acquired");
                return Ok(());
            }
            std::thread::yield_now();
        }
    }

    /// Releases every lock held by this client. Called when the owning
    /// transaction closes; the client itself stays usable for the next
    /// transaction cycle until [`LockClient::close`].
    pub fn release_all(&self) {
        let mut held = self.held.lock();
        for resource in held.drain() {
            self.table
                .remove_if(&resource, |_, owner| *owner == self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Permanently closes the client, releasing held locks. Idempotent, but
    /// the release itself runs at most once.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.release_all();
            trace!(client = self.id, "lock client closed");
        }
    }
}

impl Drop for LockClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reacquire_is_idempotent() {
        let service = LockService::new();
        let client = service.new_client();
        client.acquire_exclusive(LockResource::Node(1)).unwrap();
        client.acquire_exclusive(LockResource::Node(1)).unwrap();
        client.release_all();
        let other = service.new_client();
        other.acquire_exclusive(LockResource::Node(1)).unwrap();
    }

    #[test]
    fn closed_client_refuses_locks() {
        let service = LockService::new();
        let client = service.new_client();
        client.acquire_exclusive(LockResource::Node(7)).unwrap();
        client.close();
        assert!(client.is_closed());
        assert!(client.acquire_exclusive(LockResource::Node(8)).is_err());
        // held lock was released on close
        let other = service.new_client();
        other.acquire_exclusive(LockResource::Node(7)).unwrap();
    }

    #[test]
    fn contended_lock_waits_for_release() {
        let service = Arc::new(LockService::new());
        let first = service.new_client();
        first.acquire_exclusive(LockResource::Node(3)).unwrap();

        let service2 = Arc::clone(&service);
        let handle = std::thread::spawn(move || {
            let second = service2.new_client();
            second.acquire_exclusive(LockResource::Node(3)).unwrap();
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        first.release_all();
        handle.join().unwrap();
    }
}
