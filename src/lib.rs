//! Vanta is an embedded transactional property-graph storage engine.
//!
//! Writes go through a single pipeline: an open transaction accumulates a
//! logical edit set; commit translates it into an ordered command list,
//! appends that list to a write-ahead log (assigning the transaction id),
//! and applies it to the stores through a chain of appliers covering
//! records, indexes, and aggregate counters. Durability strictly precedes
//! visibility, and application order is always log order.
//!
//! # Example
//!
//! ```no_run
//! use vanta::{Engine, PropertyValue};
//!
//! # fn main() -> vanta::Result<()> {
//! let engine = Engine::open("./graph.db")?;
//! let mut tx = engine.begin()?;
//! let alice = tx.create_node(&[0], &[("name", PropertyValue::String("Alice".into()))])?;
//! let bob = tx.create_node(&[0], &[("name", PropertyValue::String("Bob".into()))])?;
//! tx.create_relationship(alice, 0, bob)?;
//! tx.commit()?;
//!
//! assert_eq!(engine.node_count(0), 2);
//! engine.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod index;
pub mod locks;
pub mod logging;
pub mod model;
pub mod store;
pub mod txn;
pub mod wal;

pub use config::Config;
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use health::DatabaseHealth;
pub use index::{AuxChange, AuxIndexProvider, SchemaRule};
pub use model::{
    EntityRef, LabelId, NodeId, NodeRecord, PropertyValue, RelTypeId, RelationshipId,
    RelationshipRecord, TxId, ANY_LABEL, ANY_REL_TYPE,
};
pub use txn::{Transaction, TransactionApplyMode, TransactionHandle};
