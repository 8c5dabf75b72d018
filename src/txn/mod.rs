//! The transactional write path: state capture, translation to commands,
//! the commit pipeline, command application, and recovery replay.

pub mod apply;
pub mod command;
pub mod commit;
pub mod recovery;
pub mod registry;
pub mod state;
pub mod transaction;
pub mod translator;

pub use apply::TransactionApplyMode;
pub use command::{Command, TransactionRepresentation, TxToApply};
pub use commit::CommitPipeline;
pub use registry::TransactionRegistry;
pub use state::{RecordAccess, TxState};
pub use transaction::{Transaction, TransactionHandle};
pub use translator::{ConstraintCheck, TransactionStateTranslator};
