pub mod label_scan;
pub mod schema;

pub use label_scan::{LabelScanSync, LabelUpdate};
pub use schema::{
    AuxChange, AuxIndexProvider, AuxIndexes, IndexUpdate, MemoryAuxIndex, SchemaAction,
    SchemaIndexes, SchemaRule,
};
