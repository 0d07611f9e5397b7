//! The recorded instrumentation stream: record decoding, the trace
//! container reader/builder, and cross-reference table loading.

pub mod build;
pub mod loader;
pub mod reader;
pub mod record;

pub use loader::{AccessDetails, LocationDetails, OperandDetails, TraceTables};
pub use reader::{Batch, RawTables, TraceReader};
pub use record::{AllocFingerprint, AllocKind, AllocRequest, Record};
