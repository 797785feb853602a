//! Execution-layer primitives: columnar batches and the operators that pull them.
//!
//! Architecture role:
//! - columnar batch model bound to arrow arrays
//! - pull-based operator protocol with end-of-stream / end-of-iteration flags
//! - leaf scans, streaming aggregation and sort-merge join
//! - JSON plan-construction encodings
//!
//! Key modules:
//! - [`batch`]
//! - [`operator`]
//! - [`agg`]
//! - [`merge_join`]
//! - [`encoding`]

pub mod agg;
pub mod aggregate;
pub mod batch;
pub mod encoding;
pub mod merge_join;
pub mod operator;
pub mod scan;

pub use agg::{AggOps, Aggregator, ColumnAggregator};
pub use aggregate::Aggregate;
pub use batch::{Batch, BatchBuffer, BatchBuilder, ColumnType, Schema, Value};
pub use encoding::{decode_encoding, MergeJoinEncoding, OperatorEncoding};
pub use merge_join::{MergeJoin, MergeJoinConfig};
pub use operator::{drive_to_eos, Operator, OperatorPhase, OperatorState};
pub use scan::{BinaryFileScan, IteratorScan, MemoryScan};
