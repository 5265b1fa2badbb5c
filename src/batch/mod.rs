//! Columnar batch model.
//!
//! This is the data that flows through a plan. Nodes receive and emit
//! [`ExecBatch`]es; schemas travel alongside at construction time so that a
//! batch itself stays a bare set of columns.

pub mod exec_batch;
pub mod table;
pub mod types;
pub mod value;

pub use exec_batch::{ArrayVector, Column, ExecBatch, RecordBatch};
pub use table::{sort_rows, RecordBatchReader, Table, TableBatchReader};
pub use types::{DataType, Field, Schema, SchemaRef};
pub use value::Value;
