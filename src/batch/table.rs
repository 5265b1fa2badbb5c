//! Materialized tables and record batch readers.

use super::exec_batch::{ExecBatch, RecordBatch};
use super::types::SchemaRef;
use super::value::Value;
use crate::error::{ExecError, Result};
use std::sync::Arc;

/// A schema plus an ordered list of batches.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    schema: SchemaRef,
    batches: Vec<ExecBatch>,
}

impl Table {
    pub fn from_batches(schema: SchemaRef, batches: Vec<ExecBatch>) -> Result<Self> {
        if let Some(bad) = batches
            .iter()
            .find(|b| b.num_columns() != schema.num_fields())
        {
            return Err(ExecError::invalid(format!(
                "Table schema has {} fields but a batch has {} columns",
                schema.num_fields(),
                bad.num_columns()
            )));
        }
        Ok(Self { schema, batches })
    }

    /// Build a table from record batches, which must share one schema.
    pub fn from_record_batches(schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<Self> {
        let mut out = Vec::with_capacity(batches.len());
        for batch in batches {
            if batch.schema().as_ref() != schema.as_ref() {
                return Err(ExecError::invalid(
                    "Record batches must all share the table schema",
                ));
            }
            out.push(batch.into_batch());
        }
        Self::from_batches(schema, out)
    }

    /// Build a table from one JSON document per batch.
    pub fn from_json(schema: SchemaRef, chunks: &[&str]) -> Result<Self> {
        let types = schema.data_types();
        let batches = chunks
            .iter()
            .map(|json| ExecBatch::from_json(&types, json))
            .collect::<Result<Vec<_>>>()?;
        Self::from_batches(schema, batches)
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn batches(&self) -> &[ExecBatch] {
        &self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    pub fn num_columns(&self) -> usize {
        self.schema.num_fields()
    }

    /// The table's batches re-chunked to at most `max_rows` rows each.
    pub fn to_batches(&self, max_rows: usize) -> Vec<ExecBatch> {
        self.batches
            .iter()
            .filter(|b| !b.is_empty())
            .flat_map(|b| b.chunks(max_rows))
            .collect()
    }

    /// All batches concatenated into one.
    pub fn combine(&self) -> Result<ExecBatch> {
        ExecBatch::concat(self.num_columns(), &self.batches)
    }

    pub fn rows(&self) -> Vec<Vec<Value>> {
        self.batches.iter().flat_map(|b| b.rows()).collect()
    }

    /// Rows in a canonical order, for comparisons that ignore row order.
    pub fn sorted_rows(&self) -> Vec<Vec<Value>> {
        sort_rows(self.rows())
    }

    pub fn equals_ignoring_order(&self, other: &Table) -> bool {
        self.schema.data_types() == other.schema.data_types()
            && self.sorted_rows() == other.sorted_rows()
    }
}

/// Sort rows lexicographically with [`Value::total_cmp`].
pub fn sort_rows(mut rows: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    rows.sort_by(|a, b| {
        a.iter()
            .zip(b)
            .map(|(x, y)| x.total_cmp(y))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| a.len().cmp(&b.len()))
    });
    rows
}

/// Synchronous pull-based reader of record batches.
pub trait RecordBatchReader: Send {
    fn schema(&self) -> SchemaRef;

    /// Next batch, or `None` once the reader is exhausted.
    fn read_next(&mut self) -> Result<Option<RecordBatch>>;
}

/// Reads a table back as record batches, optionally re-chunked.
pub struct TableBatchReader {
    table: Arc<Table>,
    pending: std::vec::IntoIter<ExecBatch>,
}

impl TableBatchReader {
    pub fn new(table: Arc<Table>) -> Self {
        let pending = table.batches().to_vec().into_iter();
        Self { table, pending }
    }

    pub fn with_chunk_size(table: Arc<Table>, max_rows: usize) -> Self {
        let pending = table.to_batches(max_rows).into_iter();
        Self { table, pending }
    }
}

impl RecordBatchReader for TableBatchReader {
    fn schema(&self) -> SchemaRef {
        self.table.schema().clone()
    }

    fn read_next(&mut self) -> Result<Option<RecordBatch>> {
        self.pending
            .next()
            .map(|batch| RecordBatch::try_new(self.table.schema().clone(), batch))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{DataType, Field, Schema};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("i32", DataType::Int32),
            Field::new("bool", DataType::Boolean),
        ]))
    }

    fn table() -> Table {
        Table::from_json(
            schema(),
            &["[[null, true], [4, false]]", "[[5, null], [6, false], [7, false]]"],
        )
        .unwrap()
    }

    #[test]
    fn test_num_rows_and_rechunk() {
        let table = table();
        assert_eq!(table.num_rows(), 5);
        let chunks = table.to_batches(1);
        assert_eq!(chunks.len(), 5);
        assert_eq!(table.combine().unwrap().num_rows(), 5);
    }

    #[test]
    fn test_equals_ignoring_order() {
        let table = table();
        let mut reversed: Vec<ExecBatch> = table.batches().to_vec();
        reversed.reverse();
        let other = Table::from_batches(schema(), reversed).unwrap();
        assert!(table.equals_ignoring_order(&other));
        assert_ne!(table, other);
    }

    #[test]
    fn test_table_batch_reader() {
        let mut reader = TableBatchReader::with_chunk_size(Arc::new(table()), 2);
        let mut rows = 0;
        while let Some(batch) = reader.read_next().unwrap() {
            assert!(batch.num_rows() <= 2);
            rows += batch.num_rows();
        }
        assert_eq!(rows, 5);
    }

    #[test]
    fn test_from_batches_checks_width() {
        let batch = ExecBatch::from_json(&[DataType::Int32], "[[1]]").unwrap();
        assert!(Table::from_batches(schema(), vec![batch]).is_err());
    }
}
