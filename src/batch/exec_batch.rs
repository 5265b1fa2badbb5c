//! `ExecBatch`, the unit of data flowing between nodes.
//!
//! A batch is a set of equally long, immutable, reference-counted columns.
//! Cloning a batch only bumps reference counts, so fanning a batch out to
//! several outputs is cheap.

use super::types::{DataType, SchemaRef};
use super::value::Value;
use crate::error::{ExecError, Result};
use std::sync::Arc;

/// A shared, immutable column.
pub type Column = Arc<[Value]>;

/// A loose vector of columns without a schema attached.
pub type ArrayVector = Vec<Column>;

/// Columnar batch of rows without an attached schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecBatch {
    columns: Vec<Column>,
    num_rows: usize,
}

impl ExecBatch {
    /// Build a batch from columns, which must all have the same length.
    pub fn try_new(columns: Vec<Column>) -> Result<Self> {
        let num_rows = columns.first().map_or(0, |c| c.len());
        Self::try_new_with_rows(columns, num_rows)
    }

    /// Build a batch with an explicit row count, so that zero-column batches
    /// can still carry a length.
    pub fn try_new_with_rows(columns: Vec<Column>, num_rows: usize) -> Result<Self> {
        if let Some(bad) = columns.iter().position(|c| c.len() != num_rows) {
            return Err(ExecError::invalid(format!(
                "Column {} has {} rows but the batch has {}",
                bad,
                columns[bad].len(),
                num_rows
            )));
        }
        Ok(Self { columns, num_rows })
    }

    /// An empty batch with `num_columns` zero-length columns.
    pub fn empty(num_columns: usize) -> Self {
        Self {
            columns: (0..num_columns).map(|_| Column::from(Vec::new())).collect(),
            num_rows: 0,
        }
    }

    /// Build a batch from row-major values.
    pub fn from_rows(num_columns: usize, rows: Vec<Vec<Value>>) -> Result<Self> {
        let num_rows = rows.len();
        let mut columns: Vec<Vec<Value>> = (0..num_columns)
            .map(|_| Vec::with_capacity(num_rows))
            .collect();
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != num_columns {
                return Err(ExecError::invalid(format!(
                    "Row {} has {} values, expected {}",
                    i,
                    row.len(),
                    num_columns
                )));
            }
            for (column, value) in columns.iter_mut().zip(row) {
                column.push(value);
            }
        }
        Self::try_new_with_rows(columns.into_iter().map(Column::from).collect(), num_rows)
    }

    /// Parse a row-major JSON array such as `[[4, false], [null, true]]`.
    pub fn from_json(types: &[DataType], json: &str) -> Result<Self> {
        let parsed: serde_json::Value = serde_json::from_str(json)?;
        let rows = parsed.as_array().ok_or_else(|| {
            ExecError::Serialization("Expected a JSON array of rows".to_string())
        })?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let cells = row.as_array().ok_or_else(|| {
                ExecError::Serialization(format!("Expected a JSON array row, got {}", row))
            })?;
            if cells.len() != types.len() {
                return Err(ExecError::Serialization(format!(
                    "Row {} has {} cells, expected {}",
                    row,
                    cells.len(),
                    types.len()
                )));
            }
            out.push(
                cells
                    .iter()
                    .zip(types)
                    .map(|(cell, ty)| Value::from_json(cell, *ty))
                    .collect::<Result<Vec<_>>>()?,
            );
        }
        Self::from_rows(types.len(), out)
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> &Column {
        &self.columns[index]
    }

    pub fn value(&self, row: usize, column: usize) -> &Value {
        &self.columns[column][row]
    }

    pub fn row(&self, row: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c[row].clone()).collect()
    }

    pub fn rows(&self) -> Vec<Vec<Value>> {
        (0..self.num_rows).map(|r| self.row(r)).collect()
    }

    /// Copy rows `offset..offset + length`, clamped to the batch.
    pub fn slice(&self, offset: usize, length: usize) -> ExecBatch {
        let start = offset.min(self.num_rows);
        let end = start.saturating_add(length).min(self.num_rows);
        ExecBatch {
            columns: self
                .columns
                .iter()
                .map(|c| Column::from(&c[start..end]))
                .collect(),
            num_rows: end - start,
        }
    }

    /// Split into batches of at most `max_rows` rows.
    ///
    /// A batch that already fits is returned as is, without copying.
    pub fn chunks(&self, max_rows: usize) -> Vec<ExecBatch> {
        let max_rows = max_rows.max(1);
        if self.num_rows <= max_rows {
            return vec![self.clone()];
        }
        (0..self.num_rows)
            .step_by(max_rows)
            .map(|offset| self.slice(offset, max_rows))
            .collect()
    }

    /// Gather rows by index.
    pub fn take(&self, indices: &[usize]) -> ExecBatch {
        ExecBatch {
            columns: self
                .columns
                .iter()
                .map(|c| indices.iter().map(|&i| c[i].clone()).collect::<Column>())
                .collect(),
            num_rows: indices.len(),
        }
    }

    /// Keep rows whose mask entry is `true`.
    pub fn filter(&self, mask: &[bool]) -> ExecBatch {
        let indices: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, keep)| keep.then_some(i))
            .collect();
        self.take(&indices)
    }

    /// Keep the columns at `indices`, in that order.
    pub fn project(&self, indices: &[usize]) -> ExecBatch {
        ExecBatch {
            columns: indices.iter().map(|&i| self.columns[i].clone()).collect(),
            num_rows: self.num_rows,
        }
    }

    /// Concatenate batches with identical column counts.
    pub fn concat(num_columns: usize, batches: &[ExecBatch]) -> Result<ExecBatch> {
        let total: usize = batches.iter().map(|b| b.num_rows).sum();
        let mut columns: Vec<Vec<Value>> = (0..num_columns)
            .map(|_| Vec::with_capacity(total))
            .collect();
        for batch in batches {
            if batch.num_columns() != num_columns {
                return Err(ExecError::invalid(format!(
                    "Cannot concatenate a batch with {} columns into {} columns",
                    batch.num_columns(),
                    num_columns
                )));
            }
            for (out, column) in columns.iter_mut().zip(&batch.columns) {
                out.extend(column.iter().cloned());
            }
        }
        Self::try_new_with_rows(columns.into_iter().map(Column::from).collect(), total)
    }

    /// Total bytes held by this batch's column buffers.
    pub fn total_buffer_size(&self) -> u64 {
        self.columns
            .iter()
            .flat_map(|c| c.iter())
            .map(|v| v.byte_size() as u64)
            .sum()
    }
}

/// A batch bundled with the schema describing it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    schema: SchemaRef,
    batch: ExecBatch,
}

impl RecordBatch {
    pub fn try_new(schema: SchemaRef, batch: ExecBatch) -> Result<Self> {
        if schema.num_fields() != batch.num_columns() {
            return Err(ExecError::invalid(format!(
                "Schema has {} fields but batch has {} columns",
                schema.num_fields(),
                batch.num_columns()
            )));
        }
        Ok(Self { schema, batch })
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn batch(&self) -> &ExecBatch {
        &self.batch
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn into_batch(self) -> ExecBatch {
        self.batch
    }
}
