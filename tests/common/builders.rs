//! Test data builders for batches and plans

use acero_rs::batch::{DataType, ExecBatch, Field, Schema, SchemaRef, Value};
use acero_rs::plan::nodes::{BatchStream, SourceNodeOptions};
use futures::stream::{self, StreamExt};
use std::sync::Arc;

/// Batches sharing one schema, the way tests feed them to a source.
#[derive(Debug, Clone)]
pub struct BatchesWithSchema {
    pub schema: SchemaRef,
    pub batches: Vec<ExecBatch>,
}

impl BatchesWithSchema {
    pub fn new(schema: SchemaRef, batches: Vec<ExecBatch>) -> Self {
        Self { schema, batches }
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    /// Repeat every batch `times` times.
    pub fn repeated(mut self, times: usize) -> Self {
        let original = std::mem::take(&mut self.batches);
        for _ in 0..times {
            self.batches.extend(original.iter().cloned());
        }
        self
    }

    pub fn stream(&self) -> BatchStream {
        stream::iter(self.batches.clone().into_iter().map(Ok)).boxed()
    }

    pub fn source_options(&self) -> SourceNodeOptions {
        SourceNodeOptions::new(self.schema.clone(), self.stream())
    }

    pub fn all_rows(&self) -> Vec<Vec<Value>> {
        super::sorted_rows(&self.batches)
    }
}

/// Builder for schemas in tests.
#[derive(Default)]
pub struct SchemaBuilder {
    fields: Vec<Field>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, data_type: DataType) -> Self {
        self.fields.push(Field::new(name, data_type));
        self
    }

    pub fn build(self) -> SchemaRef {
        Arc::new(Schema::new(self.fields))
    }
}

pub fn batches_from_json(schema: &SchemaRef, chunks: &[&str]) -> Vec<ExecBatch> {
    chunks
        .iter()
        .map(|json| ExecBatch::from_json(&schema.data_types(), json).unwrap())
        .collect()
}

/// Two small batches over `(i32, bool)` with some nulls.
pub fn basic_batches() -> BatchesWithSchema {
    let schema = SchemaBuilder::new()
        .field("i32", DataType::Int32)
        .field("bool", DataType::Boolean)
        .build();
    let batches = batches_from_json(
        &schema,
        &[
            "[[null, true], [4, false]]",
            "[[5, null], [6, false], [7, false]]",
        ],
    );
    BatchesWithSchema::new(schema, batches)
}

/// Three batches over `(i32, str)` with repeated string keys.
pub fn groupable_batches() -> BatchesWithSchema {
    let schema = SchemaBuilder::new()
        .field("i32", DataType::Int32)
        .field("str", DataType::Utf8)
        .build();
    let batches = batches_from_json(
        &schema,
        &[
            r#"[[12, "alfa"], [7, "beta"], [3, "alfa"]]"#,
            r#"[[-2, "alfa"], [-1, "gama"], [3, "alfa"]]"#,
            r#"[[5, "gama"], [3, "beta"], [-8, "alfa"]]"#,
        ],
    );
    BatchesWithSchema::new(schema, batches)
}

/// Deterministic pseudo-random batches over `(i32, bool)`, roughly one in
/// ten values null.
pub fn random_batches(num_batches: usize, batch_size: usize, seed: u64) -> BatchesWithSchema {
    let schema = SchemaBuilder::new()
        .field("i32", DataType::Int32)
        .field("bool", DataType::Boolean)
        .build();
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    let batches = (0..num_batches)
        .map(|_| {
            let rows = (0..batch_size)
                .map(|_| {
                    let r = next();
                    let int = if r % 10 == 0 {
                        Value::Null
                    } else {
                        Value::Int32((r >> 8) as i32 % 1000)
                    };
                    let boolean = if (r >> 4) % 10 == 0 {
                        Value::Null
                    } else {
                        Value::Boolean((r >> 16) & 1 == 1)
                    };
                    vec![int, boolean]
                })
                .collect();
            ExecBatch::from_rows(2, rows).unwrap()
        })
        .collect();
    BatchesWithSchema::new(schema, batches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_batches_are_deterministic() {
        let a = random_batches(3, 10, 7);
        let b = random_batches(3, 10, 7);
        assert_eq!(a.batches, b.batches);
        assert_eq!(a.num_rows(), 30);
    }

    #[test]
    fn test_repeated() {
        assert_eq!(basic_batches().repeated(3).batches.len(), 6);
    }
}
