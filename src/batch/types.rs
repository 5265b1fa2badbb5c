//! Logical types, fields and schemas.

use crate::error::{ExecError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Logical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Null,
    Boolean,
    Int32,
    Int64,
    Float64,
    Utf8,
}

impl DataType {
    pub fn is_integer(self) -> bool {
        matches!(self, DataType::Int32 | DataType::Int64)
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, DataType::Int32 | DataType::Int64 | DataType::Float64)
    }

    /// Fixed width in bytes, `None` for variable-width types.
    pub fn byte_width(self) -> Option<usize> {
        match self {
            DataType::Null => Some(0),
            DataType::Boolean => Some(1),
            DataType::Int32 => Some(4),
            DataType::Int64 | DataType::Float64 => Some(8),
            DataType::Utf8 => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Null => "null",
            DataType::Boolean => "bool",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float64 => "double",
            DataType::Utf8 => "string",
        };
        f.write_str(name)
    }
}

/// A named, typed column slot in a schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    name: String,
    data_type: DataType,
    nullable: bool,
}

impl Field {
    /// Create a nullable field.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.data_type)?;
        if !self.nullable {
            write!(f, " not null")?;
        }
        Ok(())
    }
}

/// Shared schema handle passed between nodes.
pub type SchemaRef = Arc<Schema>;

/// Ordered list of fields describing every batch a node produces.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> &Field {
        &self.fields[index]
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Position of the first field called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Like [`Schema::index_of`] but reports a missing field as a key error.
    pub fn resolve(&self, name: &str) -> Result<usize> {
        self.index_of(name).ok_or_else(|| {
            ExecError::key_error(format!(
                "No match for FieldRef.Name({}) in {}",
                name,
                self.field_names().join(", ")
            ))
        })
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn data_types(&self) -> Vec<DataType> {
        self.fields.iter().map(|f| f.data_type).collect()
    }

    /// Same types, new names. The name count must match the field count.
    pub fn with_names(&self, names: &[String]) -> Result<Schema> {
        if names.len() != self.fields.len() {
            return Err(ExecError::invalid(format!(
                "Names has {} elements but schema has {} fields",
                names.len(),
                self.fields.len()
            )));
        }
        Ok(Schema::new(
            self.fields
                .iter()
                .zip(names)
                .map(|(field, name)| field.with_name(name.as_str()))
                .collect(),
        ))
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", field)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_schema() -> Schema {
        Schema::new(vec![
            Field::new("i32", DataType::Int32),
            Field::new("bool", DataType::Boolean),
        ])
    }

    #[test]
    fn test_index_of_and_resolve() {
        let schema = basic_schema();
        assert_eq!(schema.index_of("bool"), Some(1));
        assert_eq!(schema.resolve("i32").unwrap(), 0);
        let err = schema.resolve("missing").unwrap_err();
        assert!(err.to_string().contains("FieldRef.Name(missing)"));
    }

    #[test]
    fn test_with_names_requires_matching_count() {
        let schema = basic_schema();
        let renamed = schema
            .with_names(&["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(renamed.field_names(), vec!["a", "b"]);
        assert_eq!(renamed.data_types(), schema.data_types());
        assert!(schema.with_names(&["a".to_string()]).is_err());
    }

    #[test]
    fn test_schema_display() {
        let schema = Schema::new(vec![
            Field::new("i32", DataType::Int32),
            Field::new("s", DataType::Utf8).with_nullable(false),
        ]);
        assert_eq!(schema.to_string(), "i32: int32\ns: string not null");
    }
}
