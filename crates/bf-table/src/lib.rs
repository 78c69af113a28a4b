#![forbid(unsafe_code)]

//! Columnar in-memory tables.
//!
//! Cell data lives behind an `Arc`, so cloning a [`Table`] or a [`Column`]
//! never copies values. Operators clone their inputs into worker tasks and
//! build results through the `append_*`/`push_row` methods, which copy on
//! write if the storage is still shared.

use std::sync::Arc;

use bf_types::{DType, Scalar, TypeError, cast_scalar, infer_dtype};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TableError {
    #[error("unknown column {name:?}")]
    UnknownColumn { name: String },
    #[error("duplicate column {name:?}")]
    DuplicateColumn { name: String },
    #[error("column {name:?} has {actual} rows but the table has {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("row has {actual} cells but the schema has {expected} columns")]
    ArityMismatch { expected: usize, actual: usize },
    #[error("row {row} out of bounds for table with {row_count} rows")]
    RowOutOfBounds { row: usize, row_count: usize },
    #[error(transparent)]
    Type(#[from] TypeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub dtype: DType,
}

impl Field {
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    dtype: DType,
    values: Arc<Vec<Scalar>>,
}

impl Column {
    /// Construct a column, coercing values to `dtype` with lossless casts.
    pub fn new(dtype: DType, values: Vec<Scalar>) -> Result<Self, TypeError> {
        let needs_coercion = values.iter().any(|v| {
            let d = v.dtype();
            d != dtype && d != DType::Null
        });

        let values = if needs_coercion {
            values
                .into_iter()
                .map(|value| cast_scalar(value, dtype))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            values
        };

        Ok(Self {
            dtype,
            values: Arc::new(values),
        })
    }

    pub fn from_values(values: Vec<Scalar>) -> Result<Self, TypeError> {
        let dtype = infer_dtype(&values)?;
        Self::new(dtype, values)
    }

    #[must_use]
    pub fn empty(dtype: DType) -> Self {
        Self {
            dtype,
            values: Arc::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        &self.values
    }

    #[must_use]
    pub fn value(&self, idx: usize) -> Option<&Scalar> {
        self.values.get(idx)
    }

    /// Gather the values at `positions`, in that order.
    pub fn take(&self, positions: &[usize]) -> Result<Self, TableError> {
        let values = positions
            .iter()
            .map(|&row| {
                self.values
                    .get(row)
                    .cloned()
                    .ok_or(TableError::RowOutOfBounds {
                        row,
                        row_count: self.values.len(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            dtype: self.dtype,
            values: Arc::new(values),
        })
    }

    fn coerce(&self, value: Scalar) -> Result<Scalar, TypeError> {
        if value.dtype() == self.dtype {
            Ok(value)
        } else {
            cast_scalar(value, self.dtype)
        }
    }

    fn push_coerced(&mut self, value: Scalar) {
        Arc::make_mut(&mut self.values).push(value);
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "TableData", into = "TableData")]
pub struct Table {
    fields: Vec<Field>,
    columns: Vec<Column>,
    row_count: usize,
}

impl Table {
    /// An empty table with the given schema.
    pub fn with_schema(fields: Vec<Field>) -> Result<Self, TableError> {
        let mut table = Self::default();
        for field in fields {
            table.append_column(Vec::new(), field.name, field.dtype)?;
        }
        Ok(table)
    }

    pub fn from_columns(
        columns: impl IntoIterator<Item = (String, Column)>,
    ) -> Result<Self, TableError> {
        let mut table = Self::default();
        for (name, column) in columns {
            table.insert_column(name, column)?;
        }
        Ok(table)
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    #[must_use]
    pub fn col_count(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn column_index(&self, name: &str) -> Result<usize, TableError> {
        self.fields
            .iter()
            .position(|field| field.name == name)
            .ok_or_else(|| TableError::UnknownColumn {
                name: name.to_owned(),
            })
    }

    /// # Panics
    /// If `idx >= self.col_count()`.
    #[must_use]
    pub fn column(&self, idx: usize) -> &Column {
        &self.columns[idx]
    }

    pub fn column_by_name(&self, name: &str) -> Result<&Column, TableError> {
        let idx = self.column_index(name)?;
        Ok(&self.columns[idx])
    }

    #[must_use]
    pub fn column_type(&self, idx: usize) -> Option<DType> {
        self.fields.get(idx).map(|field| field.dtype)
    }

    #[must_use]
    pub fn column_name(&self, idx: usize) -> Option<&str> {
        self.fields.get(idx).map(|field| field.name.as_str())
    }

    /// Materialize one row across all columns.
    pub fn row(&self, idx: usize) -> Result<Vec<Scalar>, TableError> {
        if idx >= self.row_count {
            return Err(TableError::RowOutOfBounds {
                row: idx,
                row_count: self.row_count,
            });
        }
        Ok(self
            .columns
            .iter()
            .map(|column| column.values[idx].clone())
            .collect())
    }

    /// A new table with the same schema holding the rows at `indices`, in order.
    pub fn rows_by_index(&self, indices: &[usize]) -> Result<Self, TableError> {
        let columns = self
            .columns
            .iter()
            .map(|column| column.take(indices))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            fields: self.fields.clone(),
            columns,
            row_count: indices.len(),
        })
    }

    pub fn append_column(
        &mut self,
        values: Vec<Scalar>,
        name: impl Into<String>,
        dtype: DType,
    ) -> Result<(), TableError> {
        let column = Column::new(dtype, values)?;
        self.insert_column(name.into(), column)
    }

    /// Append a row of string-encoded cells, parsed per the schema.
    pub fn append_row<S: AsRef<str>>(&mut self, cells: &[S]) -> Result<(), TableError> {
        self.check_arity(cells.len())?;
        let row = self
            .fields
            .iter()
            .zip(cells)
            .map(|(field, cell)| field.dtype.parse_cell(cell.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        self.push_row(row)
    }

    /// Append a row of typed cells. The row is validated in full before any
    /// column is touched.
    pub fn push_row(&mut self, row: Vec<Scalar>) -> Result<(), TableError> {
        self.check_arity(row.len())?;
        let coerced = self
            .columns
            .iter()
            .zip(row)
            .map(|(column, value)| column.coerce(value))
            .collect::<Result<Vec<_>, _>>()?;
        for (column, value) in self.columns.iter_mut().zip(coerced) {
            column.push_coerced(value);
        }
        self.row_count += 1;
        Ok(())
    }

    fn check_arity(&self, actual: usize) -> Result<(), TableError> {
        if actual != self.columns.len() {
            return Err(TableError::ArityMismatch {
                expected: self.columns.len(),
                actual,
            });
        }
        Ok(())
    }

    fn insert_column(&mut self, name: String, column: Column) -> Result<(), TableError> {
        if self.fields.iter().any(|field| field.name == name) {
            return Err(TableError::DuplicateColumn { name });
        }
        if self.columns.is_empty() {
            self.row_count = column.len();
        } else if column.len() != self.row_count {
            return Err(TableError::LengthMismatch {
                name,
                expected: self.row_count,
                actual: column.len(),
            });
        }
        self.fields.push(Field::new(name, column.dtype()));
        self.columns.push(column);
        Ok(())
    }
}

/// Serialized form of a [`Table`]: one entry per column, in schema order.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableData {
    columns: Vec<ColumnData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ColumnData {
    name: String,
    dtype: DType,
    values: Vec<Scalar>,
}

impl TryFrom<TableData> for Table {
    type Error = TableError;

    fn try_from(data: TableData) -> Result<Self, Self::Error> {
        let mut table = Self::default();
        for column in data.columns {
            table.append_column(column.values, column.name, column.dtype)?;
        }
        Ok(table)
    }
}

impl From<Table> for TableData {
    fn from(table: Table) -> Self {
        let columns = table
            .fields
            .into_iter()
            .zip(table.columns)
            .map(|(field, column)| ColumnData {
                name: field.name,
                dtype: field.dtype,
                values: Arc::unwrap_or_clone(column.values),
            })
            .collect();
        Self { columns }
    }
}
