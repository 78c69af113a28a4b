#![forbid(unsafe_code)]

use bf_table::{Field, Table, TableError};
use bf_types::{DType, Scalar, TypeError};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("csv input has no headers")]
    MissingHeaders,
    #[error("csv header {header:?} is not in the expected schema")]
    UnexpectedHeader { header: String },
    #[error("csv line {line}: {source}")]
    Cell {
        line: u64,
        #[source]
        source: TypeError,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Read CSV text, inferring one dtype per column.
///
/// A column is Int64 if every non-empty cell parses as an integer, else
/// Float64, else Bool, else Utf8. Empty cells are missing and do not vote.
pub fn read_csv_str(input: &str) -> Result<Table, IoError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(input.as_bytes());

    let headers = reader.headers().cloned()?;
    if headers.is_empty() {
        return Err(IoError::MissingHeaders);
    }

    let header_count = headers.len();
    let row_hint = input.len() / (header_count * 8).max(1);
    let mut raw: Vec<Vec<String>> = (0..header_count)
        .map(|_| Vec::with_capacity(row_hint))
        .collect();

    for record in reader.records() {
        let record = record?;
        for (idx, cells) in raw.iter_mut().enumerate() {
            cells.push(record.get(idx).unwrap_or_default().to_owned());
        }
    }

    let mut table = Table::default();
    for (name, cells) in headers.iter().zip(raw) {
        let dtype = infer_cell_dtype(&cells);
        let values = cells
            .iter()
            .map(|cell| dtype.parse_cell(cell))
            .collect::<Result<Vec<_>, _>>()
            .map_err(TableError::from)?;
        table.append_column(values, name, dtype)?;
    }
    Ok(table)
}

/// Read CSV text against a fixed schema. Headers must match the schema
/// names (any order); cells are parsed per the declared dtype.
pub fn read_csv_with_schema(input: &str, fields: Vec<Field>) -> Result<Table, IoError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(input.as_bytes());

    let headers = reader.headers().cloned()?;
    if headers.is_empty() {
        return Err(IoError::MissingHeaders);
    }

    let positions = headers
        .iter()
        .map(|header| {
            fields
                .iter()
                .position(|field| field.name == header)
                .ok_or_else(|| IoError::UnexpectedHeader {
                    header: header.to_owned(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut table = Table::with_schema(fields)?;
    let mut row = vec![String::new(); table.col_count()];
    for record in reader.records() {
        let record = record?;
        let line = line_of(&record);
        for (cell, &target) in record.iter().zip(&positions) {
            cell.clone_into(&mut row[target]);
        }
        table.append_row(row.as_slice()).map_err(|err| match err {
            TableError::Type(source) => IoError::Cell { line, source },
            other => IoError::Table(other),
        })?;
    }
    Ok(table)
}

pub fn write_csv_string(table: &Table) -> Result<String, IoError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());

    writer.write_record(table.fields().iter().map(|field| field.name.as_str()))?;

    for row_idx in 0..table.row_count() {
        let row = (0..table.col_count())
            .map(|col| {
                table
                    .column(col)
                    .value(row_idx)
                    .map_or_else(String::new, scalar_to_csv)
            })
            .collect::<Vec<_>>();
        writer.write_record(&row)?;
    }

    let bytes = writer.into_inner().map_err(|err| err.into_error())?;
    Ok(String::from_utf8(bytes)?)
}

fn line_of(record: &StringRecord) -> u64 {
    record.position().map_or(0, csv::Position::line)
}

fn infer_cell_dtype(cells: &[String]) -> DType {
    let present = || cells.iter().map(|c| c.trim()).filter(|c| !c.is_empty());

    if present().next().is_none() {
        return DType::Null;
    }
    if present().all(|c| c.parse::<i64>().is_ok()) {
        return DType::Int64;
    }
    if present().all(|c| c.parse::<f64>().is_ok()) {
        return DType::Float64;
    }
    if present().all(|c| DType::Bool.parse_cell(c).is_ok()) {
        return DType::Bool;
    }
    DType::Utf8
}

fn scalar_to_csv(scalar: &Scalar) -> String {
    match scalar {
        Scalar::Float64(v) if v.is_nan() => String::new(),
        other => other.to_string(),
    }
}
