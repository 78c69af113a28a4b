#![forbid(unsafe_code)]

//! Shared fixtures and a JSON case runner for cross-crate tests.
//!
//! A case file under `fixtures/cases/` names one operator invocation, its
//! input tables and the expected output table.

use std::fs;
use std::path::{Path, PathBuf};

use bf_detect::{
    AnomalyOptions, ClassificationRule, DetectError, LocationMemory, TransactionColumns,
    abnormal_transactions, classify_accounts,
};
use bf_filter::{FilterError, filter_rows};
use bf_groupby::{GroupByError, GroupByOptions, count_values, groupby_mean};
use bf_io::{IoError, read_csv_str, read_csv_with_schema};
use bf_join::{JoinError, join_on_key};
use bf_runtime::WorkerPool;
use bf_sort::{SortError, sort_by_column, summary_stats, top_n};
use bf_table::{Field, Table, TableError};
use bf_types::{DType, Scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConformanceError {
    #[error("case {case_id:?} needs a right-hand table")]
    MissingRightTable { case_id: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] IoError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    GroupBy(#[from] GroupByError),
    #[error(transparent)]
    Sort(#[from] SortError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Detect(#[from] DetectError),
}

#[must_use]
pub fn fixture_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
}

// ── Case fixtures ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CaseOperation {
    FilterGreaterThan { column: String, threshold: f64 },
    CountValues { column: String },
    GroupbyMean { group_col: String, target_col: String },
    SortByColumn { column: String, ascending: bool },
    SummaryStats { column: String },
    TopN { column: String, n: usize },
    JoinOnKey { key: String },
    ClassifyAccounts {
        id_col: String,
        mean_col: String,
        balance_col: String,
    },
    AbnormalTransactions {
        #[serde(default)]
        global_memory: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseFixture {
    pub case_id: String,
    pub operation: CaseOperation,
    pub left: Table,
    #[serde(default)]
    pub right: Option<Table>,
    pub expected: Table,
}

/// Every `*.json` case under `fixtures/cases`, sorted by case id.
pub fn load_cases() -> Result<Vec<CaseFixture>, ConformanceError> {
    let root = fixture_root().join("cases");
    let mut cases = Vec::new();
    for entry in fs::read_dir(&root)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            cases.push(load_case(&path)?);
        }
    }
    cases.sort_by(|a, b| a.case_id.cmp(&b.case_id));
    Ok(cases)
}

pub fn load_case(path: &Path) -> Result<CaseFixture, ConformanceError> {
    let body = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&body)?)
}

/// Run the case's operator and return its output.
pub fn run_case(case: &CaseFixture, pool: &WorkerPool) -> Result<Table, ConformanceError> {
    let left = &case.left;
    let out = match &case.operation {
        CaseOperation::FilterGreaterThan { column, threshold } => {
            let idx = left.column_index(column)?;
            let threshold = *threshold;
            filter_rows(left, move |row| Ok(row[idx].to_f64()? > threshold), pool)?
        }
        CaseOperation::CountValues { column } => {
            count_values(left, column, GroupByOptions::default(), pool)?
        }
        CaseOperation::GroupbyMean {
            group_col,
            target_col,
        } => groupby_mean(left, group_col, target_col, GroupByOptions::default(), pool)?,
        CaseOperation::SortByColumn { column, ascending } => {
            sort_by_column(left, column, *ascending, pool)?
        }
        CaseOperation::SummaryStats { column } => summary_stats(left, column, pool)?,
        CaseOperation::TopN { column, n } => top_n(left, column, *n, pool)?,
        CaseOperation::JoinOnKey { key } => {
            let right = case
                .right
                .as_ref()
                .ok_or_else(|| ConformanceError::MissingRightTable {
                    case_id: case.case_id.clone(),
                })?;
            join_on_key(left, right, key, pool)?
        }
        CaseOperation::ClassifyAccounts {
            id_col,
            mean_col,
            balance_col,
        } => classify_accounts(
            left,
            id_col,
            mean_col,
            balance_col,
            ClassificationRule::default(),
            pool,
        )?,
        CaseOperation::AbnormalTransactions { global_memory } => {
            let options = AnomalyOptions {
                location_memory: if *global_memory {
                    LocationMemory::Global
                } else {
                    LocationMemory::Block
                },
                ..AnomalyOptions::default()
            };
            abnormal_transactions(left, &TransactionColumns::default(), options, pool)?
        }
    };
    Ok(out)
}

// ── Table builders ─────────────────────────────────────────────────────

/// `(id, name)` for Alice, Bob and Carlos.
pub fn people_table() -> Result<Table, TableError> {
    build(
        vec![Field::new("id", DType::Int64), Field::new("name", DType::Utf8)],
        &[&["1", "Alice"], &["2", "Bob"], &["3", "Carlos"]],
    )
}

/// `(id, age)` for ids 1, 2 and 4.
pub fn ages_table() -> Result<Table, TableError> {
    build(
        vec![Field::new("id", DType::Int64), Field::new("age", DType::Int64)],
        &[&["1", "23"], &["2", "30"], &["4", "40"]],
    )
}

/// `(id, name, salary)` with salaries around 5000.
pub fn salaries_table() -> Result<Table, TableError> {
    build(
        vec![
            Field::new("id", DType::Int64),
            Field::new("name", DType::Utf8),
            Field::new("salary", DType::Float64),
        ],
        &[
            &["1", "Camacho", "5000.5"],
            &["2", "Bebel", "6200.0"],
            &["3", "Yuri", "4700.75"],
        ],
    )
}

/// Schema of `fixtures/transactions.csv`.
#[must_use]
pub fn transaction_fields() -> Vec<Field> {
    vec![
        Field::new("transaction_id", DType::Int64),
        Field::new("account_id", DType::Int64),
        Field::new("amount", DType::Float64),
        Field::new("location", DType::Utf8),
        Field::new("time_start", DType::Utf8),
    ]
}

pub fn transactions_table() -> Result<Table, ConformanceError> {
    let body = fs::read_to_string(fixture_root().join("transactions.csv"))?;
    Ok(read_csv_with_schema(&body, transaction_fields())?)
}

/// Read any CSV fixture with inferred dtypes.
pub fn csv_fixture(name: &str) -> Result<Table, ConformanceError> {
    let body = fs::read_to_string(fixture_root().join(name))?;
    Ok(read_csv_str(&body)?)
}

/// Single-column Int64 table.
pub fn int_column(name: &str, values: &[i64]) -> Result<Table, TableError> {
    let mut table = Table::default();
    table.append_column(
        values.iter().copied().map(Scalar::Int64).collect(),
        name,
        DType::Int64,
    )?;
    Ok(table)
}

fn build(fields: Vec<Field>, rows: &[&[&str]]) -> Result<Table, TableError> {
    let mut table = Table::with_schema(fields)?;
    for &row in rows {
        table.append_row(row)?;
    }
    Ok(table)
}
