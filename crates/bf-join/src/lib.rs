#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use bf_runtime::{ExecError, WorkerPool, scatter_gather};
use bf_table::{Column, Table, TableError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum JoinError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Right-side key to the positions of every row holding it.
type JoinIndex = HashMap<i64, Vec<usize>>;

/// Inner equi-join of `left` and `right` on the Int64 column `key`.
///
/// Every left column comes out as `A_<name>`, followed by every right column
/// except the key as `B_<name>`. Rows follow left's row order, with the
/// matches for one left row in right's row order. Cells that are not Int64
/// never match.
pub fn join_on_key(
    left: &Table,
    right: &Table,
    key: &str,
    pool: &WorkerPool,
) -> Result<Table, JoinError> {
    let left_keys = left.column_by_name(key)?.clone();
    let right_key_idx = right.column_index(key)?;

    let index = Arc::new(build_index(right.column(right_key_idx)));

    let pairs = scatter_gather(
        pool,
        left.row_count(),
        move |block| {
            let mut pairs = Vec::new();
            for row in block.rows() {
                let Some(k) = left_keys.values()[row].as_i64() else {
                    continue;
                };
                if let Some(matches) = index.get(&k) {
                    pairs.extend(matches.iter().map(|&other| (row, other)));
                }
            }
            pairs
        },
        |partials| partials.concat(),
    )?;

    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = pairs.into_iter().unzip();

    let mut columns: Vec<(String, Column)> = Vec::with_capacity(left.col_count() + right.col_count());
    for (idx, field) in left.fields().iter().enumerate() {
        columns.push((format!("A_{}", field.name), left.column(idx).take(&left_rows)?));
    }
    for (idx, field) in right.fields().iter().enumerate() {
        if idx == right_key_idx {
            continue;
        }
        columns.push((format!("B_{}", field.name), right.column(idx).take(&right_rows)?));
    }

    let out = Table::from_columns(columns)?;
    debug!(
        key,
        left_rows = left.row_count(),
        right_rows = right.row_count(),
        rows_out = out.row_count(),
        "join"
    );
    Ok(out)
}

fn build_index(keys: &Column) -> JoinIndex {
    let mut index = JoinIndex::new();
    for (row, value) in keys.values().iter().enumerate() {
        if let Some(k) = value.as_i64() {
            index.entry(k).or_default().push(row);
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use bf_runtime::WorkerPool;
    use bf_table::{Field, Table, TableError};
    use bf_types::{DType, Scalar};

    use super::{JoinError, join_on_key};

    fn people() -> Table {
        let mut table = Table::with_schema(vec![
            Field::new("id", DType::Int64),
            Field::new("name", DType::Utf8),
        ])
        .expect("schema");
        for (id, name) in [("1", "Alice"), ("2", "Bob"), ("3", "Carlos")] {
            table.append_row(&[id, name]).expect("row");
        }
        table
    }

    fn ages() -> Table {
        let mut table = Table::with_schema(vec![
            Field::new("id", DType::Int64),
            Field::new("age", DType::Int64),
        ])
        .expect("schema");
        for (id, age) in [("1", "23"), ("2", "30"), ("4", "40")] {
            table.append_row(&[id, age]).expect("row");
        }
        table
    }

    #[test]
    fn inner_join_keeps_only_matching_keys() {
        for workers in [1, 2, 4] {
            let pool = WorkerPool::with_workers(workers).expect("pool");
            let out = join_on_key(&people(), &ages(), "id", &pool).expect("join");
            let names: Vec<_> = out.fields().iter().map(|f| f.name.as_str()).collect();
            assert_eq!(names, vec!["A_id", "A_name", "B_age"]);
            assert_eq!(out.row_count(), 2, "workers={workers}");
            assert_eq!(
                out.row(0).expect("row"),
                vec![Scalar::Int64(1), Scalar::from("Alice"), Scalar::Int64(23)]
            );
            assert_eq!(
                out.row(1).expect("row"),
                vec![Scalar::Int64(2), Scalar::from("Bob"), Scalar::Int64(30)]
            );
        }
    }

    #[test]
    fn duplicate_keys_multiply() {
        let mut left = people();
        left.append_row(&["1", "Ana"]).expect("row");
        let mut right = ages();
        right.append_row(&["1", "51"]).expect("row");

        let pool = WorkerPool::with_workers(3).expect("pool");
        let out = join_on_key(&left, &right, "id", &pool).expect("join");
        // id 1: 2 x 2, id 2: 1 x 1
        assert_eq!(out.row_count(), 5);
        assert_eq!(
            out.column(2).values(),
            &[
                Scalar::Int64(23),
                Scalar::Int64(51),
                Scalar::Int64(30),
                Scalar::Int64(23),
                Scalar::Int64(51),
            ]
        );
    }

    #[test]
    fn non_integer_keys_never_match() {
        let mut left = Table::with_schema(vec![Field::new("id", DType::Utf8)]).expect("schema");
        left.append_row(&["1"]).expect("row");
        let mut right = ages();
        right.push_row(vec![Scalar::Null, Scalar::Int64(9)]).expect("row");

        let pool = WorkerPool::with_workers(2).expect("pool");
        let out = join_on_key(&left, &right, "id", &pool).expect("join");
        assert_eq!(out.row_count(), 0);
        assert_eq!(out.col_count(), 2);
        assert_eq!(out.column_type(1), Some(DType::Int64));
    }

    #[test]
    fn unknown_key_fails_on_either_side() {
        let pool = WorkerPool::with_workers(1).expect("pool");
        let renamed = Table::with_schema(vec![Field::new("key", DType::Int64)]).expect("schema");
        for (left, right) in [(people(), renamed.clone()), (renamed, ages())] {
            let err = join_on_key(&left, &right, "id", &pool).expect_err("missing key");
            assert!(matches!(err, JoinError::Table(TableError::UnknownColumn { .. })));
        }
    }
}
