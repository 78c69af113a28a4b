#![forbid(unsafe_code)]

use bf_runtime::{Block, ExecError, WorkerPool, scatter_gather};
use bf_table::{Table, TableError};
use bf_types::{DType, Scalar, TypeError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("predicate failed on row {row}: {source}")]
    Predicate {
        row: usize,
        #[source]
        source: TypeError,
    },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Keep the rows for which `predicate` returns true, in input order.
///
/// The predicate sees each row materialized across all columns. It is
/// expected to be total over the table's schema: any error it returns aborts
/// the whole call, reporting the lowest failing row.
pub fn filter_rows<P>(table: &Table, predicate: P, pool: &WorkerPool) -> Result<Table, FilterError>
where
    P: Fn(&[Scalar]) -> Result<bool, TypeError> + Send + Sync + 'static,
{
    let source = table.clone();
    let selected = scatter_gather(
        pool,
        table.row_count(),
        move |block| select_block(&source, &predicate, block),
        merge_selected,
    )??;

    let out = table.rows_by_index(&selected)?;
    debug!(
        rows_in = table.row_count(),
        rows_out = out.row_count(),
        "filter"
    );
    Ok(out)
}

fn select_block<P>(table: &Table, predicate: &P, block: Block) -> Result<Vec<usize>, FilterError>
where
    P: Fn(&[Scalar]) -> Result<bool, TypeError>,
{
    let mut hits = Vec::new();
    for row in block.rows() {
        let cells = table.row(row)?;
        if predicate(&cells).map_err(|source| FilterError::Predicate { row, source })? {
            hits.push(row);
        }
    }
    Ok(hits)
}

fn merge_selected(
    partials: Vec<Result<Vec<usize>, FilterError>>,
) -> Result<Vec<usize>, FilterError> {
    let mut selected = Vec::new();
    // Each block stops at its first failure, so the first error in block
    // order is the lowest failing row.
    for partial in partials {
        selected.extend(partial?);
    }
    selected.sort_unstable();
    Ok(selected)
}

/// Map each `HH:MM:SS` text cell of `column` to its two-character hour.
///
/// The output has a single Utf8 column with the source column's name. Cells
/// that are not text, or are shorter than two bytes, become missing.
pub fn extract_hour(table: &Table, column: &str, pool: &WorkerPool) -> Result<Table, FilterError> {
    let source = table.column_by_name(column)?.clone();
    let hours = scatter_gather(
        pool,
        table.row_count(),
        move |block| {
            source.values()[block.rows()]
                .iter()
                .map(hour_of)
                .collect::<Vec<_>>()
        },
        |partials| partials.concat(),
    )?;

    let mut out = Table::default();
    out.append_column(hours, column, DType::Utf8)?;
    Ok(out)
}

fn hour_of(cell: &Scalar) -> Scalar {
    cell.as_str()
        .and_then(|text| text.get(..2))
        .map_or(Scalar::Null, Scalar::from)
}
