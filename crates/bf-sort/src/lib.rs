#![forbid(unsafe_code)]

//! Parallel sort and the order statistics built on top of it.
//!
//! Every worker sorts the row indices of its own block; the calling thread
//! then k-way merges the runs through a heap keyed by the same comparator.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use bf_groupby::{GroupByError, GroupByOptions, count_values, mean};
use bf_runtime::{ExecError, WorkerPool, scatter_gather};
use bf_table::{Column, Table, TableError};
use bf_types::{DType, Scalar};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_TOP_N: usize = 10;

#[derive(Debug, Error)]
pub enum SortError {
    #[error("quantile fraction {fraction} is outside [0, 1]")]
    InvalidFraction { fraction: f64 },
    #[error("column {name:?} has non-numeric dtype {dtype}")]
    NonNumericColumn { name: String, dtype: DType },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    GroupBy(#[from] GroupByError),
}

// ── Key ordering ───────────────────────────────────────────────────────

/// Total order over sort keys.
///
/// Integers compare as integers, floats with `total_cmp`, and an integer
/// against a float after widening to `f64`. `ascending == false` reverses
/// the numeric order only: non-numeric keys (null, NaN, bool, text) are
/// equal to each other and sort after every number in both directions.
#[must_use]
pub fn compare_keys(left: &Scalar, right: &Scalar, ascending: bool) -> Ordering {
    match (SortKey::of(left), SortKey::of(right)) {
        (Some(a), Some(b)) => {
            let ord = a.cmp_numeric(b);
            if ascending { ord } else { ord.reverse() }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Clone, Copy)]
enum SortKey {
    Int(i64),
    Float(f64),
}

impl SortKey {
    fn of(value: &Scalar) -> Option<Self> {
        match value {
            Scalar::Int64(v) => Some(Self::Int(*v)),
            Scalar::Float64(v) if !v.is_nan() => Some(Self::Float(*v)),
            Scalar::Null | Scalar::Bool(_) | Scalar::Float64(_) | Scalar::Utf8(_) => None,
        }
    }

    fn cmp_numeric(self, other: Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(&b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(&b),
            (Self::Int(a), Self::Float(b)) => (a as f64).total_cmp(&b),
            (Self::Float(a), Self::Int(b)) => a.total_cmp(&(b as f64)),
        }
    }
}

// ── Sort ───────────────────────────────────────────────────────────────

/// Rows of `table` reordered by `column`. Same schema as the input.
///
/// Equal keys keep their input order, though callers should not rely on it.
pub fn sort_by_column(
    table: &Table,
    column: &str,
    ascending: bool,
    pool: &WorkerPool,
) -> Result<Table, SortError> {
    let keys = table.column_by_name(column)?;
    let order = sorted_order(keys, ascending, pool)?;
    debug!(column, ascending, rows = order.len(), "sort");
    Ok(table.rows_by_index(&order)?)
}

fn sorted_order(keys: &Column, ascending: bool, pool: &WorkerPool) -> Result<Vec<usize>, ExecError> {
    let shared = keys.clone();
    let runs = scatter_gather(
        pool,
        keys.len(),
        move |block| {
            let values = shared.values();
            let mut rows: Vec<usize> = block.rows().collect();
            rows.sort_by(|&a, &b| compare_keys(&values[a], &values[b], ascending));
            rows
        },
        |runs| runs,
    )?;
    Ok(merge_runs(keys.values(), &runs, ascending))
}

/// Current head of one sorted run inside the merge heap.
struct Head<'a> {
    key: &'a Scalar,
    run: usize,
    ascending: bool,
}

impl Ord for Head<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops its greatest element, so the head that sorts first
        // has to compare greatest. Lower run ids win ties.
        compare_keys(other.key, self.key, self.ascending).then_with(|| other.run.cmp(&self.run))
    }
}

impl PartialOrd for Head<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Head<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head<'_> {}

fn merge_runs(keys: &[Scalar], runs: &[Vec<usize>], ascending: bool) -> Vec<usize> {
    let total = runs.iter().map(Vec::len).sum();
    let mut cursors = vec![0_usize; runs.len()];
    let mut heap = BinaryHeap::with_capacity(runs.len());
    for (run, rows) in runs.iter().enumerate() {
        if let Some(&row) = rows.first() {
            heap.push(Head {
                key: &keys[row],
                run,
                ascending,
            });
        }
    }

    let mut order = Vec::with_capacity(total);
    while let Some(Head { run, .. }) = heap.pop() {
        let pos = cursors[run];
        order.push(runs[run][pos]);
        cursors[run] = pos + 1;
        if let Some(&next) = runs[run].get(pos + 1) {
            heap.push(Head {
                key: &keys[next],
                run,
                ascending,
            });
        }
    }
    order
}

// ── Quantiles ──────────────────────────────────────────────────────────

/// Label for a quantile fraction: `min`, `median` and `max` for 0, 0.5 and
/// 1, `Q{percent}` otherwise.
#[must_use]
pub fn quantile_label(fraction: f64) -> String {
    if fraction == 0.0 {
        "min".to_owned()
    } else if fraction == 0.5 {
        "median".to_owned()
    } else if fraction == 1.0 {
        "max".to_owned()
    } else {
        format!("Q{}", (fraction * 100.0).round() as i64)
    }
}

/// Labelled quantile values, in the order they were requested.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Quantiles {
    entries: Vec<(String, Scalar)>,
}

impl Quantiles {
    #[must_use]
    pub fn get(&self, label: &str) -> Option<&Scalar> {
        self.entries
            .iter()
            .find(|(name, _)| name == label)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.entries
            .iter()
            .map(|(label, value)| (label.as_str(), value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Two-column `(quantile, value)` table. The value dtype is inferred.
    pub fn into_table(self) -> Result<Table, TableError> {
        let (labels, values): (Vec<_>, Vec<_>) = self
            .entries
            .into_iter()
            .map(|(label, value)| (Scalar::Utf8(label), value))
            .unzip();
        Table::from_columns([
            ("quantile".to_owned(), Column::new(DType::Utf8, labels)?),
            ("value".to_owned(), Column::from_values(values)?),
        ])
    }
}

/// Values of `column` at each of `fractions`.
///
/// Position `p = q * (n - 1)` over the non-missing cells in ascending order.
/// A fractional `p` interpolates linearly between its neighbours when both
/// are numeric (giving a Float64) and takes the lower neighbour otherwise.
/// An empty column yields `Null` for every fraction.
pub fn quantiles(
    table: &Table,
    column: &str,
    fractions: &[f64],
    pool: &WorkerPool,
) -> Result<Quantiles, SortError> {
    if let Some(&fraction) = fractions.iter().find(|q| !(0.0..=1.0).contains(*q)) {
        return Err(SortError::InvalidFraction { fraction });
    }

    let keys = table.column_by_name(column)?;
    let order = sorted_order(keys, true, pool)?;
    let sorted: Vec<&Scalar> = order
        .iter()
        .map(|&row| &keys.values()[row])
        .filter(|value| !value.is_missing())
        .collect();

    let entries = fractions
        .iter()
        .map(|&q| (quantile_label(q), quantile_at(&sorted, q)))
        .collect();
    Ok(Quantiles { entries })
}

fn quantile_at(sorted: &[&Scalar], fraction: f64) -> Scalar {
    let Some(last) = sorted.len().checked_sub(1) else {
        return Scalar::Null;
    };
    let pos = fraction * last as f64;
    let lo = pos.floor() as usize;
    let hi = (pos.ceil() as usize).min(last);
    if lo == hi {
        return sorted[lo].clone();
    }
    match (sorted[lo].as_numeric(), sorted[hi].as_numeric()) {
        (Some(a), Some(b)) => Scalar::Float64(a + (b - a) * (pos - lo as f64)),
        _ => sorted[lo].clone(),
    }
}

// ── Summaries ──────────────────────────────────────────────────────────

const SUMMARY_FRACTIONS: [(&str, f64); 5] = [
    ("min", 0.0),
    ("Q1", 0.25),
    ("median", 0.5),
    ("Q3", 0.75),
    ("max", 1.0),
];

/// Six-row `(statistic, value)` table: `min, Q1, median, Q3, max, mean`.
///
/// `column` must be Int64 or Float64. All values are Float64; an empty
/// column reports 0.0 throughout.
pub fn summary_stats(table: &Table, column: &str, pool: &WorkerPool) -> Result<Table, SortError> {
    let dtype = table.column_by_name(column)?.dtype();
    if !dtype.is_numeric() {
        return Err(SortError::NonNumericColumn {
            name: column.to_owned(),
            dtype,
        });
    }

    let fractions = SUMMARY_FRACTIONS.map(|(_, q)| q);
    let found = quantiles(table, column, &fractions, pool)?;
    let avg = mean(table, column, pool)?;

    let mut statistics = Vec::with_capacity(SUMMARY_FRACTIONS.len() + 1);
    let mut values = Vec::with_capacity(SUMMARY_FRACTIONS.len() + 1);
    for ((name, _), (_, value)) in SUMMARY_FRACTIONS.iter().zip(found.iter()) {
        statistics.push(Scalar::from(*name));
        values.push(Scalar::Float64(value.as_numeric().unwrap_or(0.0)));
    }
    statistics.push(Scalar::from("mean"));
    values.push(Scalar::Float64(avg));

    let mut out = Table::default();
    out.append_column(statistics, "statistic", DType::Utf8)?;
    out.append_column(values, "value", DType::Float64)?;
    Ok(out)
}

/// The `n` most frequent values of `column` as `(location, num_trans)`.
///
/// Fewer than `n` distinct values truncates the result.
pub fn top_n(table: &Table, column: &str, n: usize, pool: &WorkerPool) -> Result<Table, SortError> {
    let counts = count_values(table, column, GroupByOptions::default(), pool)?;
    let ranked = sort_by_column(&counts, "count", false, pool)?;
    let keep: Vec<usize> = (0..n.min(ranked.row_count())).collect();
    let top = ranked.rows_by_index(&keep)?;

    Ok(Table::from_columns([
        ("location".to_owned(), top.column(0).clone()),
        ("num_trans".to_owned(), top.column(1).clone()),
    ])?)
}
