#![forbid(unsafe_code)]

use std::collections::HashMap;

use bf_filter::{FilterError, extract_hour};
use bf_runtime::{ExecError, WorkerPool, scatter_gather};
use bf_table::{Column, Table, TableError};
use bf_types::{DType, Scalar};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupByOptions {
    /// Skip rows whose key is missing.
    pub dropna: bool,
}

impl Default for GroupByOptions {
    fn default() -> Self {
        Self { dropna: true }
    }
}

#[derive(Debug, Error)]
pub enum GroupByError {
    #[error("number of days must be positive")]
    InvalidDays,
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Filter(#[from] FilterError),
}

// ── Group keys ─────────────────────────────────────────────────────────

/// Owned, hashable identity of a cell. Floats group by bit pattern with
/// `-0.0` folded into `0.0` and every NaN folded into one.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum GroupKey {
    Null,
    Bool(bool),
    Int64(i64),
    FloatBits(u64),
    Utf8(String),
}

impl GroupKey {
    fn from_scalar(key: &Scalar) -> Self {
        match key {
            Scalar::Null => Self::Null,
            Scalar::Bool(v) => Self::Bool(*v),
            Scalar::Int64(v) => Self::Int64(*v),
            Scalar::Float64(v) => Self::FloatBits(if v.is_nan() {
                f64::NAN.to_bits()
            } else if *v == 0.0 {
                0.0_f64.to_bits()
            } else {
                v.to_bits()
            }),
            Scalar::Utf8(v) => Self::Utf8(v.clone()),
        }
    }
}

/// Per-block accumulator keyed by group. Each slot remembers the row that
/// first opened it, so output keys are rebuilt from the source column.
#[derive(Debug)]
struct Groups<A> {
    ordering: Vec<GroupKey>,
    slots: HashMap<GroupKey, (usize, A)>,
}

impl<A: Default> Groups<A> {
    fn new() -> Self {
        Self {
            ordering: Vec::new(),
            slots: HashMap::new(),
        }
    }

    fn slot(&mut self, key: &Scalar, row: usize) -> &mut A {
        let key_id = GroupKey::from_scalar(key);
        let ordering = &mut self.ordering;
        let (_, acc) = self.slots.entry(key_id.clone()).or_insert_with(|| {
            ordering.push(key_id);
            (row, A::default())
        });
        acc
    }

    /// Fold a later block into this one. Blocks arrive in row order, so
    /// first-occurrence order survives the merge.
    fn absorb(&mut self, mut other: Self, combine: impl Fn(&mut A, A)) {
        for key in other.ordering {
            let Some((row, acc)) = other.slots.remove(&key) else {
                continue;
            };
            match self.slots.get_mut(&key) {
                Some((_, existing)) => combine(existing, acc),
                None => {
                    self.ordering.push(key.clone());
                    self.slots.insert(key, (row, acc));
                }
            }
        }
    }

    fn into_ordered(mut self) -> Vec<(usize, A)> {
        self.ordering
            .into_iter()
            .filter_map(|key| self.slots.remove(&key))
            .collect()
    }
}

fn merge_groups<A: Default>(partials: Vec<Groups<A>>, combine: impl Fn(&mut A, A)) -> Groups<A> {
    let mut iter = partials.into_iter();
    let mut merged = iter.next().unwrap_or_else(Groups::new);
    for partial in iter {
        merged.absorb(partial, &combine);
    }
    merged
}

#[derive(Debug, Clone, Copy, Default)]
struct SumCount {
    sum: f64,
    count: usize,
}

impl SumCount {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn combine(&mut self, other: Self) {
        self.sum += other.sum;
        self.count += other.count;
    }

    fn mean(self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

// ── Operators ──────────────────────────────────────────────────────────

/// Frequency of each distinct value of `column`.
///
/// Output columns are `value` (typed as the source column) and `count`
/// (Int64), one row per distinct value in first-occurrence order.
pub fn count_values(
    table: &Table,
    column: &str,
    options: GroupByOptions,
    pool: &WorkerPool,
) -> Result<Table, GroupByError> {
    let source = table.column_by_name(column)?.clone();
    let keys = source.clone();
    let groups = scatter_gather(
        pool,
        table.row_count(),
        move |block| {
            let mut groups = Groups::<usize>::new();
            for row in block.rows() {
                let key = &keys.values()[row];
                if options.dropna && key.is_missing() {
                    continue;
                }
                *groups.slot(key, row) += 1;
            }
            groups
        },
        |partials| merge_groups(partials, |total, count| *total += count),
    )?;

    let (values, counts): (Vec<_>, Vec<_>) = groups
        .into_ordered()
        .into_iter()
        .map(|(row, count)| (source.values()[row].clone(), count_scalar(count)))
        .unzip();

    let mut out = Table::default();
    out.append_column(values, "value", source.dtype())?;
    out.append_column(counts, "count", DType::Int64)?;
    debug!(column, groups = out.row_count(), "count_values");
    Ok(out)
}

/// Mean of `target_col` per distinct `group_col` value.
///
/// Rows whose target is not numeric are skipped; a key that never sees a
/// numeric target does not appear. Output columns are `group_col` (typed as
/// the source) and `mean_<target_col>` (Float64), in order of each key's
/// first numeric row.
pub fn groupby_mean(
    table: &Table,
    group_col: &str,
    target_col: &str,
    options: GroupByOptions,
    pool: &WorkerPool,
) -> Result<Table, GroupByError> {
    let source_keys = table.column_by_name(group_col)?.clone();
    let targets = table.column_by_name(target_col)?.clone();
    let keys = source_keys.clone();
    let groups = scatter_gather(
        pool,
        table.row_count(),
        move |block| {
            let mut groups = Groups::<SumCount>::new();
            for row in block.rows() {
                let key = &keys.values()[row];
                if options.dropna && key.is_missing() {
                    continue;
                }
                if let Some(value) = targets.values()[row].as_numeric() {
                    groups.slot(key, row).add(value);
                }
            }
            groups
        },
        |partials| merge_groups(partials, SumCount::combine),
    )?;

    let mut out_keys = Vec::new();
    let mut out_means = Vec::new();
    for (row, acc) in groups.into_ordered() {
        if let Some(mean) = acc.mean() {
            out_keys.push(source_keys.values()[row].clone());
            out_means.push(Scalar::Float64(mean));
        }
    }

    let mut out = Table::default();
    out.append_column(out_keys, group_col, source_keys.dtype())?;
    out.append_column(out_means, format!("mean_{target_col}"), DType::Float64)?;
    debug!(group_col, target_col, groups = out.row_count(), "groupby_mean");
    Ok(out)
}

/// Arithmetic mean of the numeric cells of `column`; `0.0` if there are none.
pub fn mean(table: &Table, column: &str, pool: &WorkerPool) -> Result<f64, GroupByError> {
    let values = table.column_by_name(column)?.clone();
    let total = scatter_gather(
        pool,
        table.row_count(),
        move |block| column_sum(&values, block.rows()),
        |partials| {
            partials.into_iter().fold(SumCount::default(), |mut acc, p| {
                acc.combine(p);
                acc
            })
        },
    )?;
    Ok(total.mean().unwrap_or(0.0))
}

fn column_sum(column: &Column, rows: std::ops::Range<usize>) -> SumCount {
    let mut acc = SumCount::default();
    for value in column.values()[rows].iter().filter_map(Scalar::as_numeric) {
        acc.add(value);
    }
    acc
}

/// Transactions per hour of day.
///
/// `time_column` holds `HH:MM:SS` text. Output columns are `hour` (Utf8),
/// `num_trans` (Int64) and `mean_per_day` (`num_trans / num_days`, Float64),
/// in first-occurrence order of each hour.
pub fn transactions_per_hour(
    table: &Table,
    time_column: &str,
    num_days: u32,
    pool: &WorkerPool,
) -> Result<Table, GroupByError> {
    if num_days == 0 {
        return Err(GroupByError::InvalidDays);
    }

    let hours = extract_hour(table, time_column, pool)?;
    let counts = count_values(&hours, time_column, GroupByOptions::default(), pool)?;

    let hour_col = counts.column(0).clone();
    let count_col = counts.column(1).clone();
    let per_day = count_col
        .values()
        .iter()
        .map(|count| {
            count
                .as_numeric()
                .map_or(Scalar::Null, |n| Scalar::Float64(n / f64::from(num_days)))
        })
        .collect::<Vec<_>>();

    let mut out = Table::from_columns([
        ("hour".to_owned(), hour_col),
        ("num_trans".to_owned(), count_col),
    ])?;
    out.append_column(per_day, "mean_per_day", DType::Float64)?;
    Ok(out)
}

fn count_scalar(count: usize) -> Scalar {
    Scalar::Int64(i64::try_from(count).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use bf_runtime::WorkerPool;
    use bf_table::{Field, Table, TableError};
    use bf_types::{DType, Scalar};

    use super::{
        GroupByError, GroupByOptions, count_values, groupby_mean, mean, transactions_per_hour,
    };

    fn balances() -> Table {
        let mut table = Table::with_schema(vec![
            Field::new("account_id", DType::Int64),
            Field::new("amount", DType::Float64),
        ])
        .expect("schema");
        for (account, amount) in [
            ("1", "100"),
            ("2", "300"),
            ("1", "300"),
            ("3", "150"),
            ("2", ""),
            ("1", "200"),
        ] {
            table.append_row(&[account, amount]).expect("row");
        }
        table
    }

    fn pairs(table: &Table) -> Vec<(Scalar, Scalar)> {
        table
            .column(0)
            .values()
            .iter()
            .cloned()
            .zip(table.column(1).values().iter().cloned())
            .collect()
    }

    #[test]
    fn groupby_mean_is_independent_of_worker_count() {
        let expected = vec![
            (Scalar::Int64(1), Scalar::Float64(200.0)),
            (Scalar::Int64(2), Scalar::Float64(300.0)),
            (Scalar::Int64(3), Scalar::Float64(150.0)),
        ];
        for workers in [1, 2, 4, 8] {
            let pool = WorkerPool::with_workers(workers).expect("pool");
            let out = groupby_mean(
                &balances(),
                "account_id",
                "amount",
                GroupByOptions::default(),
                &pool,
            )
            .expect("groupby");
            assert_eq!(out.column_name(0), Some("account_id"));
            assert_eq!(out.column_name(1), Some("mean_amount"));
            assert_eq!(out.column_type(0), Some(DType::Int64));
            assert_eq!(pairs(&out), expected, "workers={workers}");
        }
    }

    #[test]
    fn groupby_mean_omits_keys_without_numeric_targets() {
        let mut table = Table::with_schema(vec![
            Field::new("k", DType::Utf8),
            Field::new("v", DType::Utf8),
        ])
        .expect("schema");
        table.append_row(&["a", "x"]).expect("row");
        let pool = WorkerPool::with_workers(2).expect("pool");
        let out = groupby_mean(&table, "k", "v", GroupByOptions::default(), &pool)
            .expect("groupby");
        assert_eq!(out.row_count(), 0);
        assert_eq!(out.col_count(), 2);
    }

    #[test]
    fn count_values_keeps_first_occurrence_order() {
        let mut table = Table::with_schema(vec![Field::new("location", DType::Utf8)])
            .expect("schema");
        for loc in ["Lake Amy", "Guzmantown", "Lake Amy", "", "Port Ana", "Guzmantown", "Lake Amy"] {
            table.append_row(&[loc]).expect("row");
        }
        for workers in [1, 3, 7] {
            let pool = WorkerPool::with_workers(workers).expect("pool");
            let out = count_values(&table, "location", GroupByOptions::default(), &pool)
                .expect("count");
            assert_eq!(
                pairs(&out),
                vec![
                    (Scalar::from("Lake Amy"), Scalar::Int64(3)),
                    (Scalar::from("Guzmantown"), Scalar::Int64(2)),
                    (Scalar::from("Port Ana"), Scalar::Int64(1)),
                ],
                "workers={workers}"
            );
        }
    }

    #[test]
    fn count_values_can_keep_missing_keys() {
        let pool = WorkerPool::with_workers(2).expect("pool");
        let out = count_values(
            &balances(),
            "amount",
            GroupByOptions { dropna: false },
            &pool,
        )
        .expect("count");
        let total: i64 = out
            .column(1)
            .values()
            .iter()
            .filter_map(Scalar::as_i64)
            .sum();
        assert_eq!(total, 6);
        assert!(out.column(0).values().contains(&Scalar::Null));
    }

    #[test]
    fn float_keys_fold_signed_zero() {
        let mut table = Table::with_schema(vec![Field::new("x", DType::Float64)]).expect("schema");
        table.push_row(vec![Scalar::Float64(0.0)]).expect("row");
        table.push_row(vec![Scalar::Float64(-0.0)]).expect("row");
        let pool = WorkerPool::with_workers(1).expect("pool");
        let out = count_values(&table, "x", GroupByOptions::default(), &pool).expect("count");
        assert_eq!(out.row_count(), 1);
        assert_eq!(out.column(1).values(), &[Scalar::Int64(2)]);
    }

    #[test]
    fn mean_skips_non_numeric_and_defaults_to_zero() {
        let pool = WorkerPool::with_workers(3).expect("pool");
        let avg = mean(&balances(), "amount", &pool).expect("mean");
        assert!((avg - 210.0).abs() < 1e-9);

        let empty = Table::with_schema(vec![Field::new("amount", DType::Float64)]).expect("schema");
        assert_eq!(mean(&empty, "amount", &pool).expect("mean"), 0.0);
    }

    #[test]
    fn unknown_column_fails_before_dispatch() {
        let pool = WorkerPool::with_workers(1).expect("pool");
        let err = mean(&balances(), "nope", &pool).expect_err("unknown");
        assert!(matches!(err, GroupByError::Table(TableError::UnknownColumn { .. })));
    }

    #[test]
    fn transactions_per_hour_divides_by_days() {
        let mut table =
            Table::with_schema(vec![Field::new("time_start", DType::Utf8)]).expect("schema");
        for time in ["01:46:23", "02:35:22", "01:45:06", "01:00:00"] {
            table.append_row(&[time]).expect("row");
        }
        let pool = WorkerPool::with_workers(2).expect("pool");
        let out = transactions_per_hour(&table, "time_start", 2, &pool).expect("per hour");
        assert_eq!(out.column_name(0), Some("hour"));
        assert_eq!(out.column(0).values(), &[Scalar::from("01"), Scalar::from("02")]);
        assert_eq!(out.column(1).values(), &[Scalar::Int64(3), Scalar::Int64(1)]);
        assert_eq!(
            out.column(2).values(),
            &[Scalar::Float64(1.5), Scalar::Float64(0.5)]
        );

        let err = transactions_per_hour(&table, "time_start", 0, &pool).expect_err("zero days");
        assert!(matches!(err, GroupByError::InvalidDays));
    }
}
