#![forbid(unsafe_code)]

//! Rule-based account classification and transaction anomaly detection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use bf_runtime::{ExecError, WorkerPool, scatter_gather};
use bf_sort::{SortError, quantiles};
use bf_table::{Column, Table, TableError};
use bf_types::{DType, Scalar};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Sort(#[from] SortError),
}

// ── Classification ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountClass {
    A,
    B,
    C,
    D,
}

impl AccountClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
        }
    }
}

impl fmt::Display for AccountClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationRule {
    /// Mean strictly above this is class A.
    pub premium_mean: f64,
    /// Means in `[standard_mean_floor, premium_mean]` are B or C by balance.
    pub standard_mean_floor: f64,
    /// Balance strictly above this promotes C to B.
    pub balance_threshold: f64,
}

impl Default for ClassificationRule {
    fn default() -> Self {
        Self {
            premium_mean: 500.0,
            standard_mean_floor: 200.0,
            balance_threshold: 10_000.0,
        }
    }
}

impl ClassificationRule {
    #[must_use]
    pub fn classify(&self, mean: f64, balance: f64) -> AccountClass {
        if mean > self.premium_mean {
            AccountClass::A
        } else if mean >= self.standard_mean_floor {
            if balance > self.balance_threshold {
                AccountClass::B
            } else {
                AccountClass::C
            }
        } else {
            AccountClass::D
        }
    }
}

/// Label each account row with its [`AccountClass`].
///
/// Output columns are `id_col` and `category` (Utf8), in row order. Rows
/// whose id is not Int64, or whose mean or balance is not numeric, are
/// skipped.
pub fn classify_accounts(
    table: &Table,
    id_col: &str,
    mean_col: &str,
    balance_col: &str,
    rule: ClassificationRule,
    pool: &WorkerPool,
) -> Result<Table, DetectError> {
    let ids = table.column_by_name(id_col)?.clone();
    let means = table.column_by_name(mean_col)?.clone();
    let balances = table.column_by_name(balance_col)?.clone();

    let labelled = scatter_gather(
        pool,
        table.row_count(),
        move |block| {
            let mut out = Vec::new();
            for row in block.rows() {
                let (Some(id), Some(mean), Some(balance)) = (
                    ids.values()[row].as_i64(),
                    means.values()[row].as_numeric(),
                    balances.values()[row].as_numeric(),
                ) else {
                    continue;
                };
                out.push((id, rule.classify(mean, balance)));
            }
            out
        },
        |partials| partials.concat(),
    )?;

    let (out_ids, categories): (Vec<_>, Vec<_>) = labelled
        .into_iter()
        .map(|(id, class)| (Scalar::Int64(id), Scalar::from(class.as_str())))
        .unzip();

    let mut out = Table::default();
    out.append_column(out_ids, id_col, DType::Int64)?;
    out.append_column(categories, "category", DType::Utf8)?;
    debug!(rows_in = table.row_count(), rows_out = out.row_count(), "classify");
    Ok(out)
}

// ── Anomaly detection ──────────────────────────────────────────────────

/// Column names the detector reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionColumns {
    pub transaction_id: String,
    pub amount: String,
    pub location: String,
    pub account: String,
}

impl Default for TransactionColumns {
    fn default() -> Self {
        Self {
            transaction_id: "transaction_id".to_owned(),
            amount: "amount".to_owned(),
            location: "location".to_owned(),
            account: "account_id".to_owned(),
        }
    }
}

/// Multipliers for the interquartile outlier fence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyThresholds {
    pub lower_factor: f64,
    pub upper_factor: f64,
    /// Smallest allowed lower bound.
    pub floor: f64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            lower_factor: 0.45,
            upper_factor: 1.25,
            floor: 1.0,
        }
    }
}

impl AnomalyThresholds {
    #[must_use]
    pub fn bounds(&self, q1: f64, q3: f64) -> AmountBounds {
        let iqr = q3 - q1;
        AmountBounds {
            lower: (q1 - self.lower_factor * iqr).max(self.floor),
            upper: q3 + self.upper_factor * iqr,
        }
    }
}

/// Closed interval of unsuspicious amounts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmountBounds {
    pub lower: f64,
    pub upper: f64,
}

impl AmountBounds {
    #[must_use]
    pub fn is_outlier(&self, amount: f64) -> bool {
        amount < self.lower || amount > self.upper
    }
}

/// Scope of the per-account location history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocationMemory {
    /// Each block tracks locations on its own; an account's first row in a
    /// block is never location-suspicious.
    #[default]
    Block,
    /// One history across the whole table, built by a sequential scan on
    /// the calling thread.
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AnomalyOptions {
    pub thresholds: AnomalyThresholds,
    pub location_memory: LocationMemory,
}

#[derive(Debug, Default)]
struct LocationTracker {
    seen: HashMap<i64, HashSet<String>>,
}

impl LocationTracker {
    /// Record a transaction and report whether its location is new for an
    /// account that already has history.
    fn observe(&mut self, account: &Scalar, location: &Scalar) -> bool {
        let (Some(account), Some(location)) = (account.as_i64(), location.as_str()) else {
            return false;
        };
        let seen = self.seen.entry(account).or_default();
        if seen.contains(location) {
            return false;
        }
        let novel = !seen.is_empty();
        seen.insert(location.to_owned());
        novel
    }
}

#[derive(Debug, Clone)]
struct DetectInputs {
    amounts: Column,
    locations: Column,
    accounts: Column,
}

/// `(row, location_suspicious, amount_suspicious)` for every flagged row.
type Flags = Vec<(usize, bool, bool)>;

/// Transactions that are amount outliers or come from a location new to
/// their account.
///
/// Output columns are the transaction id column (source name and dtype),
/// `is_location_suspicious` and `is_amount_suspicious`, one row per flagged
/// transaction in row order.
pub fn abnormal_transactions(
    table: &Table,
    columns: &TransactionColumns,
    options: AnomalyOptions,
    pool: &WorkerPool,
) -> Result<Table, DetectError> {
    let ids = table.column_by_name(&columns.transaction_id)?;
    let inputs = DetectInputs {
        amounts: table.column_by_name(&columns.amount)?.clone(),
        locations: table.column_by_name(&columns.location)?.clone(),
        accounts: table.column_by_name(&columns.account)?.clone(),
    };

    let fences = quantiles(table, &columns.amount, &[0.25, 0.75], pool)?;
    let bounds = match (
        fences.get("Q25").and_then(Scalar::as_numeric),
        fences.get("Q75").and_then(Scalar::as_numeric),
    ) {
        (Some(q1), Some(q3)) => Some(options.thresholds.bounds(q1, q3)),
        _ => None,
    };
    debug!(?bounds, memory = ?options.location_memory, "anomaly fences");

    let global_novelty = match options.location_memory {
        LocationMemory::Block => None,
        LocationMemory::Global => {
            let mut tracker = LocationTracker::default();
            let novel: Vec<bool> = inputs
                .accounts
                .values()
                .iter()
                .zip(inputs.locations.values())
                .map(|(account, location)| tracker.observe(account, location))
                .collect();
            Some(Arc::new(novel))
        }
    };

    let flags: Flags = scatter_gather(
        pool,
        table.row_count(),
        move |block| {
            let mut tracker = LocationTracker::default();
            let mut flagged = Flags::new();
            for row in block.rows() {
                let location_sus = match &global_novelty {
                    Some(novel) => novel[row],
                    None => tracker.observe(
                        &inputs.accounts.values()[row],
                        &inputs.locations.values()[row],
                    ),
                };
                let amount_sus = bounds.is_some_and(|b| {
                    inputs.amounts.values()[row]
                        .as_numeric()
                        .is_some_and(|amount| b.is_outlier(amount))
                });
                if location_sus || amount_sus {
                    flagged.push((row, location_sus, amount_sus));
                }
            }
            flagged
        },
        |partials| partials.concat(),
    )?;

    let rows: Vec<usize> = flags.iter().map(|&(row, _, _)| row).collect();
    let location_flags = flags.iter().map(|&(_, loc, _)| Scalar::Bool(loc)).collect();
    let amount_flags = flags.iter().map(|&(_, _, amt)| Scalar::Bool(amt)).collect();

    let mut out = Table::from_columns([(columns.transaction_id.clone(), ids.take(&rows)?)])?;
    out.append_column(location_flags, "is_location_suspicious", DType::Bool)?;
    out.append_column(amount_flags, "is_amount_suspicious", DType::Bool)?;
    debug!(rows_in = table.row_count(), flagged = out.row_count(), "abnormal_transactions");
    Ok(out)
}
