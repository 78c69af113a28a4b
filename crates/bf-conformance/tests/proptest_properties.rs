#![forbid(unsafe_code)]

//! Property tests: operator results must not depend on the worker count and
//! must satisfy their ordering and cardinality invariants for all inputs.

use std::cmp::Ordering;
use std::collections::HashMap;

use proptest::prelude::*;

use bf_conformance::int_column;
use bf_filter::filter_rows;
use bf_groupby::{GroupByOptions, count_values, groupby_mean};
use bf_join::join_on_key;
use bf_runtime::{WorkerPool, partition};
use bf_sort::{compare_keys, quantiles, sort_by_column};
use bf_table::{Field, Table};
use bf_types::{DType, Scalar};

// ---------------------------------------------------------------------------
// Strategy generators
// ---------------------------------------------------------------------------

/// Nullable float cell. NaN is left out so equality stays reflexive.
fn arb_amount() -> impl Strategy<Value = Scalar> {
    prop_oneof![
        6 => (-1e4_f64..1e4_f64).prop_map(Scalar::Float64),
        1 => Just(Scalar::Null),
    ]
}

fn arb_key() -> impl Strategy<Value = Scalar> {
    prop_oneof![
        6 => (0_i64..8).prop_map(Scalar::Int64),
        1 => Just(Scalar::Null),
    ]
}

/// `(key Int64, amount Float64)` table with up to `max_len` rows.
fn arb_keyed_table(max_len: usize) -> impl Strategy<Value = Table> {
    proptest::collection::vec((arb_key(), arb_amount()), 0..=max_len).prop_map(|rows| {
        let mut table = Table::with_schema(vec![
            Field::new("key", DType::Int64),
            Field::new("amount", DType::Float64),
        ])
        .expect("schema");
        for (key, amount) in rows {
            table.push_row(vec![key, amount]).expect("row");
        }
        table
    })
}

fn arb_workers() -> impl Strategy<Value = usize> {
    1_usize..=6
}

fn pool(workers: usize) -> WorkerPool {
    WorkerPool::with_workers(workers).expect("pool")
}

// ---------------------------------------------------------------------------
// Partitioning
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Blocks are contiguous, disjoint and cover [0, n) exactly.
    #[test]
    fn prop_partition_covers_rows(rows in 0_usize..10_000, workers in 1_usize..64) {
        let blocks = partition(rows, workers);
        prop_assert_eq!(blocks.len(), workers);
        let mut next = 0;
        for block in &blocks {
            prop_assert_eq!(block.start, next);
            prop_assert!(block.start <= block.end);
            next = block.end;
        }
        prop_assert_eq!(next, rows);
    }
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Filter keeps exactly the matching rows, in order.
    #[test]
    fn prop_filter_matches_sequential_scan(table in arb_keyed_table(80), workers in arb_workers()) {
        let out = filter_rows(
            &table,
            |row| Ok(row[1].as_numeric().is_some_and(|v| v > 0.0)),
            &pool(workers),
        )
        .expect("filter");

        let expected: Vec<usize> = (0..table.row_count())
            .filter(|&i| table.column(1).values()[i].as_numeric().is_some_and(|v| v > 0.0))
            .collect();
        prop_assert_eq!(out, table.rows_by_index(&expected).expect("rows"));
    }

    /// Sort output is a permutation whose adjacent keys are ordered.
    #[test]
    fn prop_sort_is_ordered_permutation(
        table in arb_keyed_table(80),
        ascending in any::<bool>(),
        workers in arb_workers(),
    ) {
        let out = sort_by_column(&table, "amount", ascending, &pool(workers)).expect("sort");
        prop_assert_eq!(out.row_count(), table.row_count());

        let keys = out.column(1).values();
        for pair in keys.windows(2) {
            prop_assert_ne!(compare_keys(&pair[0], &pair[1], ascending), Ordering::Greater);
        }

        let mut before: Vec<String> = (0..table.row_count())
            .map(|i| format!("{:?}", table.row(i).expect("row")))
            .collect();
        let mut after: Vec<String> = (0..out.row_count())
            .map(|i| format!("{:?}", out.row(i).expect("row")))
            .collect();
        before.sort();
        after.sort();
        prop_assert_eq!(before, after);
    }

    /// Quantiles are non-decreasing in the fraction.
    #[test]
    fn prop_quantiles_are_monotonic(table in arb_keyed_table(60), workers in arb_workers()) {
        let fractions = [0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 1.0];
        let found = quantiles(&table, "amount", &fractions, &pool(workers)).expect("quantiles");
        let values: Vec<Option<f64>> = found.iter().map(|(_, v)| v.as_numeric()).collect();
        if values.iter().all(Option::is_some) {
            for pair in values.windows(2) {
                prop_assert!(pair[0] <= pair[1], "{:?}", values);
            }
        } else {
            prop_assert!(values.iter().all(Option::is_none));
        }
    }

    /// Group-by and count results are the same for every worker count.
    #[test]
    fn prop_grouping_is_worker_invariant(table in arb_keyed_table(80), workers in arb_workers()) {
        let options = GroupByOptions::default();
        let single = pool(1);
        let many = pool(workers);

        let means_one = groupby_mean(&table, "key", "amount", options, &single).expect("means");
        let means_many = groupby_mean(&table, "key", "amount", options, &many).expect("means");
        prop_assert_eq!(means_one.column(0), means_many.column(0));
        for (a, b) in means_one.column(1).values().iter().zip(means_many.column(1).values()) {
            let (a, b) = (a.as_numeric().expect("mean"), b.as_numeric().expect("mean"));
            prop_assert!((a - b).abs() <= 1e-6 * a.abs().max(1.0));
        }

        let counts_one = count_values(&table, "key", options, &single).expect("counts");
        let counts_many = count_values(&table, "key", options, &many).expect("counts");
        prop_assert_eq!(counts_one, counts_many);
    }

    /// Join cardinality is the sum over keys of left count times right count.
    #[test]
    fn prop_join_cardinality(
        left_keys in proptest::collection::vec(0_i64..6, 0..40),
        right_keys in proptest::collection::vec(0_i64..6, 0..40),
        workers in arb_workers(),
    ) {
        let left = int_column("k", &left_keys).expect("left");
        let mut right = int_column("k", &right_keys).expect("right");
        right
            .append_column(
                (0..right_keys.len()).map(|i| Scalar::Int64(i as i64)).collect(),
                "pos",
                DType::Int64,
            )
            .expect("pos column");

        let out = join_on_key(&left, &right, "k", &pool(workers)).expect("join");

        let mut right_counts = HashMap::<i64, usize>::new();
        for k in &right_keys {
            *right_counts.entry(*k).or_default() += 1;
        }
        let expected: usize = left_keys
            .iter()
            .map(|k| right_counts.get(k).copied().unwrap_or(0))
            .sum();
        prop_assert_eq!(out.row_count(), expected);
        prop_assert_eq!(out.col_count(), 2);
    }
}
