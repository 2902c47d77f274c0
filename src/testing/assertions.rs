//! Assertion functions for rows produced by stages.
//!
//! Rows compare by their `(field, value)` pairs; field order inside a row is
//! ignored everywhere here.

use crate::row::Row;
use std::collections::HashSet;

fn normalized(row: &Row) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = row
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    pairs.sort();
    pairs
}

/// Assert that two row lists are equal in order and content.
///
/// # Panics
///
/// Panics if the lists differ in length or any position differs.
///
/// # Example
///
/// ```
/// use stageflow::row;
/// use stageflow::testing::assert_rows_equal;
///
/// let actual = vec![row! { "a" => "1", "b" => "2" }];
/// let expected = vec![row! { "b" => "2", "a" => "1" }];
/// assert_rows_equal(&actual, &expected);
/// ```
pub fn assert_rows_equal(actual: &[Row], expected: &[Row]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "Row count mismatch:\n  Expected: {}\n  Actual: {}\n  Expected rows: {expected:?}\n  Actual rows: {actual:?}",
        expected.len(),
        actual.len()
    );
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert_eq!(
            normalized(a),
            normalized(e),
            "Row mismatch at index {i}:\n  Expected: {e:?}\n  Actual: {a:?}"
        );
    }
}

/// Assert that two row lists hold the same rows (with multiplicity), ignoring order.
///
/// # Panics
///
/// Panics if the multisets differ.
pub fn assert_rows_unordered_equal(actual: &[Row], expected: &[Row]) {
    let mut a: Vec<_> = actual.iter().map(normalized).collect();
    let mut e: Vec<_> = expected.iter().map(normalized).collect();
    a.sort();
    e.sort();
    assert_eq!(
        a, e,
        "Rows differ (order ignored):\n  Expected: {expected:?}\n  Actual: {actual:?}"
    );
}

/// Assert that every row matches `predicate`.
///
/// # Panics
///
/// Panics on the first row that does not match.
pub fn assert_all_rows(rows: &[Row], predicate: impl Fn(&Row) -> bool) {
    for (i, row) in rows.iter().enumerate() {
        assert!(predicate(row), "Row at index {i} does not satisfy the predicate: {row:?}");
    }
}

/// Assert that every row carries a non-empty value for each of `fields`.
///
/// # Panics
///
/// Panics on the first row missing a field.
pub fn assert_rows_have_fields(rows: &[Row], fields: &[&str]) {
    for (i, row) in rows.iter().enumerate() {
        if let Some(missing) = row.first_missing(fields) {
            panic!("Row at index {i} is missing `{missing}`: {row:?}");
        }
    }
}

/// Assert that no two rows share the same values for `key_fields`.
///
/// # Panics
///
/// Panics on the first duplicate key.
pub fn assert_unique_keys(rows: &[Row], key_fields: &[&str]) {
    let mut seen = HashSet::new();
    for row in rows {
        let key: Vec<&str> = key_fields.iter().map(|f| row.get_or_empty(f)).collect();
        assert!(seen.insert(key.clone()), "Duplicate key {key:?} in row {row:?}");
    }
}

/// Values of `field`, in row order.
#[must_use]
pub fn field_values<'a>(rows: &'a [Row], field: &str) -> Vec<&'a str> {
    rows.iter().map(|r| r.get_or_empty(field)).collect()
}
