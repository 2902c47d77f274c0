//! Test row builders.

use crate::row::Row;

/// A fluent builder for rows sharing one set of columns.
///
/// # Example
///
/// ```
/// use stageflow::testing::RowsBuilder;
///
/// let rows = RowsBuilder::new(["store_id", "store_name"])
///     .add(["1", "Downtown"])
///     .add(["2", "Harbour"])
///     .add_repeated(["3", "Airport"], 2)
///     .build();
///
/// assert_eq!(rows.len(), 4);
/// assert_eq!(rows[1].get("store_name"), Some("Harbour"));
/// ```
#[derive(Clone, Debug, Default)]
pub struct RowsBuilder {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl RowsBuilder {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Add one row; values pair with columns positionally, extras are ignored.
    #[must_use]
    pub fn add<V: Into<String>>(mut self, values: impl IntoIterator<Item = V>) -> Self {
        let row = self
            .columns
            .iter()
            .cloned()
            .zip(values.into_iter().map(Into::into))
            .collect();
        self.rows.push(row);
        self
    }

    #[must_use]
    pub fn add_repeated<V: Into<String> + Clone>(mut self, values: impl IntoIterator<Item = V>, count: usize) -> Self {
        let values: Vec<V> = values.into_iter().collect();
        for _ in 0..count {
            self = self.add(values.clone());
        }
        self
    }

    #[must_use]
    pub fn build(self) -> Vec<Row> {
        self.rows
    }
}

/// `count` rows `{field: start}`, `{field: start + 1}`, ...
#[must_use]
pub fn sequential_rows(field: &str, start: i64, count: usize) -> Vec<Row> {
    (start..)
        .take(count)
        .map(|i| Row::from_pairs([(field, i.to_string())]))
        .collect()
}
