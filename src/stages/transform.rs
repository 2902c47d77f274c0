//! Stateless per-row stage: filters, cleaners and mappers.

use crate::error::Result;
use crate::row::Row;
use crate::runtime::{Outputs, StageLogic};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

pub type Predicate = Arc<dyn Fn(&Row) -> bool + Send + Sync>;
/// Rewrites a row; `None` drops it.
pub type Rewrite = Arc<dyn Fn(Row) -> Option<Row> + Send + Sync>;

/// One step of a transform, applied in declaration order.
#[derive(Clone)]
pub enum Step {
    /// Keep rows matching the predicate; the rest are dropped silently.
    Filter(Predicate),
    Map(Rewrite),
    /// Keep only these fields, in this order.
    Project(Vec<String>),
    /// Drop (with a warning) rows missing any of these fields.
    Require(Vec<String>),
}

impl Step {
    pub fn filter(f: impl Fn(&Row) -> bool + Send + Sync + 'static) -> Self {
        Self::Filter(Arc::new(f))
    }

    pub fn map(f: impl Fn(Row) -> Option<Row> + Send + Sync + 'static) -> Self {
        Self::Map(Arc::new(f))
    }

    pub fn project<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self::Project(fields.into_iter().map(Into::into).collect())
    }

    pub fn require<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self::Require(fields.into_iter().map(Into::into).collect())
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filter(_) => f.write_str("Filter(..)"),
            Self::Map(_) => f.write_str("Map(..)"),
            Self::Project(fields) => f.debug_tuple("Project").field(fields).finish(),
            Self::Require(fields) => f.debug_tuple("Require").field(fields).finish(),
        }
    }
}

/// Applies its steps to every row and forwards what survives, in input order.
#[derive(Clone, Debug, Default)]
pub struct TransformStage {
    steps: Vec<Step>,
}

impl TransformStage {
    #[must_use]
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run one row through every step.
    #[must_use]
    pub fn apply(&self, row: Row) -> Option<Row> {
        let mut row = row;
        for step in &self.steps {
            row = match step {
                Step::Filter(keep) => keep(&row).then_some(row)?,
                Step::Map(rewrite) => rewrite(row)?,
                Step::Project(fields) => row.project(fields),
                Step::Require(fields) => {
                    if let Some(missing) = row.first_missing(fields) {
                        warn!(field = missing, "row missing required field; dropped");
                        return None;
                    }
                    row
                }
            };
        }
        Some(row)
    }

    /// Apply to a whole batch, preserving order.
    #[must_use]
    pub fn apply_all(&self, rows: Vec<Row>) -> Vec<Row> {
        rows.into_iter().filter_map(|r| self.apply(r)).collect()
    }
}

impl StageLogic for TransformStage {
    fn on_rows(&mut self, session: &str, rows: Vec<Row>, out: &mut Outputs) -> Result<()> {
        let n = rows.len();
        let kept = self.apply_all(rows);
        out.metrics().add_dropped(n - kept.len());
        out.emit(session, kept)
    }
}

/// Predicates and rewrites the coffee-shop queries are built from.
pub mod builtins {
    use super::{Predicate, Rewrite};
    use crate::partition::parse_integer;
    use crate::row::Row;
    use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
    use std::sync::Arc;
    use tracing::debug;

    const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

    /// `2024-07-01 10:15:00`, `2024-07-01T10:15:00`, `2024-07-01 10:15` or a
    /// bare date (read as midnight). Fractional seconds are ignored.
    #[must_use]
    pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
        let raw = raw.trim();
        let raw = raw.split_once('.').map_or(raw, |(head, _)| head);
        DATETIME_FORMATS
            .iter()
            .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
            .or_else(|| {
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
    }

    fn timestamp_of(row: &Row, field: &str) -> Option<NaiveDateTime> {
        let ts = parse_timestamp(row.get_or_empty(field));
        if ts.is_none() {
            debug!(field, value = row.get_or_empty(field), "unparseable timestamp");
        }
        ts
    }

    /// Timestamp in `field` falls in `from..=to` (years).
    #[must_use]
    pub fn year_between(field: &str, from: i32, to: i32) -> Predicate {
        let field = field.to_string();
        Arc::new(move |row| timestamp_of(row, &field).is_some_and(|ts| (from..=to).contains(&ts.year())))
    }

    /// Time of day in `field` falls in `start..=end`.
    #[must_use]
    pub fn time_between(field: &str, start: NaiveTime, end: NaiveTime) -> Predicate {
        let field = field.to_string();
        Arc::new(move |row| timestamp_of(row, &field).is_some_and(|ts| (start..=end).contains(&ts.time())))
    }

    /// Numeric `field` is at least `min`. Non-numeric values fail.
    #[must_use]
    pub fn at_least(field: &str, min: f64) -> Predicate {
        let field = field.to_string();
        Arc::new(move |row| {
            row.get_or_empty(&field)
                .trim()
                .parse::<f64>()
                .is_ok_and(|v| v >= min)
        })
    }

    /// Adds `into = "YYYY-MM"` from the timestamp in `from`.
    #[must_use]
    pub fn year_month(from: &str, into: &str) -> Rewrite {
        let (from, into) = (from.to_string(), into.to_string());
        Arc::new(move |row| {
            let ts = timestamp_of(&row, &from)?;
            Some(row.with(into.clone(), format!("{:04}-{:02}", ts.year(), ts.month())))
        })
    }

    /// Adds `into = "YYYY-H1"` or `"YYYY-H2"` from the timestamp in `from`.
    #[must_use]
    pub fn year_half(from: &str, into: &str) -> Rewrite {
        let (from, into) = (from.to_string(), into.to_string());
        Arc::new(move |row| {
            let ts = timestamp_of(&row, &from)?;
            let half = if ts.month() <= 6 { 1 } else { 2 };
            Some(row.with(into.clone(), format!("{}-H{half}", ts.year())))
        })
    }

    /// Rewrites `"42.0"` to `"42"`. Empty and non-numeric values are left alone.
    #[must_use]
    pub fn integer_id(field: &str) -> Rewrite {
        let field = field.to_string();
        Arc::new(move |mut row| {
            if let Some(id) = row.get(&field).and_then(parse_integer) {
                row.set(field.clone(), id.to_string());
            }
            Some(row)
        })
    }

    /// Keeps only the date part of a timestamp field: `1990-05-01 00:00:00` → `1990-05-01`.
    #[must_use]
    pub fn date_only(field: &str) -> Rewrite {
        let field = field.to_string();
        Arc::new(move |mut row| {
            if let Some(ts) = row.get(&field).and_then(parse_timestamp) {
                row.set(field.clone(), ts.date().to_string());
            }
            Some(row)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::builtins::*;
    use super::*;
    use chrono::NaiveTime;

    fn tx(created_at: &str, amount: &str) -> Row {
        Row::from_pairs([
            ("transaction_id", "t"),
            ("created_at", created_at),
            ("final_amount", amount),
        ])
    }

    fn window() -> Predicate {
        let start = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(23, 0, 0).unwrap();
        time_between("created_at", start, end)
    }

    #[test]
    fn filters_compose_in_order() {
        let stage = TransformStage::default()
            .step(Step::Filter(year_between("created_at", 2024, 2025)))
            .step(Step::Filter(window()))
            .step(Step::Filter(at_least("final_amount", 75.0)))
            .step(Step::project(["transaction_id", "final_amount"]));

        assert!(stage.apply(tx("2024-03-01 10:00:00", "80")).is_some());
        assert!(stage.apply(tx("2023-03-01 10:00:00", "80")).is_none());
        assert!(stage.apply(tx("2024-03-01 05:59:59", "80")).is_none());
        assert!(stage.apply(tx("2024-03-01 23:00:00", "80")).is_some());
        assert!(stage.apply(tx("2024-03-01 10:00:00", "74.99")).is_none());

        let kept = stage.apply(tx("2025-01-01 06:00:00", "75")).unwrap();
        assert_eq!(kept.len(), 2);
        assert!(!kept.contains("created_at"));
    }

    #[test]
    fn require_drops_rows_with_empty_fields() {
        let stage = TransformStage::new(vec![Step::require(["store_id"])]);
        assert!(stage.apply(Row::from_pairs([("store_id", "")])).is_none());
        assert!(stage.apply(Row::from_pairs([("store_id", "3")])).is_some());
    }

    #[test]
    fn derived_period_fields() {
        let row = tx("2024-07-15 12:00:00", "1");
        let ym = year_month("created_at", "year_month")(row.clone()).unwrap();
        assert_eq!(ym.get("year_month"), Some("2024-07"));
        let yh = year_half("created_at", "year_half")(row).unwrap();
        assert_eq!(yh.get("year_half"), Some("2024-H2"));
        assert!(year_half("created_at", "h")(tx("garbage", "1")).is_none());
    }

    #[test]
    fn order_is_preserved() {
        let stage = TransformStage::new(vec![Step::Filter(at_least("final_amount", 10.0))]);
        let rows: Vec<Row> = ["5", "20", "1", "30", "40"]
            .iter()
            .map(|a| tx("2024-01-01", a))
            .collect();
        let amounts: Vec<String> = stage
            .apply_all(rows)
            .iter()
            .map(|r| r.get_or_empty("final_amount").to_string())
            .collect();
        assert_eq!(amounts, vec!["20", "30", "40"]);
    }

    #[test]
    fn timestamps_tolerate_fractions_and_bare_dates() {
        assert!(parse_timestamp("2024-01-01 10:00:00.123").is_some());
        assert!(parse_timestamp("2024-01-01").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn integer_id_normalizes() {
        let row = integer_id("user_id")(Row::from_pairs([("user_id", "12.0")])).unwrap();
        assert_eq!(row.get("user_id"), Some("12"));
        let row = integer_id("user_id")(Row::from_pairs([("user_id", "")])).unwrap();
        assert_eq!(row.get("user_id"), Some(""));
    }
}
