//! Basic row combiners: Sum, Count

use crate::row::Row;

/// Fold of rows into one numeric accumulator per key.
///
/// Mirrors a combine function: `create` an empty accumulator, `add_input` one
/// row at a time, `finish` into the output value. Each key lives on exactly one
/// reducer instance; there is no merge step.
pub trait RowCombiner: Send + Sync {
    /// Field the finished value is written to.
    fn output_field(&self) -> &str;

    fn create(&self) -> f64 {
        0.0
    }

    /// Fold `row` into `acc`. Returns `false` (and leaves `acc` untouched) when
    /// the row carries no usable value.
    fn add_input(&self, acc: &mut f64, row: &Row) -> bool;

    fn finish(&self, acc: f64) -> String;
}

/* ===================== SumField ===================== */

/// Sum of a numeric field.
///
/// - Accumulator: `f64`
/// - Output: the sum rounded to `decimals` places, trailing zeros trimmed.
#[derive(Clone, Debug)]
pub struct SumField {
    field: String,
    output: String,
    decimals: usize,
}

impl SumField {
    pub fn new(field: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            output: output.into(),
            decimals: 2,
        }
    }

    #[must_use]
    pub fn with_decimals(mut self, decimals: usize) -> Self {
        self.decimals = decimals;
        self
    }
}

impl RowCombiner for SumField {
    fn output_field(&self) -> &str {
        &self.output
    }

    fn add_input(&self, acc: &mut f64, row: &Row) -> bool {
        match row.get(&self.field).map(str::trim).map(str::parse::<f64>) {
            Some(Ok(v)) if v.is_finite() => {
                *acc += v;
                true
            }
            _ => false,
        }
    }

    fn finish(&self, acc: f64) -> String {
        format_amount(acc, self.decimals)
    }
}

/* ===================== CountRows ===================== */

/// Number of rows per key.
#[derive(Clone, Debug)]
pub struct CountRows {
    output: String,
}

impl CountRows {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

impl RowCombiner for CountRows {
    fn output_field(&self) -> &str {
        &self.output
    }

    fn add_input(&self, acc: &mut f64, _row: &Row) -> bool {
        *acc += 1.0;
        true
    }

    fn finish(&self, acc: f64) -> String {
        format_amount(acc, 0)
    }
}

/// `v` rounded to `decimals` places without trailing zeros: `12.50` → `"12.5"`,
/// `3.00` → `"3"`.
#[must_use]
pub fn format_amount(v: f64, decimals: usize) -> String {
    let s = format!("{v:.decimals$}");
    let s = if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    };
    if s == "-0" { "0".to_string() } else { s }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_skips_unparseable_values() {
        let sum = SumField::new("x", "total");
        let mut acc = sum.create();
        assert!(sum.add_input(&mut acc, &Row::from_pairs([("x", "1.5")])));
        assert!(!sum.add_input(&mut acc, &Row::from_pairs([("x", "n/a")])));
        assert!(!sum.add_input(&mut acc, &Row::from_pairs([("y", "2")])));
        assert_eq!(sum.finish(acc), "1.5");
    }

    #[test]
    fn count_counts_rows() {
        let count = CountRows::new("purchases_qty");
        let mut acc = count.create();
        for _ in 0..4 {
            assert!(count.add_input(&mut acc, &Row::new()));
        }
        assert_eq!(count.finish(acc), "4");
    }

    #[test]
    fn amounts_are_trimmed() {
        assert_eq!(format_amount(12.5, 2), "12.5");
        assert_eq!(format_amount(3.0, 2), "3");
        assert_eq!(format_amount(0.1 + 0.2, 2), "0.3");
        assert_eq!(format_amount(-0.001, 2), "0");
        assert_eq!(format_amount(150.0, 0), "150");
    }
}
