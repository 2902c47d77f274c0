//! Bounded, descending row list for Top-K selection

use crate::row::Row;
use ordered_float::OrderedFloat;
use std::cmp::Ordering;

/* ===================== SortValue ===================== */

/// A comparable field value.
///
/// Numbers compare numerically, everything else lexicographically. A number
/// always sorts below text, so a column of mixed values stays totally ordered.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SortValue {
    Num(OrderedFloat<f64>),
    Text(String),
}

impl SortValue {
    /// Numeric when `raw` parses as a finite number, text otherwise.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Self::Num(OrderedFloat(v)),
            _ => Self::Text(raw.to_string()),
        }
    }

    /// Value of `field` in `row`; a missing field reads as empty text.
    #[must_use]
    pub fn of(row: &Row, field: &str) -> Self {
        Self::parse(row.get_or_empty(field))
    }
}

/* ===================== SortedGroup ===================== */

#[derive(Clone, Debug)]
struct Entry {
    primary: SortValue,
    secondary: SortValue,
    row: Row,
}

impl Entry {
    fn cmp_key(&self, primary: &SortValue, secondary: &SortValue) -> Ordering {
        (&self.primary, &self.secondary).cmp(&(primary, secondary))
    }
}

/// The **K** largest rows of one group, descending by `(primary, secondary)`.
///
/// Insertion is a bounded insertion sort: O(K) per row, memory bounded by K.
/// A new row goes immediately before the first strictly smaller entry, so among
/// equal pairs the earlier arrival ranks first.
#[derive(Clone, Debug)]
pub struct SortedGroup {
    k: usize,
    entries: Vec<Entry>,
}

impl SortedGroup {
    #[must_use]
    pub fn new(k: usize) -> Self {
        Self {
            k,
            entries: Vec::with_capacity(k.min(64)),
        }
    }

    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert `row` ranked by `(primary, secondary)`. Returns `false` when the
    /// row did not make the cut.
    pub fn insert(&mut self, row: Row, primary: SortValue, secondary: SortValue) -> bool {
        if self.k == 0 {
            return false;
        }
        let pos = self
            .entries
            .iter()
            .position(|e| e.cmp_key(&primary, &secondary) == Ordering::Less)
            .unwrap_or(self.entries.len());
        if pos >= self.k {
            return false;
        }
        self.entries.insert(
            pos,
            Entry {
                primary,
                secondary,
                row,
            },
        );
        self.entries.truncate(self.k);
        true
    }

    /// Retained pairs, largest first.
    pub fn keys(&self) -> impl Iterator<Item = (&SortValue, &SortValue)> {
        self.entries.iter().map(|e| (&e.primary, &e.secondary))
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.entries.iter().map(|e| &e.row)
    }

    /// Consume the group, yielding rows largest first.
    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        self.entries.into_iter().map(|e| e.row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(v: f64) -> SortValue {
        SortValue::Num(OrderedFloat(v))
    }

    fn tagged(tag: &str) -> Row {
        Row::from_pairs([("tag", tag)])
    }

    #[test]
    fn keeps_k_largest_descending() {
        let mut g = SortedGroup::new(3);
        for (i, v) in [5.0, 1.0, 9.0, 7.0, 3.0].iter().enumerate() {
            g.insert(tagged(&i.to_string()), num(*v), num(0.0));
        }
        let kept: Vec<_> = g.keys().map(|(p, _)| p.clone()).collect();
        assert_eq!(kept, vec![num(9.0), num(7.0), num(5.0)]);
    }

    #[test]
    fn secondary_breaks_ties() {
        let mut g = SortedGroup::new(2);
        g.insert(tagged("a"), num(4.0), num(1.0));
        g.insert(tagged("b"), num(4.0), num(3.0));
        g.insert(tagged("c"), num(4.0), num(2.0));
        let tags: Vec<_> = g.rows().map(|r| r.get("tag").unwrap().to_string()).collect();
        assert_eq!(tags, vec!["b", "c"]);
    }

    #[test]
    fn equal_pairs_keep_arrival_order() {
        let mut g = SortedGroup::new(2);
        assert!(g.insert(tagged("first"), num(1.0), num(1.0)));
        assert!(g.insert(tagged("second"), num(1.0), num(1.0)));
        assert!(!g.insert(tagged("third"), num(1.0), num(1.0)));
        let tags: Vec<_> = g.into_rows().into_iter().map(|r| r.get("tag").unwrap().to_string()).collect();
        assert_eq!(tags, vec!["first", "second"]);
    }

    #[test]
    fn zero_k_keeps_nothing() {
        let mut g = SortedGroup::new(0);
        assert!(!g.insert(tagged("x"), num(1.0), num(1.0)));
        assert!(g.is_empty());
    }

    #[test]
    fn numbers_sort_below_text() {
        assert!(SortValue::parse("1000") < SortValue::parse("abc"));
        assert!(SortValue::parse("2.5") > SortValue::parse("-3"));
        assert_eq!(SortValue::parse(" 7 "), num(7.0));
    }
}
