//! Loosely typed rows.
//!
//! A [`Row`] is an ordered mapping from field name to string value. Nothing in
//! the framework parses values: numeric and date interpretation belongs to the
//! stage that reads the field. Adjacent stages agree on field names by
//! configuration, not by a schema.
//!
//! Rows serialize as JSON objects with their fields in insertion order, which is
//! what the message codec puts on the wire.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Ordered `field -> value` mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Row {
    fields: Vec<(String, String)>,
}

impl Row {
    #[must_use]
    pub const fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Build a row from `(field, value)` pairs, keeping their order.
    ///
    /// A repeated field name keeps its first position and its last value.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut row = Self::new();
        for (k, v) in pairs {
            row.set(k, v);
        }
        row
    }

    /// Value of `field`, if present.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == field)
            .map(|(_, v)| v.as_str())
    }

    /// Value of `field`, or `""` when absent.
    ///
    /// Absent and empty are the same thing to the partitioner and the reducer.
    #[must_use]
    pub fn get_or_empty(&self, field: &str) -> &str {
        self.get(field).unwrap_or("")
    }

    /// Set `field` in place, appending it when new.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) {
        let field = field.into();
        let value = value.into();
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| *k == field) {
            slot.1 = value;
        } else {
            self.fields.push((field, value));
        }
    }

    /// Builder-style [`set`](Row::set).
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(field, value);
        self
    }

    pub fn remove(&mut self, field: &str) -> Option<String> {
        let pos = self.fields.iter().position(|(k, _)| k == field)?;
        Some(self.fields.remove(pos).1)
    }

    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == field)
    }

    /// Keep only `fields`, in the order given. Missing fields are skipped.
    #[must_use]
    pub fn project<S: AsRef<str>>(&self, fields: &[S]) -> Self {
        let mut out = Self::new();
        for f in fields {
            if let Some(v) = self.get(f.as_ref()) {
                out.fields.push((f.as_ref().to_string(), v.to_string()));
            }
        }
        out
    }

    /// Copy `fields` from `other` into this row, overwriting same-named fields.
    pub fn merge_from<S: AsRef<str>>(&mut self, other: &Self, fields: &[S]) {
        for f in fields {
            if let Some(v) = other.get(f.as_ref()) {
                self.set(f.as_ref(), v);
            }
        }
    }

    /// The first of `fields` that is absent or empty.
    #[must_use]
    pub fn first_missing<'a, S: AsRef<str>>(&self, fields: &'a [S]) -> Option<&'a str> {
        fields
            .iter()
            .map(AsRef::as_ref)
            .find(|f| self.get(f).is_none_or(str::is_empty))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

struct RowVisitor;

impl<'de> Visitor<'de> for RowVisitor {
    type Value = Row;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an object of string fields")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Row, A::Error> {
        let mut row = Row {
            fields: Vec::with_capacity(access.size_hint().unwrap_or(0)),
        };
        while let Some((k, v)) = access.next_entry::<String, String>()? {
            row.set(k, v);
        }
        Ok(row)
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(RowVisitor)
    }
}

/// Shorthand for building a [`Row`] in tests and configuration code.
///
/// ```
/// use stageflow::row;
///
/// let r = row! { "store_id" => "3", "tpv" => "120.5" };
/// assert_eq!(r.get("tpv"), Some("120.5"));
/// ```
#[macro_export]
macro_rules! row {
    () => { $crate::Row::new() };
    ($($k:expr => $v:expr),+ $(,)?) => {
        $crate::Row::from_pairs([$(($k, $v)),+])
    };
}
