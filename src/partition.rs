//! Deterministic key → shard mapping.
//!
//! Downstream workers of one stage each own a disjoint slice of the keyspace.
//! Nothing coordinates them; correctness depends only on every producer sending
//! a given key to the same shard, so [`shard_for`] must never change its answer
//! for the same `(value, shard_count)`.
//!
//! Policy:
//! - empty value → shard `0`. Unattributable rows are kept (and hot-spot
//!   shard 0) rather than dropped.
//! - numeric keys → `abs(n) mod shard_count`, and the row is rewritten to the
//!   canonical integer form so `"42.0"` and `"42"` join later on.
//! - text keys → base-31 polynomial hash `mod shard_count`.

use crate::error::{Result, StageError};
use crate::row::Row;
use tracing::warn;

/// How a sharding field is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardKey {
    /// Identifiers; parsed as a number and normalized.
    Numeric,
    /// Anything else; hashed.
    Text,
}

/// Shard for a raw field value, hashing it as text unless it is empty.
#[must_use]
pub fn shard_for(value: &str, shard_count: usize) -> usize {
    shard_for_key(value, ShardKey::Text, shard_count).0
}

/// Shard for a numeric key. Values that do not parse fall back to the text hash.
#[must_use]
pub fn shard_for_numeric(value: &str, shard_count: usize) -> usize {
    shard_for_key(value, ShardKey::Numeric, shard_count).0
}

/// Shard plus the normalized value when `key` is numeric and `value` parsed.
fn shard_for_key(value: &str, key: ShardKey, shard_count: usize) -> (usize, Option<String>) {
    debug_assert!(shard_count > 0);
    let n = shard_count.max(1) as u64;
    if value.is_empty() {
        return (0, None);
    }
    if key == ShardKey::Numeric
        && let Some(id) = parse_integer(value)
    {
        return ((id.unsigned_abs() % n) as usize, Some(id.to_string()));
    }
    ((polynomial_hash(value) % n) as usize, None)
}

/// Canonical integer behind `"42"`, `" 42 "`, `"42.0"` or `"-7.00"`.
///
/// Fractional values are truncated toward zero.
#[must_use]
pub fn parse_integer(value: &str) -> Option<i64> {
    let v = value.trim();
    if let Ok(i) = v.parse::<i64>() {
        return Some(i);
    }
    let f = v.parse::<f64>().ok()?;
    if !f.is_finite() || f.abs() >= i64::MAX as f64 {
        return None;
    }
    Some(f.trunc() as i64)
}

/// `h = h * 31 + byte`, wrapping.
#[must_use]
pub fn polynomial_hash(value: &str) -> u64 {
    value
        .bytes()
        .fold(0u64, |h, b| h.wrapping_mul(31).wrapping_add(u64::from(b)))
}

/// Routes rows of one output to `shards` downstream workers by `field`.
#[derive(Clone, Debug)]
pub struct Partitioner {
    field: String,
    key: ShardKey,
    shards: usize,
}

impl Partitioner {
    /// # Errors
    /// [`StageError::Config`] when `shards` is zero.
    pub fn new(field: impl Into<String>, key: ShardKey, shards: usize) -> Result<Self> {
        let field = field.into();
        if shards == 0 {
            return Err(StageError::config(format!(
                "partitioner on `{field}` needs at least one shard"
            )));
        }
        Ok(Self { field, key, shards })
    }

    /// Like [`new`](Partitioner::new), clamping `shards` to at least one.
    pub(crate) fn sized(field: impl Into<String>, key: ShardKey, shards: usize) -> Self {
        Self {
            field: field.into(),
            key,
            shards: shards.max(1),
        }
    }

    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    #[must_use]
    pub fn shards(&self) -> usize {
        self.shards
    }

    /// Same partitioner aimed at a different number of shards.
    #[must_use]
    pub fn with_shards(&self, shards: usize) -> Self {
        Self {
            shards: shards.max(1),
            ..self.clone()
        }
    }

    /// Shard for `row`, normalizing a numeric key in place.
    pub fn route(&self, row: &mut Row) -> usize {
        let value = row.get_or_empty(&self.field);
        let (shard, normalized) = shard_for_key(value, self.key, self.shards);
        if self.key == ShardKey::Numeric && normalized.is_none() && !value.is_empty() {
            warn!(field = %self.field, value = %value, "numeric shard key did not parse; hashing as text");
        }
        if let Some(canonical) = normalized
            && canonical != value
        {
            row.set(self.field.clone(), canonical);
        }
        shard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_goes_to_shard_zero() {
        for n in 1..10 {
            assert_eq!(shard_for("", n), 0);
            assert_eq!(shard_for_numeric("", n), 0);
        }
    }

    #[test]
    fn numeric_is_abs_mod() {
        assert_eq!(shard_for_numeric("7", 3), 1);
        assert_eq!(shard_for_numeric("-7", 3), 1);
        assert_eq!(shard_for_numeric("7.9", 3), 1);
        assert_eq!(shard_for_numeric("9", 3), 0);
    }

    #[test]
    fn hash_is_java_style() {
        assert_eq!(polynomial_hash(""), 0);
        assert_eq!(polynomial_hash("a"), 97);
        assert_eq!(polynomial_hash("ab"), 97 * 31 + 98);
    }

    #[test]
    fn route_normalizes_numeric_field() {
        let p = Partitioner::new("user_id", ShardKey::Numeric, 4).unwrap();
        let mut row = Row::from_pairs([("user_id", "42.0")]);
        assert_eq!(p.route(&mut row), 2);
        assert_eq!(row.get("user_id"), Some("42"));
    }

    #[test]
    fn route_keeps_unparseable_numeric_value() {
        let p = Partitioner::new("user_id", ShardKey::Numeric, 4).unwrap();
        let mut row = Row::from_pairs([("user_id", "abc")]);
        let shard = p.route(&mut row);
        assert_eq!(shard, shard_for("abc", 4));
        assert_eq!(row.get("user_id"), Some("abc"));
    }

    #[test]
    fn zero_shards_is_rejected() {
        assert!(Partitioner::new("x", ShardKey::Text, 0).is_err());
    }
}
