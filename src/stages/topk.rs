//! Bounded Top-K sorter: the K best rows per group, emitted on session close.

use crate::combiners::{SortValue, SortedGroup};
use crate::error::Result;
use crate::row::Row;
use crate::runtime::{Outputs, SessionStore, StageLogic};
use std::collections::HashMap;
use tracing::debug;

type Groups = HashMap<Vec<String>, SortedGroup>;

/// Keeps, per session and group, the `k` rows ranking highest by
/// `(primary, secondary)` descending.
#[derive(Debug)]
pub struct TopKSorter {
    group_by: Vec<String>,
    primary: String,
    secondary: String,
    k: usize,
    sessions: SessionStore<Groups>,
}

impl TopKSorter {
    pub fn new<S: Into<String>>(
        group_by: impl IntoIterator<Item = S>,
        primary: impl Into<String>,
        secondary: impl Into<String>,
        k: usize,
    ) -> Self {
        Self {
            group_by: group_by.into_iter().map(Into::into).collect(),
            primary: primary.into(),
            secondary: secondary.into(),
            k,
            sessions: SessionStore::new(),
        }
    }

    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn insert(&mut self, session: &str, row: Row) -> bool {
        let key: Vec<String> = self
            .group_by
            .iter()
            .map(|f| row.get_or_empty(f).to_string())
            .collect();
        let primary = SortValue::of(&row, &self.primary);
        let secondary = SortValue::of(&row, &self.secondary);
        let k = self.k;
        self.sessions
            .touch(session)
            .entry(key)
            .or_insert_with(|| SortedGroup::new(k))
            .insert(row, primary, secondary)
    }

    /// Number of groups held for `session`.
    #[must_use]
    pub fn group_count(&self, session: &str) -> usize {
        self.sessions.get(session).map_or(0, HashMap::len)
    }

    /// Retained rows of `session`, group by group, in batches of at most `max`.
    /// Destructive.
    pub fn drain_batches(&mut self, session: &str, max: usize) -> Vec<Vec<Row>> {
        let Some(groups) = self.sessions.take(session) else {
            return Vec::new();
        };
        let rows: Vec<Row> = groups
            .into_values()
            .flat_map(SortedGroup::into_rows)
            .collect();
        rows.chunks(max.max(1)).map(<[Row]>::to_vec).collect()
    }
}

impl StageLogic for TopKSorter {
    fn on_rows(&mut self, session: &str, rows: Vec<Row>, _out: &mut Outputs) -> Result<()> {
        for row in rows {
            self.insert(session, row);
        }
        Ok(())
    }

    fn on_close(&mut self, session: &str, out: &mut Outputs) -> Result<()> {
        let batches = self.drain_batches(session, out.max_batch_size());
        debug!(session, batches = batches.len(), "flushing top-k groups");
        for batch in batches {
            out.emit(session, batch)?;
        }
        Ok(())
    }

    fn purge(&mut self, session: &str) {
        self.sessions.take(session);
    }

    fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn teardown(&mut self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn purchase(store: &str, user: &str, qty: &str) -> Row {
        Row::from_pairs([("store_id", store), ("user_id", user), ("purchases_qty", qty)])
    }

    #[test]
    fn keeps_top_k_per_group() {
        let mut t = TopKSorter::new(["store_id"], "purchases_qty", "user_id", 2);
        for (store, user, qty) in [("1", "a", "3"), ("1", "b", "9"), ("1", "c", "5"), ("2", "d", "1")] {
            t.insert("s", purchase(store, user, qty));
        }
        assert_eq!(t.group_count("s"), 2);
        let rows = t.drain_batches("s", 100).concat();
        assert_eq!(rows.len(), 3);
        let store1: Vec<&str> = rows
            .iter()
            .filter(|r| r.get("store_id") == Some("1"))
            .map(|r| r.get_or_empty("user_id"))
            .collect();
        assert_eq!(store1, vec!["b", "c"]);
    }

    #[test]
    fn drain_empties_the_session() {
        let mut t = TopKSorter::new(["g"], "v", "v", 1);
        t.insert("s", Row::from_pairs([("g", "x"), ("v", "1")]));
        assert_eq!(t.drain_batches("s", 10).concat().len(), 1);
        assert!(t.drain_batches("s", 10).is_empty());
        assert_eq!(t.open_sessions(), 0);
    }
}
