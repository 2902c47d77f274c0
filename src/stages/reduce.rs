//! Keyed reducer: group by a key tuple, fold, emit once the session closes.

use crate::combiners::RowCombiner;
use crate::error::Result;
use crate::row::Row;
use crate::runtime::{Outputs, SessionStore, StageLogic};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

type Accumulators = HashMap<Vec<String>, f64>;

/// Folds rows per `(session, key tuple)` with a [`RowCombiner`].
///
/// A row with any empty key field is unattributable: it is dropped and logged,
/// not folded into some fallback bucket.
///
/// Emitted rows carry the key fields followed by the combiner's output field.
/// Re-sharding them for the next stage is the job of this stage's
/// [`Routing::ByKey`](crate::runtime::Routing::ByKey) output.
pub struct KeyedReducer {
    key_fields: Vec<String>,
    combiner: Arc<dyn RowCombiner>,
    sessions: SessionStore<Accumulators>,
}

impl KeyedReducer {
    pub fn new<S: Into<String>>(
        key_fields: impl IntoIterator<Item = S>,
        combiner: Arc<dyn RowCombiner>,
    ) -> Self {
        Self {
            key_fields: key_fields.into_iter().map(Into::into).collect(),
            combiner,
            sessions: SessionStore::new(),
        }
    }

    #[must_use]
    pub fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    /// Fold one row. Returns `false` if the row was dropped.
    pub fn reduce(&mut self, session: &str, row: &Row) -> bool {
        if let Some(missing) = row.first_missing(&self.key_fields) {
            warn!(session, field = missing, "unattributable row: empty key field; dropped");
            return false;
        }
        let key: Vec<String> = self
            .key_fields
            .iter()
            .map(|f| row.get_or_empty(f).to_string())
            .collect();
        let combiner = Arc::clone(&self.combiner);
        let accs = self.sessions.touch(session);
        let mut acc = accs.get(&key).copied().unwrap_or_else(|| combiner.create());
        if !combiner.add_input(&mut acc, row) {
            warn!(session, output = combiner.output_field(), "row has no usable value; dropped");
            return false;
        }
        accs.insert(key, acc);
        true
    }

    /// Number of distinct keys accumulated for `session`.
    #[must_use]
    pub fn key_count(&self, session: &str) -> usize {
        self.sessions.get(session).map_or(0, HashMap::len)
    }

    /// Take everything accumulated for `session` as batches of at most `max`
    /// rows. Destructive: a second call returns nothing.
    pub fn drain_batches(&mut self, session: &str, max: usize) -> Vec<Vec<Row>> {
        let Some(accs) = self.sessions.take(session) else {
            return Vec::new();
        };
        let rows: Vec<Row> = accs
            .into_iter()
            .map(|(key, acc)| {
                let mut row: Row = self.key_fields.iter().cloned().zip(key).collect();
                row.set(self.combiner.output_field(), self.combiner.finish(acc));
                row
            })
            .collect();
        rows.chunks(max.max(1)).map(<[Row]>::to_vec).collect()
    }
}

impl StageLogic for KeyedReducer {
    fn on_rows(&mut self, session: &str, rows: Vec<Row>, out: &mut Outputs) -> Result<()> {
        let dropped = rows.iter().filter(|r| !self.reduce(session, r)).count();
        out.metrics().add_dropped(dropped);
        Ok(())
    }

    fn on_close(&mut self, session: &str, out: &mut Outputs) -> Result<()> {
        let batches = self.drain_batches(session, out.max_batch_size());
        debug!(session, batches = batches.len(), "flushing accumulators");
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
