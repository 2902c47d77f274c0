//! The per-(input, session) end-of-stream barrier.

use crate::error::{Result, StageError};
use std::collections::{HashMap, HashSet};

/// Outcome of observing one EOF.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierState {
    /// Still waiting on `expected - seen` producers.
    Open { seen: usize, expected: usize },
    /// This EOF was the last one expected. Reported exactly once per session.
    Fired,
}

/// Counts EOFs per session until every upstream producer has sent one.
///
/// Counters are created on the first EOF of a session and dropped when the
/// barrier fires. Fired session ids are remembered so a late EOF (or late data)
/// is reported as a protocol violation instead of silently opening a session
/// that can never close again.
#[derive(Debug)]
pub struct EofBarrier {
    label: String,
    expected: usize,
    counts: HashMap<String, usize>,
    closed: HashSet<String>,
}

impl EofBarrier {
    /// `label` names the stage input in errors.
    ///
    /// # Errors
    /// [`StageError::Config`] when `expected` is zero; such a barrier could
    /// never fire.
    pub fn new(label: impl Into<String>, expected: usize) -> Result<Self> {
        let label = label.into();
        if expected == 0 {
            return Err(StageError::config(format!(
                "`{label}` expects zero upstream producers"
            )));
        }
        Ok(Self {
            label,
            expected,
            counts: HashMap::new(),
            closed: HashSet::new(),
        })
    }

    #[must_use]
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// EOFs seen so far for an open session.
    #[must_use]
    pub fn seen(&self, session: &str) -> usize {
        self.counts.get(session).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_closed(&self, session: &str) -> bool {
        self.closed.contains(session)
    }

    /// Sessions with at least one EOF but not yet fired.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.counts.len()
    }

    /// Count one EOF for `session`.
    ///
    /// # Errors
    /// [`StageError::ProtocolViolation`] if the barrier already fired for
    /// `session`.
    pub fn observe(&mut self, session: &str) -> Result<BarrierState> {
        if self.closed.contains(session) {
            return Err(StageError::protocol(
                &self.label,
                format!("EOF for session `{session}` after its barrier fired"),
            ));
        }
        let seen = {
            let c = self.counts.entry(session.to_string()).or_insert(0);
            *c += 1;
            *c
        };
        if seen == self.expected {
            self.counts.remove(session);
            self.closed.insert(session.to_string());
            Ok(BarrierState::Fired)
        } else {
            Ok(BarrierState::Open {
                seen,
                expected: self.expected,
            })
        }
    }

    /// Forget every open counter. Closed ids are kept.
    pub fn reset_open(&mut self) -> usize {
        let n = self.counts.len();
        self.counts.clear();
        n
    }
}
