//! Session-scoped state arena.
//!
//! Stateful stages keep one `S` per live session here instead of in ambient
//! maps. A session's entry is created by the first row that touches it and
//! destroyed by [`SessionStore::take`] when the stage finalizes the session.

use std::collections::HashMap;

#[derive(Debug)]
pub struct SessionStore<S> {
    sessions: HashMap<String, S>,
}

impl<S> Default for SessionStore<S> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }
}

impl<S> SessionStore<S> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State of `session`, created empty on first touch.
    pub fn touch(&mut self, session: &str) -> &mut S
    where
        S: Default,
    {
        self.sessions.entry(session.to_string()).or_default()
    }

    #[must_use]
    pub fn get(&self, session: &str) -> Option<&S> {
        self.sessions.get(session)
    }

    pub fn get_mut(&mut self, session: &str) -> Option<&mut S> {
        self.sessions.get_mut(session)
    }

    /// Remove and return the state of `session`.
    pub fn take(&mut self, session: &str) -> Option<S> {
        self.sessions.remove(session)
    }

    #[must_use]
    pub fn contains(&self, session: &str) -> bool {
        self.sessions.contains_key(session)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(String::as_str)
    }

    /// Drop every session; returns how many were live.
    pub fn clear(&mut self) -> usize {
        let n = self.sessions.len();
        self.sessions.clear();
        n
    }
}
