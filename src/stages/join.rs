//! Two-stream equality join: a broadcast **base** dataset against a sharded
//! **stream**, per session.
//!
//! Both inputs are consumed concurrently. Everything they share lives in one
//! [`JoinState`] behind one mutex:
//!
//! - per session: `base_rows`, `base_ready`, `stream_buffer`, `stream_closed`;
//! - both EOF barriers;
//! - the downstream [`Outputs`].
//!
//! Every decision that looks at both sides (buffer or join a stream batch,
//! finalize or defer on an EOF) is taken inside a single critical section, so
//! there is no window in which one loop acts on a stale view of the other.
//!
//! Per session:
//!
//! | event                   | `base_ready` = false        | `base_ready` = true |
//! |-------------------------|-----------------------------|---------------------|
//! | stream batch            | buffered (FIFO)             | joined, forwarded   |
//! | stream barrier fires    | `stream_closed` = true      | finalize            |
//! | base barrier fires      | flush buffer; set ready; finalize if `stream_closed` | - |
//!
//! Finalizing forwards what is still buffered in arrival order, sends EOF
//! downstream and purges the session.

use crate::error::{Result, StageError};
use crate::message::{Frame, Kind, Message, decode};
use crate::row::Row;
use crate::runtime::{BarrierState, EofBarrier, Outputs, SessionStore, StageContext};
use crate::transport::{CancellationToken, Flow, Source, Transport};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tracing::{debug, error, info, warn};

/// Which fields meet, and what the base side contributes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinSpec {
    pub base_key: String,
    pub stream_key: String,
    /// Copied from the matching base row onto the stream row.
    pub base_fields: Vec<String>,
}

impl JoinSpec {
    pub fn new<S: Into<String>>(
        base_key: impl Into<String>,
        stream_key: impl Into<String>,
        base_fields: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            base_key: base_key.into(),
            stream_key: stream_key.into(),
            base_fields: base_fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Same key name on both sides.
    pub fn on<S: Into<String>>(key: impl Into<String>, base_fields: impl IntoIterator<Item = S>) -> Self {
        let key = key.into();
        Self::new(key.clone(), key, base_fields)
    }
}

/// One side of the join.
#[derive(Clone, Debug)]
pub struct JoinInput {
    pub source: Source,
    pub kind: Kind,
    /// Upstream producers that each send one EOF per session.
    pub producers: usize,
}

impl JoinInput {
    #[must_use]
    pub fn new(source: Source, kind: Kind, producers: usize) -> Self {
        Self {
            source,
            kind,
            producers,
        }
    }
}

/// Which input a message arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Base,
    Stream,
}

#[derive(Debug, Default)]
struct JoinSession {
    base_rows: Vec<Row>,
    base_ready: bool,
    stream_buffer: VecDeque<Vec<Row>>,
    stream_closed: bool,
}

struct JoinState {
    sessions: SessionStore<JoinSession>,
    base_barrier: EofBarrier,
    stream_barrier: EofBarrier,
    outputs: Outputs,
}

pub struct TwoStreamJoiner {
    ctx: StageContext,
    spec: JoinSpec,
    base: JoinInput,
    stream: JoinInput,
    transport: Arc<dyn Transport>,
    state: Mutex<JoinState>,
}

impl TwoStreamJoiner {
    /// # Errors
    /// [`StageError::Config`] when either side has no producers or accepts EOF.
    pub fn new(
        ctx: StageContext,
        spec: JoinSpec,
        base: JoinInput,
        stream: JoinInput,
        outputs: Outputs,
    ) -> Result<Self> {
        for input in [&base, &stream] {
            if !input.kind.is_data() {
                return Err(StageError::config(format!(
                    "join `{}` cannot accept EOF as an input kind",
                    ctx.stage
                )));
            }
        }
        let name = ctx.name();
        let state = JoinState {
            sessions: SessionStore::new(),
            base_barrier: EofBarrier::new(format!("{name}/base"), base.producers)?,
            stream_barrier: EofBarrier::new(format!("{name}/stream"), stream.producers)?,
            outputs,
        };
        Ok(Self {
            transport: state.outputs.transport(),
            ctx,
            spec,
            base,
            stream,
            state: Mutex::new(state),
        })
    }

    #[must_use]
    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// Sessions currently holding join state.
    ///
    /// # Errors
    /// [`StageError::ProtocolViolation`] if the state lock is poisoned.
    pub fn open_sessions(&self) -> Result<usize> {
        Ok(self.lock()?.sessions.len())
    }

    /// Stream batches waiting for `session`'s base data.
    ///
    /// # Errors
    /// [`StageError::ProtocolViolation`] if the state lock is poisoned.
    pub fn buffered(&self, session: &str) -> Result<usize> {
        Ok(self
            .lock()?
            .sessions
            .get(session)
            .map_or(0, |js| js.stream_buffer.len()))
    }

    /// Run both consume loops until cancelled or one fails, then tear down.
    ///
    /// # Errors
    /// The first fatal error of either loop.
    pub fn run(self, cancel: &CancellationToken) -> Result<()> {
        let local = cancel.child_token();
        info!(
            stage = %self.ctx.name(),
            base = %self.base.source.pattern(),
            stream = %self.stream.source.pattern(),
            "join started"
        );
        let (base, stream) = thread::scope(|s| {
            let base = s.spawn(|| self.consume(Side::Base, &local));
            let stream = self.consume(Side::Stream, &local);
            let base = base.join().unwrap_or_else(|_| {
                Err(StageError::protocol(self.ctx.name(), "base loop panicked"))
            });
            (base, stream)
        });
        let result = base.and(stream);
        self.teardown(&result);
        result
    }

    fn consume(&self, side: Side, local: &CancellationToken) -> Result<()> {
        let source = match side {
            Side::Base => &self.base.source,
            Side::Stream => &self.stream.source,
        };
        let result = self
            .transport
            .consume(source, local, &mut |message| self.dispatch(side, message, local));
        if result.is_err() {
            // take the other loop down with this one
            local.cancel();
        }
        result
    }

    fn dispatch(&self, side: Side, message: Message, local: &CancellationToken) -> Result<Flow> {
        if local.is_cancelled() {
            let source = match side {
                Side::Base => &self.base.source,
                Side::Stream => &self.stream.source,
            };
            self.transport.requeue(source, message)?;
            return Ok(Flow::Stop);
        }
        match self.handle(side, message) {
            Ok(()) => Ok(Flow::Continue),
            Err(e) if !e.is_fatal() => {
                error!(stage = %self.ctx.name(), ?side, error = %e, "message rejected");
                self.ctx.metrics.add_rejected();
                Ok(Flow::Continue)
            }
            Err(e) => Err(e),
        }
    }

    /// Process one message from `side`.
    ///
    /// Public so the join can be driven deterministically without a broker.
    ///
    /// # Errors
    /// Any [`StageError`]; only [`StageError::Format`] is recoverable.
    pub fn handle(&self, side: Side, message: Message) -> Result<()> {
        let frame = decode(&message)?;
        let expected = match side {
            Side::Base => self.base.kind,
            Side::Stream => self.stream.kind,
        };
        let (Frame::Batch { kind, .. } | Frame::Eof { kind, .. }) = &frame;
        if *kind != expected {
            return Err(StageError::protocol(
                self.ctx.name(),
                format!("received {kind} on the {side:?} input, which accepts {expected}"),
            ));
        }
        let mut guard = self.lock()?;
        let state = &mut *guard;
        match (side, frame) {
            (Side::Base, Frame::Batch { session, rows, .. }) => {
                self.ensure_open(&state.base_barrier, &session)?;
                self.ctx.metrics.add_rows_in(rows.len());
                state.sessions.touch(&session).base_rows.extend(rows);
                Ok(())
            }
            (Side::Base, Frame::Eof { session, .. }) => match state.base_barrier.observe(&session)? {
                BarrierState::Open { seen, expected } => {
                    debug!(stage = %self.ctx.name(), session = %session, seen, expected, "base EOF observed");
                    Ok(())
                }
                BarrierState::Fired => self.on_base_ready(state, &session),
            },
            (Side::Stream, Frame::Batch { session, rows, .. }) => {
                self.ensure_open(&state.stream_barrier, &session)?;
                self.ctx.metrics.add_rows_in(rows.len());
                let js = state.sessions.touch(&session);
                if js.base_ready {
                    let joined = self.join(&session, &js.base_rows, rows);
                    state.outputs.emit(&session, joined)
                } else {
                    js.stream_buffer.push_back(rows);
                    debug!(
                        stage = %self.ctx.name(),
                        session = %session,
                        buffered = js.stream_buffer.len(),
                        "base not ready; stream batch buffered"
                    );
                    Ok(())
                }
            }
            (Side::Stream, Frame::Eof { session, .. }) => {
                match state.stream_barrier.observe(&session)? {
                    BarrierState::Open { seen, expected } => {
                        debug!(stage = %self.ctx.name(), session = %session, seen, expected, "stream EOF observed");
                        Ok(())
                    }
                    BarrierState::Fired => {
                        let js = state.sessions.touch(&session);
                        if js.base_ready {
                            self.finalize(state, &session)
                        } else {
                            js.stream_closed = true;
                            debug!(stage = %self.ctx.name(), session = %session, "stream closed before base; finalize deferred");
                            Ok(())
                        }
                    }
                }
            }
        }
    }

    fn on_base_ready(&self, state: &mut JoinState, session: &str) -> Result<()> {
        let js = state.sessions.touch(session);
        js.base_ready = true;
        let buffered: Vec<Vec<Row>> = js.stream_buffer.drain(..).collect();
        debug!(
            stage = %self.ctx.name(),
            session,
            base_rows = js.base_rows.len(),
            buffered = buffered.len(),
            "base ready"
        );
        for rows in buffered {
            let joined = self.join(session, &js.base_rows, rows);
            state.outputs.emit(session, joined)?;
        }
        if js.stream_closed {
            self.finalize(state, session)?;
        }
        Ok(())
    }

    fn finalize(&self, state: &mut JoinState, session: &str) -> Result<()> {
        let js = state.sessions.take(session).unwrap_or_default();
        for rows in js.stream_buffer {
            let joined = self.join(session, &js.base_rows, rows);
            state.outputs.emit(session, joined)?;
        }
        state.outputs.emit_eof(session)?;
        self.ctx.metrics.add_session_closed();
        info!(stage = %self.ctx.name(), session, "session closed");
        Ok(())
    }

    /// First base row with an equal key wins; misses are dropped.
    fn join(&self, session: &str, base: &[Row], rows: Vec<Row>) -> Vec<Row> {
        let mut out = Vec::with_capacity(rows.len());
        let mut misses = 0;
        for mut row in rows {
            let key = row.get_or_empty(&self.spec.stream_key);
            match base.iter().find(|b| b.get(&self.spec.base_key) == Some(key)) {
                Some(b) => {
                    row.merge_from(b, &self.spec.base_fields);
                    out.push(row);
                }
                None => {
                    warn!(stage = %self.ctx.name(), session, key, "no base row matches; stream row dropped");
                    misses += 1;
                }
            }
        }
        self.ctx.metrics.add_dropped(misses);
        out
    }

    fn ensure_open(&self, barrier: &EofBarrier, session: &str) -> Result<()> {
        if barrier.is_closed(session) {
            return Err(StageError::protocol(
                self.ctx.name(),
                format!("data for session `{session}` after its EOF barrier fired"),
            ));
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, JoinState>> {
        self.state
            .lock()
            .map_err(|_| StageError::protocol(self.ctx.name(), "join state lock poisoned"))
    }

    fn teardown(&self, result: &Result<()>) {
        let (lost, pending) = match self.lock() {
            Ok(mut state) => {
                let pending = state.base_barrier.reset_open() + state.stream_barrier.reset_open();
                (state.sessions.clear(), pending)
            }
            Err(_) => (0, 0),
        };
        match result {
            Ok(()) => {
                info!(stage = %self.ctx.name(), lost_sessions = lost, pending_barriers = pending, "join stopped");
            }
            Err(e) => {
                warn!(stage = %self.ctx.name(), error = %e, lost_sessions = lost, "join torn down");
            }
        }
    }
}
