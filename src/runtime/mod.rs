//! Generic stage lifecycle and the EOF barrier protocol.
//!
//! A [`StageRuntime`] owns one input [`Source`], the [`EofBarrier`] for that
//! input, the downstream [`Outputs`] and a [`StageLogic`] that supplies the
//! stage-specific behaviour. Per delivered message:
//!
//! 1. cancelled? → requeue the message unprocessed and stop.
//! 2. decode; a [`StageError::Format`] rejects only this message.
//! 3. data batch of the accepted kind → [`StageLogic::on_rows`].
//! 4. EOF → count it; when the barrier fires, [`StageLogic::on_close`] flushes,
//!    an EOF goes to every downstream shard, and [`StageLogic::purge`] destroys
//!    the session's state.
//! 5. anything else is a [`StageError::ProtocolViolation`] and ends the run.
//!
//! Whatever way the loop ends, [`StageLogic::teardown`] runs and open sessions
//! are discarded. Nothing is persisted; a restart means re-running the upload.

mod barrier;
mod outputs;
mod session;

pub use barrier::{BarrierState, EofBarrier};
pub use outputs::{Output, Outputs, Routing};
pub use session::SessionStore;

use crate::error::{Result, StageError};
use crate::message::{Frame, Kind, Message, decode};
use crate::metrics::StageMetrics;
use crate::row::Row;
use crate::transport::{CancellationToken, Flow, Source};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Identity of one running stage instance.
#[derive(Clone, Debug)]
pub struct StageContext {
    pub stage: String,
    pub instance: usize,
    pub metrics: Arc<StageMetrics>,
}

impl StageContext {
    pub fn new(stage: impl Into<String>, instance: usize, metrics: Arc<StageMetrics>) -> Self {
        Self {
            stage: stage.into(),
            instance,
            metrics,
        }
    }

    /// `stage-instance`, as used for metrics and logs.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}-{}", self.stage, self.instance)
    }
}

/// What a single-input stage kind contributes to the runtime.
pub trait StageLogic: Send {
    /// A data batch for `session`.
    ///
    /// # Errors
    /// Transport failures from emitting, or a fatal stage condition.
    fn on_rows(&mut self, session: &str, rows: Vec<Row>, out: &mut Outputs) -> Result<()>;

    /// Every upstream producer finished `session`: flush what is held for it.
    /// The runtime sends the EOF afterwards.
    ///
    /// # Errors
    /// Transport failures from emitting.
    fn on_close(&mut self, session: &str, out: &mut Outputs) -> Result<()> {
        let _ = (session, out);
        Ok(())
    }

    /// Destroy every piece of state held for `session`.
    fn purge(&mut self, session: &str) {
        let _ = session;
    }

    /// Sessions currently holding state.
    fn open_sessions(&self) -> usize {
        0
    }

    /// Release everything; called once when the loop exits.
    fn teardown(&mut self) {}
}

/// Single-input stage driver.
pub struct StageRuntime<L> {
    ctx: StageContext,
    source: Source,
    accepts: Kind,
    barrier: EofBarrier,
    logic: L,
    outputs: Outputs,
}

impl<L: StageLogic> StageRuntime<L> {
    /// # Errors
    /// [`StageError::Config`] when `producers` is zero or `accepts` is EOF.
    pub fn new(
        ctx: StageContext,
        source: Source,
        accepts: Kind,
        producers: usize,
        logic: L,
        outputs: Outputs,
    ) -> Result<Self> {
        if !accepts.is_data() {
            return Err(StageError::config(format!(
                "stage `{}` cannot accept EOF as its input kind",
                ctx.stage
            )));
        }
        let barrier = EofBarrier::new(ctx.name(), producers)?;
        Ok(Self {
            ctx,
            source,
            accepts,
            barrier,
            logic,
            outputs,
        })
    }

    #[must_use]
    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    #[must_use]
    pub fn logic(&self) -> &L {
        &self.logic
    }

    #[must_use]
    pub fn barrier(&self) -> &EofBarrier {
        &self.barrier
    }

    /// Consume until cancelled or a fatal error, then tear down.
    ///
    /// # Errors
    /// [`StageError::ProtocolViolation`] or [`StageError::Transport`].
    pub fn run(mut self, cancel: &CancellationToken) -> Result<()> {
        let transport = self.outputs.transport();
        let source = self.source.clone();
        info!(stage = %self.ctx.name(), source = %source.pattern(), producers = self.barrier.expected(), "stage started");
        let result = transport.consume(&source, cancel, &mut |message| {
            self.dispatch(message, cancel)
        });
        self.teardown(&result);
        result
    }

    fn dispatch(&mut self, message: Message, cancel: &CancellationToken) -> Result<Flow> {
        if cancel.is_cancelled() {
            debug!(stage = %self.ctx.name(), "stop requested; message requeued unprocessed");
            self.outputs.transport().requeue(&self.source, message)?;
            return Ok(Flow::Stop);
        }
        match self.handle(message) {
            Ok(()) => Ok(Flow::Continue),
            Err(e) if !e.is_fatal() => {
                error!(stage = %self.ctx.name(), error = %e, "message rejected");
                self.ctx.metrics.add_rejected();
                Ok(Flow::Continue)
            }
            Err(e) => Err(e),
        }
    }

    /// Process one message.
    ///
    /// Public so stages can be driven without a broker loop.
    ///
    /// # Errors
    /// Any [`StageError`]; only [`StageError::Format`] is recoverable.
    pub fn handle(&mut self, message: Message) -> Result<()> {
        match decode(&message)? {
            Frame::Batch {
                kind,
                session,
                rows,
            } => {
                self.check_kind(kind, &session)?;
                if self.barrier.is_closed(&session) {
                    return Err(StageError::protocol(
                        self.ctx.name(),
                        format!("data for session `{session}` after its EOF barrier fired"),
                    ));
                }
                self.ctx.metrics.add_rows_in(rows.len());
                self.logic.on_rows(&session, rows, &mut self.outputs)
            }
            Frame::Eof { session, kind } => {
                self.check_kind(kind, &session)?;
                match self.barrier.observe(&session)? {
                    BarrierState::Open { seen, expected } => {
                        debug!(stage = %self.ctx.name(), session = %session, seen, expected, "EOF observed");
                        Ok(())
                    }
                    BarrierState::Fired => self.close_session(&session),
                }
            }
        }
    }

    fn check_kind(&self, kind: Kind, session: &str) -> Result<()> {
        if kind == self.accepts {
            Ok(())
        } else {
            Err(StageError::protocol(
                self.ctx.name(),
                format!(
                    "received {kind} for session `{session}`, this input accepts {}",
                    self.accepts
                ),
            ))
        }
    }

    fn close_session(&mut self, session: &str) -> Result<()> {
        self.logic.on_close(session, &mut self.outputs)?;
        self.outputs.emit_eof(session)?;
        self.logic.purge(session);
        self.ctx.metrics.add_session_closed();
        info!(stage = %self.ctx.name(), session = %session, "session closed");
        Ok(())
    }

    fn teardown(&mut self, result: &Result<()>) {
        let lost = self.logic.open_sessions();
        let pending = self.barrier.reset_open();
        self.logic.teardown();
        match result {
            Ok(()) => {
                info!(stage = %self.ctx.name(), lost_sessions = lost, pending_barriers = pending, "stage stopped");
            }
            Err(e) => {
                warn!(stage = %self.ctx.name(), error = %e, lost_sessions = lost, "stage torn down");
            }
        }
    }
}
