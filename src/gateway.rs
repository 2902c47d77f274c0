//! The client boundary: open a session, upload datasets, collect results.
//!
//! [`SessionGateway`] is the producer at the head of the pipeline. For each
//! dataset kind it holds the resolved routes and sends batches plus one EOF per
//! route, so the first stages see exactly one gateway producer per route.
//!
//! [`ResultCollector`] drains the results queue, splits it by session and
//! declares a session complete once every result kind has delivered its
//! expected number of EOFs.

use crate::error::{Result, StageError};
use crate::message::{Frame, Kind, Message, decode};
use crate::metrics::StageMetrics;
use crate::row::Row;
use crate::runtime::{Output, Outputs, SessionStore};
use crate::transport::{CancellationToken, Flow, Source, Transport};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use uuid::Uuid;

const GATEWAY: &str = "gateway";

fn poisoned(what: &str) -> StageError {
    StageError::protocol(GATEWAY, format!("{what} lock poisoned"))
}

/* ===================== SessionGateway ===================== */

pub struct SessionGateway {
    routes: BTreeMap<Kind, Mutex<Outputs>>,
    finished: Mutex<HashSet<(String, Kind)>>,
    metrics: Arc<StageMetrics>,
}

impl SessionGateway {
    /// # Errors
    /// [`StageError::Config`] if a route carries a kind that is not a dataset.
    pub fn new(
        transport: Arc<dyn Transport>,
        routes: Vec<(Kind, Output)>,
        max_batch_size: usize,
        metrics: Arc<StageMetrics>,
    ) -> Result<Self> {
        let mut grouped: BTreeMap<Kind, Vec<Output>> = BTreeMap::new();
        for (kind, output) in routes {
            if !Kind::DATASETS.contains(&kind) {
                return Err(StageError::config(format!("gateway cannot route {kind}")));
            }
            grouped.entry(kind).or_default().push(output);
        }
        let routes = grouped
            .into_iter()
            .map(|(kind, outputs)| {
                let out = Outputs::new(
                    Arc::clone(&transport),
                    outputs,
                    max_batch_size,
                    0,
                    Arc::clone(&metrics),
                );
                (kind, Mutex::new(out))
            })
            .collect();
        Ok(Self {
            routes,
            finished: Mutex::new(HashSet::new()),
            metrics,
        })
    }

    /// Fresh session id.
    #[must_use]
    pub fn open_session(&self) -> String {
        let id = Uuid::new_v4().to_string();
        debug!(session = %id, "session opened");
        id
    }

    /// Kinds this gateway can accept.
    pub fn kinds(&self) -> impl Iterator<Item = Kind> + '_ {
        self.routes.keys().copied()
    }

    fn outputs(&self, kind: Kind) -> Result<MutexGuard<'_, Outputs>> {
        self.routes
            .get(&kind)
            .ok_or_else(|| StageError::protocol(GATEWAY, format!("no route for {kind}")))?
            .lock()
            .map_err(|_| poisoned("route"))
    }

    fn is_finished(&self, session: &str, kind: Kind) -> Result<bool> {
        let finished = self.finished.lock().map_err(|_| poisoned("finished-set"))?;
        Ok(finished.contains(&(session.to_string(), kind)))
    }

    /// Send rows of `kind` for `session`, in batches of at most the configured size.
    ///
    /// # Errors
    /// [`StageError::ProtocolViolation`] for an unrouted kind or an upload after
    /// [`finish`](Self::finish); transport failures.
    pub fn upload(&self, session: &str, kind: Kind, rows: Vec<Row>) -> Result<()> {
        if self.is_finished(session, kind)? {
            return Err(StageError::protocol(
                GATEWAY,
                format!("{kind} upload for session `{session}` after it was finished"),
            ));
        }
        self.metrics.add_rows_in(rows.len());
        self.outputs(kind)?.emit(session, rows)
    }

    /// Mark `kind` complete for `session`: EOF to every shard of every route.
    ///
    /// # Errors
    /// [`StageError::ProtocolViolation`] if already finished; transport failures.
    pub fn finish(&self, session: &str, kind: Kind) -> Result<()> {
        {
            let mut finished = self.finished.lock().map_err(|_| poisoned("finished-set"))?;
            if !finished.insert((session.to_string(), kind)) {
                return Err(StageError::protocol(
                    GATEWAY,
                    format!("{kind} already finished for session `{session}`"),
                ));
            }
        }
        self.outputs(kind)?.emit_eof(session)?;
        debug!(session, %kind, "upload finished");
        Ok(())
    }

    /// Finish every routed kind not finished yet.
    ///
    /// # Errors
    /// Transport failures.
    pub fn finish_all(&self, session: &str) -> Result<()> {
        for kind in self.routes.keys().copied() {
            if !self.is_finished(session, kind)? {
                self.finish(session, kind)?;
            }
        }
        Ok(())
    }

    /// Upload every dataset in `datasets`, finishing each, then finish the
    /// kinds that had no data.
    ///
    /// # Errors
    /// As for [`upload`](Self::upload) and [`finish`](Self::finish).
    pub fn upload_all(&self, session: &str, datasets: BTreeMap<Kind, Vec<Row>>) -> Result<()> {
        for (kind, rows) in datasets {
            self.upload(session, kind, rows)?;
            self.finish(session, kind)?;
        }
        self.finish_all(session)
    }

    /// Forget the finished marks of `session`.
    pub fn close_session(&self, session: &str) {
        if let Ok(mut finished) = self.finished.lock() {
            finished.retain(|(s, _)| s != session);
        }
    }
}

/* ===================== ResultCollector ===================== */

/// Everything a session produced, by result kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryResults {
    pub session: String,
    pub results: BTreeMap<Kind, Vec<Row>>,
}

impl QueryResults {
    #[must_use]
    pub fn rows(&self, kind: Kind) -> &[Row] {
        self.results.get(&kind).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.results.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Default)]
struct Pending {
    results: BTreeMap<Kind, Vec<Row>>,
    eofs: BTreeMap<Kind, usize>,
}

struct CollectorState {
    sessions: SessionStore<Pending>,
    parked: HashMap<String, QueryResults>,
    completed: HashSet<String>,
    listeners: Vec<Sender<QueryResults>>,
}

/// Demultiplexes the results queue by session.
pub struct ResultCollector {
    transport: Arc<dyn Transport>,
    source: Source,
    expected: BTreeMap<Kind, usize>,
    state: Mutex<CollectorState>,
    ready: Condvar,
}

impl ResultCollector {
    /// `expected` maps each result kind to the EOFs it must see per session.
    ///
    /// # Errors
    /// [`StageError::Config`] if `expected` is empty, names a non-result kind,
    /// or expects zero EOFs.
    pub fn new(transport: Arc<dyn Transport>, source: Source, expected: BTreeMap<Kind, usize>) -> Result<Self> {
        if expected.is_empty() {
            return Err(StageError::config("result collector expects no results"));
        }
        if let Some((kind, n)) = expected.iter().find(|(k, n)| !k.is_result() || **n == 0) {
            return Err(StageError::config(format!("cannot expect {n} EOF(s) of {kind}")));
        }
        Ok(Self {
            transport,
            source,
            expected,
            state: Mutex::new(CollectorState {
                sessions: SessionStore::new(),
                parked: HashMap::new(),
                completed: HashSet::new(),
                listeners: Vec::new(),
            }),
            ready: Condvar::new(),
        })
    }

    /// A feed of sessions completing from now on, in completion order.
    ///
    /// Each receiver gets its own copy. Results also stay parked until a
    /// [`wait_for`](Self::wait_for) claims them.
    ///
    /// # Errors
    /// [`StageError::ProtocolViolation`] if the collector state is poisoned.
    pub fn completed(&self) -> Result<Receiver<QueryResults>> {
        let (tx, rx) = unbounded();
        self.lock()?.listeners.push(tx);
        Ok(rx)
    }

    fn lock(&self) -> Result<MutexGuard<'_, CollectorState>> {
        self.state.lock().map_err(|_| poisoned("collector"))
    }

    /// Consume results until cancelled.
    ///
    /// # Errors
    /// A protocol violation on the results queue, or a transport failure.
    pub fn run(&self, cancel: &CancellationToken) -> Result<()> {
        info!(source = %self.source.pattern(), "collecting results");
        self.transport.consume(&self.source, cancel, &mut |message| {
            if cancel.is_cancelled() {
                self.transport.requeue(&self.source, message)?;
                return Ok(Flow::Stop);
            }
            match self.handle(message) {
                Err(e) if !e.is_fatal() => {
                    error!(error = %e, "result message rejected");
                    Ok(Flow::Continue)
                }
                other => other.map(|()| Flow::Continue),
            }
        })
    }

    /// Process one result message.
    ///
    /// # Errors
    /// [`StageError::Format`] for an undecodable message,
    /// [`StageError::ProtocolViolation`] for an unexpected kind, extra EOFs or
    /// data after completion.
    pub fn handle(&self, message: Message) -> Result<()> {
        let frame = decode(&message)?;
        let session = frame.session().to_string();
        let kind = match &frame {
            Frame::Batch { kind, .. } | Frame::Eof { kind, .. } => *kind,
        };
        let Some(&expected) = self.expected.get(&kind) else {
            return Err(StageError::protocol(GATEWAY, format!("unexpected result kind {kind}")));
        };
        let mut state = self.lock()?;
        if state.completed.contains(&session) {
            return Err(StageError::protocol(
                GATEWAY,
                format!("{kind} for session `{session}` after it completed"),
            ));
        }
        let pending = state.sessions.touch(&session);
        match frame {
            Frame::Batch { rows, .. } => {
                pending.results.entry(kind).or_default().extend(rows);
                Ok(())
            }
            Frame::Eof { .. } => {
                let seen = pending.eofs.entry(kind).or_default();
                *seen += 1;
                if *seen > expected {
                    return Err(StageError::protocol(
                        GATEWAY,
                        format!("{seen} EOFs of {kind} for session `{session}`, expected {expected}"),
                    ));
                }
                let done = self
                    .expected
                    .iter()
                    .all(|(k, n)| pending.eofs.get(k).copied().unwrap_or(0) == *n);
                if done {
                    let Pending { results, .. } = state.sessions.take(&session).unwrap_or_default();
                    state.completed.insert(session.clone());
                    let total: usize = results.values().map(Vec::len).sum();
                    info!(session = %session, rows = total, "session complete");
                    let done = QueryResults { session, results };
                    state.listeners.retain(|tx| tx.send(done.clone()).is_ok());
                    state.parked.insert(done.session.clone(), done);
                    self.ready.notify_all();
                }
                Ok(())
            }
        }
    }

    /// Block until `session` completes or `timeout` passes.
    ///
    /// Any number of threads may wait at once, each for its own session.
    ///
    /// # Errors
    /// [`StageError::ProtocolViolation`] if the collector state is poisoned.
    pub fn wait_for(&self, session: &str, timeout: Duration) -> Result<Option<QueryResults>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;
        loop {
            if let Some(done) = state.parked.remove(session) {
                return Ok(Some(done));
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            state = self
                .ready
                .wait_timeout(state, left)
                .map_err(|_| poisoned("collector"))?
                .0;
        }
    }

    /// Sessions with results still arriving.
    ///
    /// # Errors
    /// [`StageError::ProtocolViolation`] if the collector state is poisoned.
    pub fn open_sessions(&self) -> Result<usize> {
        Ok(self.lock()?.sessions.len())
    }
}
