//! In-process [`Transport`] built on `crossbeam-channel`.
//!
//! Every named queue is an unbounded MPMC channel. A topic subscription
//! ([`Source::Topic`]) is a private queue bound to `prefix.*`; publishing to any
//! `prefix.<key>` address copies the message into every bound queue.
//!
//! Queues must be declared before anything is published to them. The runner
//! declares every stage source before it starts a single worker, which is what
//! a real deployment does with its broker topology as well.
//!
//! Besides running whole pipelines in one process, the broker doubles as a
//! test probe: [`MemoryBroker::drain`] empties a queue without a consumer and
//! [`MemoryBroker::close`] simulates a lost connection. A message handed back
//! with [`Transport::requeue`] goes to the back of its queue.

use crate::error::{Result, StageError};
use crate::message::Message;
use crate::transport::{CancellationToken, Flow, Source, Transport};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};

const DEFAULT_POLL: Duration = Duration::from_millis(20);

#[derive(Clone)]
struct Queue {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

#[derive(Default)]
struct BrokerInner {
    queues: HashMap<String, Queue>,
    /// topic prefix -> subscriber queue names
    bindings: HashMap<String, Vec<String>>,
    closed: bool,
}

/// Unbounded in-memory queues and topic bindings.
pub struct MemoryBroker {
    inner: Mutex<BrokerInner>,
    poll: Duration,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BrokerInner::default()),
            poll: DEFAULT_POLL,
        }
    }

    /// How often an idle consumer re-checks cancellation.
    #[must_use]
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerInner>> {
        self.inner
            .lock()
            .map_err(|_| StageError::transport("broker state poisoned"))
    }

    /// Take every message currently queued on `queue`, without a consumer.
    ///
    /// # Errors
    /// If the queue was never declared.
    pub fn drain(&self, queue: &str) -> Result<Vec<Message>> {
        let rx = self.receiver(queue)?;
        Ok(rx.try_iter().collect())
    }

    /// Number of messages waiting on `queue`; zero for unknown queues.
    #[must_use]
    pub fn pending(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .ok()
            .and_then(|g| g.queues.get(queue).map(|q| q.rx.len()))
            .unwrap_or(0)
    }

    /// Every declared queue name, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .lock()
            .map(|g| g.queues.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Make every further send and every idle consumer fail.
    pub fn close(&self) {
        if let Ok(mut g) = self.inner.lock() {
            g.closed = true;
        }
    }

    fn receiver(&self, queue: &str) -> Result<Receiver<Message>> {
        let g = self.lock()?;
        g.queues
            .get(queue)
            .map(|q| q.rx.clone())
            .ok_or_else(|| StageError::transport(format!("unknown queue `{queue}`")))
    }
}

impl Transport for MemoryBroker {
    fn declare(&self, source: &Source) -> Result<()> {
        let mut g = self.lock()?;
        if g.closed {
            return Err(StageError::transport("broker closed"));
        }
        let name = source.queue_name();
        g.queues.entry(name.clone()).or_insert_with(Queue::new);
        if let Source::Topic { prefix, .. } = source {
            let bound = g.bindings.entry(prefix.clone()).or_default();
            if !bound.contains(&name) {
                debug!(queue = %name, pattern = %source.pattern(), "bound subscriber");
                bound.push(name);
            }
        }
        Ok(())
    }

    fn send(&self, address: &str, message: Message) -> Result<()> {
        let g = self.lock()?;
        if g.closed {
            return Err(StageError::transport("broker closed"));
        }
        if let Some(q) = g.queues.get(address) {
            trace!(address, bytes = message.len(), "send");
            return q
                .tx
                .send(message)
                .map_err(|_| StageError::transport(format!("queue `{address}` disconnected")));
        }
        let Some((prefix, _routing_key)) = address.rsplit_once('.') else {
            return Err(StageError::transport(format!("unknown address `{address}`")));
        };
        let Some(bound) = g.bindings.get(prefix) else {
            return Err(StageError::transport(format!(
                "no topic bound for `{address}`"
            )));
        };
        for name in bound {
            if let Some(q) = g.queues.get(name) {
                q.tx.send(message.clone()).map_err(|_| {
                    StageError::transport(format!("queue `{name}` disconnected"))
                })?;
            }
        }
        Ok(())
    }

    fn requeue(&self, source: &Source, message: Message) -> Result<()> {
        let g = self.lock()?;
        if g.closed {
            return Err(StageError::transport("broker closed"));
        }
        let name = source.queue_name();
        let q = g
            .queues
            .get(&name)
            .ok_or_else(|| StageError::transport(format!("unknown queue `{name}`")))?;
        debug!(queue = %name, "requeue");
        q.tx.send(message)
            .map_err(|_| StageError::transport(format!("queue `{name}` disconnected")))
    }

    fn consume(
        &self,
        source: &Source,
        cancel: &CancellationToken,
        handler: &mut dyn FnMut(Message) -> Result<Flow>,
    ) -> Result<()> {
        self.declare(source)?;
        let rx = self.receiver(&source.queue_name())?;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match rx.recv_timeout(self.poll) {
                Ok(message) => {
                    if handler(message)? == Flow::Stop {
                        return Ok(());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.lock()?.closed {
                        return Err(StageError::transport("broker closed"));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(StageError::transport(format!(
                        "queue `{}` disconnected",
                        source.queue_name()
                    )));
                }
            }
        }
    }
}
