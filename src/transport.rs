//! What the stages need from a message broker, and nothing more.
//!
//! The core only sends an encoded [`Message`] to an address and consumes from a
//! [`Source`] until told to stop. Connection management, acknowledgement and
//! persistence belong to the implementation ([`MemoryBroker`](crate::broker::MemoryBroker)
//! is the in-process one).
//!
//! # Addressing
//!
//! A logical [`Destination`] resolves to concrete addresses at configuration
//! time:
//!
//! - [`Destination::Queue`]: one work queue per downstream shard, `prefix-N`.
//! - [`Destination::Topic`]: a broadcast feed. Producers publish to
//!   `prefix.<routing-key>` and every subscriber receives everything through a
//!   wildcard binding `prefix.*`.

use crate::error::Result;
use crate::message::Message;
use std::sync::Arc;

/// Cooperative stop request, checked between messages.
///
/// Signal handlers only ever call `cancel()`; consume loops poll
/// `is_cancelled()` and tear themselves down. Stages that own several loops
/// hand them a `child_token()` so one failing loop stops its siblings without
/// touching the rest of the pipeline.
pub use tokio_util::sync::CancellationToken;

/// Where a stage sends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Queue { prefix: String, shards: usize },
    Topic { prefix: String },
}

impl Destination {
    pub fn queue(prefix: impl Into<String>, shards: usize) -> Self {
        Self::Queue {
            prefix: prefix.into(),
            shards,
        }
    }

    pub fn topic(prefix: impl Into<String>) -> Self {
        Self::Topic {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        match self {
            Self::Queue { prefix, .. } | Self::Topic { prefix } => prefix,
        }
    }

    /// Number of distinct addresses a broadcast must reach.
    ///
    /// A topic is a single publish regardless of its subscriber count.
    #[must_use]
    pub fn fan_out(&self) -> usize {
        match self {
            Self::Queue { shards, .. } => *shards,
            Self::Topic { .. } => 1,
        }
    }

    /// Concrete address of `shard`; for a topic `shard` is the routing key.
    #[must_use]
    pub fn address(&self, shard: usize) -> String {
        match self {
            Self::Queue { prefix, .. } => queue_name(prefix, shard),
            Self::Topic { prefix } => format!("{prefix}.{shard}"),
        }
    }
}

/// Where a stage instance consumes from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Source {
    /// A single work queue, normally `prefix-N` of some [`Destination::Queue`].
    Queue { name: String },
    /// A private queue bound to `prefix.*`.
    Topic { prefix: String, subscriber: String },
}

impl Source {
    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue { name: name.into() }
    }

    /// Shard `shard` of the work queues named by `prefix`.
    pub fn shard(prefix: &str, shard: usize) -> Self {
        Self::Queue {
            name: queue_name(prefix, shard),
        }
    }

    pub fn topic(prefix: impl Into<String>, subscriber: impl Into<String>) -> Self {
        Self::Topic {
            prefix: prefix.into(),
            subscriber: subscriber.into(),
        }
    }

    /// Name of the queue actually drained.
    #[must_use]
    pub fn queue_name(&self) -> String {
        match self {
            Self::Queue { name } => name.clone(),
            Self::Topic { prefix, subscriber } => format!("{prefix}.*@{subscriber}"),
        }
    }

    /// Binding pattern, for logs.
    #[must_use]
    pub fn pattern(&self) -> String {
        match self {
            Self::Queue { name } => name.clone(),
            Self::Topic { prefix, .. } => format!("{prefix}.*"),
        }
    }
}

#[must_use]
pub fn queue_name(prefix: &str, shard: usize) -> String {
    format!("{prefix}-{shard}")
}

/// Handler verdict for one delivered message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// The broker seam.
pub trait Transport: Send + Sync {
    /// Make sure `source` exists before anyone publishes to it.
    ///
    /// # Errors
    /// [`StageError::Transport`](crate::StageError::Transport) if the broker is unusable.
    fn declare(&self, source: &Source) -> Result<()>;

    /// # Errors
    /// [`StageError::Transport`](crate::StageError::Transport) if `address`
    /// cannot be reached.
    fn send(&self, address: &str, message: Message) -> Result<()>;

    /// Hand an unprocessed message back to `source`, behind whatever is
    /// already queued there.
    ///
    /// # Errors
    /// [`StageError::Transport`](crate::StageError::Transport) if `source`
    /// is unknown or the broker is unusable.
    fn requeue(&self, source: &Source, message: Message) -> Result<()>;

    /// Deliver messages from `source` to `handler` in FIFO order until the
    /// handler returns [`Flow::Stop`], `cancel` fires, or the handler fails.
    ///
    /// # Errors
    /// The first handler error, or a transport failure.
    fn consume(
        &self,
        source: &Source,
        cancel: &CancellationToken,
        handler: &mut dyn FnMut(Message) -> Result<Flow>,
    ) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn declare(&self, source: &Source) -> Result<()> {
        (**self).declare(source)
    }

    fn send(&self, address: &str, message: Message) -> Result<()> {
        (**self).send(address, message)
    }

    fn requeue(&self, source: &Source, message: Message) -> Result<()> {
        (**self).requeue(source, message)
    }

    fn consume(
        &self,
        source: &Source,
        cancel: &CancellationToken,
        handler: &mut dyn FnMut(Message) -> Result<Flow>,
    ) -> Result<()> {
        (**self).consume(source, cancel, handler)
    }
}
