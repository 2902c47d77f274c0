//! # Stageflow
//!
//! A **session-synchronized dataflow framework**: analytical queries run as
//! chains of independent stage workers (filter, reduce, top-K, join) that talk
//! only through a message broker. Many client sessions share the same workers;
//! each session's data stays isolated and each stage finalizes a session only
//! once every upstream producer has declared that session complete.
//!
//! ## Key Features
//!
//! - **Four stage kinds** - transform, keyed reduce, bounded top-K, two-stream join
//! - **EOF barriers** - per-session completion counting, fired exactly once
//! - **Deterministic sharding** - numeric or hashed keys, stable across producers
//! - **Queries as data** - a [`Topology`] lists stages, instance counts and wiring
//! - **Session-scoped state** - created on first row, destroyed when the barrier fires
//! - **Cooperative shutdown** - a [`CancellationToken`] checked between messages
//! - **In-process broker** - run and test whole pipelines in one process
//! - **CSV I/O** - datasets in, results out (feature `io-csv`)
//!
//! ## Quick Start
//!
//! ```no_run
//! use stageflow::config::PipelineConfig;
//! use stageflow::message::Kind;
//! use stageflow::queries::coffee_shop;
//! use stageflow::testing::{TestHarness, coffee_shop_datasets};
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let topology = coffee_shop(&PipelineConfig::default());
//! let harness = TestHarness::start(&topology)?;
//!
//! let results = harness.run_session(coffee_shop_datasets())?;
//! for row in results.rows(Kind::Q3) {
//!     println!("{row:?}");
//! }
//! harness.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Messages
//!
//! Everything on the wire is a [`Message`]: a 3-character [`Kind`] code and a
//! bracketed JSON array whose first element is the session id. A batch carries
//! [`Row`]s; an `EOF` carries the kind it terminates. See [`message`].
//!
//! ### Stages
//!
//! A stage instance consumes one queue (two for a join), does its work per
//! session and emits to its [`Outputs`]. The per-kind behaviour is a small
//! value ([`TransformStage`], [`KeyedReducer`], [`TopKSorter`]) plugged into
//! one generic [`StageRuntime`]; the [`TwoStreamJoiner`] drives its own two
//! loops around a single lock.
//!
//! ### Barriers
//!
//! Every producer sends exactly one EOF per session to every shard it feeds.
//! A stage input's [`EofBarrier`] fires when it has heard from all of them;
//! the stage then flushes, forwards one EOF per downstream shard and purges
//! the session. A second EOF for a fired session is a
//! [`StageError::ProtocolViolation`].
//!
//! ### Errors
//!
//! - [`StageError::Format`] - bad message; rejected, the loop goes on
//! - [`StageError::ProtocolViolation`] - broken stage state machine; the instance stops
//! - [`StageError::Transport`] - broker unusable; the run stops
//! - [`StageError::Config`] - invalid topology or settings; nothing starts
//!
//! Rows without a usable key or without a join partner are dropped with a
//! `tracing` warning and counted in [`metrics`]; they are never errors.
//!
//! ## Module Overview
//!
//! - [`message`], [`row`] - envelope codec and the row type
//! - [`partition`] - key → shard mapping
//! - [`transport`], [`broker`] - broker seam and the in-process implementation
//! - [`runtime`] - stage lifecycle, barriers, session store, outputs
//! - [`stages`] - the four stage kinds; [`combiners`] - their folding pieces
//! - [`topology`], [`runner`], [`queries`] - wiring, launching, the coffee-shop queries
//! - [`gateway`] - client boundary: uploads in, results out
//! - [`config`], [`metrics`], [`io`], [`testing`]

pub mod broker;
pub mod combiners;
pub mod config;
pub mod error;
pub mod gateway;
pub mod io;
pub mod message;
pub mod metrics;
pub mod partition;
pub mod queries;
pub mod row;
pub mod runner;
pub mod runtime;
pub mod stages;
pub mod testing;
pub mod topology;
pub mod transport;

// General re-exports
pub use broker::MemoryBroker;
pub use error::{Result, StageError};
pub use gateway::{QueryResults, ResultCollector, SessionGateway};
pub use message::{Frame, Kind, Message};
pub use metrics::{MetricsRegistry, StageMetrics};
pub use partition::{Partitioner, ShardKey};
pub use row::Row;
pub use runner::{Runner, RunningPipeline};
pub use runtime::{EofBarrier, Output, Outputs, SessionStore, StageContext, StageLogic, StageRuntime};
pub use stages::{KeyedReducer, TopKSorter, TransformStage, TwoStreamJoiner};
pub use topology::{StageSpec, Topology};
pub use transport::{CancellationToken, Destination, Source, Transport};

// Gated re-exports
#[cfg(feature = "io-csv")]
pub use io::csv::{read_rows, write_rows};
