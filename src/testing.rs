//! Testing utilities for stageflow pipelines.
//!
//! This module provides a testing facility for end-users to write idiomatic
//! Rust tests for their topologies. It includes:
//!
//! - **Harness**: [`TestHarness`] runs a whole [`Topology`] on an in-process
//!   broker and hands back each session's results
//! - **Assertions**: compare rows ignoring field (and optionally row) order
//! - **Builders**: [`RowsBuilder`] for column-aligned test rows
//! - **Fixtures**: a hand-sized coffee-shop dataset with known answers
//! - **Mock I/O**: temporary CSV files and dataset directories
//!
//! # Quick Start
//!
//! ```no_run
//! use stageflow::config::PipelineConfig;
//! use stageflow::message::Kind;
//! use stageflow::queries::coffee_shop;
//! use stageflow::testing::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let harness = TestHarness::start(&coffee_shop(&PipelineConfig::default()))?;
//! let results = harness.run_session(coffee_shop_datasets())?;
//! assert_eq!(results.rows(Kind::Q1).len(), 3);
//! harness.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod assertions;
pub mod builders;
pub mod fixtures;

#[cfg(feature = "io-csv")]
pub mod mock_io;

// Re-export commonly used items
pub use assertions::*;
pub use builders::*;
pub use fixtures::*;

#[cfg(feature = "io-csv")]
pub use mock_io::*;

use crate::broker::MemoryBroker;
use crate::gateway::{QueryResults, ResultCollector, SessionGateway};
use crate::message::Kind;
use crate::metrics::MetricsRegistry;
use crate::row::Row;
use crate::runner::{Runner, RunningPipeline};
use crate::topology::Topology;
use crate::transport::{CancellationToken, Transport};
use anyhow::{Context, Result, anyhow};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A running topology on a private [`MemoryBroker`], with a gateway and a
/// result collector attached.
///
/// Dropping the harness cancels everything; [`shutdown`](Self::shutdown) also
/// waits for the threads and reports their errors.
pub struct TestHarness {
    broker: Arc<MemoryBroker>,
    gateway: SessionGateway,
    collector: Arc<ResultCollector>,
    metrics: MetricsRegistry,
    cancel: CancellationToken,
    pipeline: Option<RunningPipeline>,
    collector_thread: Option<JoinHandle<crate::Result<()>>>,
    timeout: Duration,
}

impl TestHarness {
    /// # Errors
    ///
    /// Returns an error if the topology is invalid or a thread cannot start.
    pub fn start(topology: &Topology) -> Result<Self> {
        let broker = Arc::new(MemoryBroker::new().with_poll_interval(Duration::from_millis(5)));
        let transport: Arc<dyn Transport> = broker.clone();
        let metrics = MetricsRegistry::new();
        let cancel = CancellationToken::new();

        let pipeline = Runner::new(Arc::clone(&transport), metrics.clone()).spawn(topology, &cancel)?;
        let gateway = SessionGateway::new(
            Arc::clone(&transport),
            topology.gateway_routes()?,
            topology.max_batch_size(),
            metrics.register("gateway-0"),
        )?;
        let collector = Arc::new(ResultCollector::new(
            transport,
            topology.results_source(),
            topology.expected_results(),
        )?);
        let collector_thread = {
            let collector = Arc::clone(&collector);
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("results".into())
                .spawn(move || collector.run(&cancel))
                .context("start result collector")?
        };
        Ok(Self {
            broker,
            gateway,
            collector,
            metrics,
            cancel,
            pipeline: Some(pipeline),
            collector_thread: Some(collector_thread),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    #[must_use]
    pub fn gateway(&self) -> &SessionGateway {
        &self.gateway
    }

    #[must_use]
    pub fn collector(&self) -> &ResultCollector {
        &self.collector
    }

    #[must_use]
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Upload `datasets` as one new session and wait for all its results.
    ///
    /// # Errors
    ///
    /// Returns an error if an upload fails or the results do not complete in time.
    pub fn run_session(&self, datasets: BTreeMap<Kind, Vec<Row>>) -> Result<QueryResults> {
        let session = self.gateway.open_session();
        self.gateway.upload_all(&session, datasets)?;
        self.wait_for(&session)
    }

    /// # Errors
    ///
    /// Returns an error if `session` does not complete in time.
    pub fn wait_for(&self, session: &str) -> Result<QueryResults> {
        let results = self
            .collector
            .wait_for(session, self.timeout)?
            .ok_or_else(|| anyhow!("session {session} did not complete within {:?}", self.timeout))?;
        self.gateway.close_session(session);
        Ok(results)
    }

    /// Cancel, then join every thread.
    ///
    /// # Errors
    ///
    /// Returns the first error any stage instance or the collector ended with.
    pub fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        let pipeline = self.pipeline.take().map_or(Ok(()), RunningPipeline::join);
        let collector = match self.collector_thread.take() {
            Some(h) => h.join().map_err(|_| anyhow!("result collector panicked"))?,
            None => Ok(()),
        };
        pipeline?;
        collector?;
        Ok(())
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
