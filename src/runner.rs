//! Launching a [`Topology`]: one named thread per stage instance.
//!
//! [`Runner::spawn`] validates the topology and declares every queue before
//! the first thread starts, so no instance can publish into an undeclared
//! queue. The returned [`RunningPipeline`] stops all instances together and
//! reports the first failure on [`RunningPipeline::join`].

use crate::error::{Result, StageError};
use crate::metrics::MetricsRegistry;
use crate::runtime::{Outputs, StageContext, StageLogic, StageRuntime};
use crate::stages::{JoinInput, KeyedReducer, TopKSorter, TwoStreamJoiner};
use crate::topology::{StageKind, StageSpec, Topology};
use crate::transport::{CancellationToken, Transport};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// Starts every stage instance of a [`Topology`] on its own thread.
///
/// One thread per instance stands in for one process per instance: instances
/// share nothing but the transport and the metrics registry.
pub struct Runner {
    transport: Arc<dyn Transport>,
    metrics: MetricsRegistry,
}

impl Runner {
    pub fn new(transport: Arc<dyn Transport>, metrics: MetricsRegistry) -> Self {
        Self { transport, metrics }
    }

    #[must_use]
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Validate, declare every queue, then launch.
    ///
    /// `cancel` stops the pipeline; so does [`RunningPipeline::stop`], which
    /// leaves `cancel` itself untouched.
    ///
    /// # Errors
    /// [`StageError::Config`] for an invalid topology, [`StageError::Transport`]
    /// if declaring fails. Nothing is started in either case.
    pub fn spawn(&self, topology: &Topology, cancel: &CancellationToken) -> Result<RunningPipeline> {
        topology.validate()?;
        topology.declare(self.transport.as_ref())?;
        let cancel = cancel.child_token();
        let mut handles = Vec::with_capacity(topology.instance_count());
        for stage in topology.stages() {
            for instance in 0..stage.instances {
                let handle = self.launch(topology, stage, instance, &cancel);
                match handle {
                    Ok(h) => handles.push(h),
                    Err(e) => {
                        // already-running instances must not outlive a failed start
                        cancel.cancel();
                        RunningPipeline { handles, cancel }.join().ok();
                        return Err(e);
                    }
                }
            }
        }
        self.metrics.record_start();
        info!(stages = topology.stages().len(), instances = handles.len(), "pipeline started");
        Ok(RunningPipeline { handles, cancel })
    }

    fn launch(
        &self,
        topology: &Topology,
        stage: &StageSpec,
        instance: usize,
        cancel: &CancellationToken,
    ) -> Result<(String, JoinHandle<Result<()>>)> {
        let metrics = self.metrics.register(format!("{}-{instance}", stage.name));
        let ctx = StageContext::new(stage.name.clone(), instance, Arc::clone(&metrics));
        let outputs = stage
            .outputs
            .iter()
            .map(|o| topology.resolve(o))
            .collect::<Result<Vec<_>>>()?;
        let outputs = Outputs::new(
            Arc::clone(&self.transport),
            outputs,
            topology.max_batch_size(),
            instance,
            metrics,
        );
        let name = ctx.name();
        let cancel = cancel.clone();

        let body: Box<dyn FnOnce() -> Result<()> + Send> = match &stage.kind {
            StageKind::Join(spec) => {
                let side = |i: usize| {
                    let input = &stage.inputs[i];
                    JoinInput::new(stage.source(input, instance), input.kind, topology.producers(stage, input))
                };
                let joiner = TwoStreamJoiner::new(ctx, spec.clone(), side(0), side(1), outputs)?;
                Box::new(move || joiner.run(&cancel))
            }
            StageKind::Transform(t) => single(topology, stage, instance, ctx, t.clone(), outputs, cancel)?,
            StageKind::Reduce { key_fields, combiner } => {
                let logic = KeyedReducer::new(key_fields.clone(), Arc::clone(combiner));
                single(topology, stage, instance, ctx, logic, outputs, cancel)?
            }
            StageKind::TopK {
                group_by,
                primary,
                secondary,
                k,
            } => {
                let logic = TopKSorter::new(group_by.clone(), primary.clone(), secondary.clone(), *k);
                single(topology, stage, instance, ctx, logic, outputs, cancel)?
            }
        };

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|e| StageError::transport(format!("cannot start `{name}`: {e}")))?;
        Ok((name, handle))
    }
}

fn single<L: StageLogic + 'static>(
    topology: &Topology,
    stage: &StageSpec,
    instance: usize,
    ctx: StageContext,
    logic: L,
    outputs: Outputs,
    cancel: CancellationToken,
) -> Result<Box<dyn FnOnce() -> Result<()> + Send>> {
    let input = &stage.inputs[0];
    let runtime = StageRuntime::new(
        ctx,
        stage.source(input, instance),
        input.kind,
        topology.producers(stage, input),
        logic,
        outputs,
    )?;
    Ok(Box::new(move || runtime.run(&cancel)))
}

/// Handles of a launched pipeline.
pub struct RunningPipeline {
    handles: Vec<(String, JoinHandle<Result<()>>)>,
    cancel: CancellationToken,
}

impl RunningPipeline {
    /// Ask every instance to stop after its current message.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn instances(&self) -> usize {
        self.handles.len()
    }

    /// Instances whose thread has exited.
    #[must_use]
    pub fn finished(&self) -> usize {
        self.handles.iter().filter(|(_, h)| h.is_finished()).count()
    }

    /// Wait for every instance. All are joined even if one failed.
    ///
    /// # Errors
    /// The first failure, in launch order.
    pub fn join(self) -> Result<()> {
        let mut first = None;
        for (name, handle) in self.handles {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(StageError::protocol(name.clone(), "instance panicked")));
            if let Err(e) = result {
                error!(instance = %name, error = %e, "instance failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}
