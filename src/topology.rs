//! Pipelines as data: which stages exist, how many instances each runs, and
//! who feeds whom.
//!
//! A [`Topology`] is a list of [`StageSpec`]s plus the gateway's entry routes.
//! It is the single place that knows the wiring, so it is also where the
//! EOF arithmetic happens: the number of producers a stage input must hear
//! an EOF from is the sum of instances of every stage (or gateway route)
//! whose outputs target that input.
//!
//! Addressing conventions:
//!
//! - a stage's work queues are named after the stage: `<name>-<instance>`;
//! - a topic input of instance `i` is a private queue bound to `<prefix>.*`
//!   with subscriber id `<name>-<i>`;
//! - results go to the single queue `<results_queue>-0`.

use crate::combiners::RowCombiner;
use crate::error::{Result, StageError};
use crate::message::Kind;
use crate::partition::ShardKey;
use crate::runtime::Output;
use crate::stages::{JoinSpec, TransformStage};
use crate::transport::{Destination, Source, Transport};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// What a stage does, as plain parameters.
#[derive(Clone)]
pub enum StageKind {
    Transform(TransformStage),
    Reduce {
        key_fields: Vec<String>,
        combiner: Arc<dyn RowCombiner>,
    },
    TopK {
        group_by: Vec<String>,
        primary: String,
        secondary: String,
        k: usize,
    },
    /// Inputs are `[base, stream]`.
    Join(JoinSpec),
}

impl StageKind {
    fn arity(&self) -> usize {
        match self {
            Self::Join(_) => 2,
            _ => 1,
        }
    }
}

impl fmt::Debug for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transform(t) => f.debug_tuple("Transform").field(&t.steps().len()).finish(),
            Self::Reduce { key_fields, combiner } => f
                .debug_struct("Reduce")
                .field("key_fields", key_fields)
                .field("output", &combiner.output_field())
                .finish(),
            Self::TopK {
                group_by,
                primary,
                secondary,
                k,
            } => f
                .debug_struct("TopK")
                .field("group_by", group_by)
                .field("primary", primary)
                .field("secondary", secondary)
                .field("k", k)
                .finish(),
            Self::Join(spec) => f.debug_tuple("Join").field(spec).finish(),
        }
    }
}

/// Where an input reads from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Feed {
    /// The stage's own sharded work queues.
    Queue,
    /// Every message published under the prefix.
    Topic(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputSpec {
    pub feed: Feed,
    pub kind: Kind,
}

impl InputSpec {
    #[must_use]
    pub fn queue(kind: Kind) -> Self {
        Self {
            feed: Feed::Queue,
            kind,
        }
    }

    pub fn topic(prefix: impl Into<String>, kind: Kind) -> Self {
        Self {
            feed: Feed::Topic(prefix.into()),
            kind,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// Work queues of the named stage.
    Stage(String),
    Topic(String),
    Results,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteBy {
    Broadcast,
    RoundRobin,
    Key(String, ShardKey),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputSpec {
    pub target: Target,
    pub kind: Kind,
    pub route: RouteBy,
}

impl OutputSpec {
    pub fn to_stage(stage: impl Into<String>, kind: Kind, route: RouteBy) -> Self {
        Self {
            target: Target::Stage(stage.into()),
            kind,
            route,
        }
    }

    /// Publish to a broadcast topic.
    pub fn to_topic(prefix: impl Into<String>, kind: Kind) -> Self {
        Self {
            target: Target::Topic(prefix.into()),
            kind,
            route: RouteBy::Broadcast,
        }
    }

    #[must_use]
    pub fn to_results(kind: Kind) -> Self {
        Self {
            target: Target::Results,
            kind,
            route: RouteBy::RoundRobin,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StageSpec {
    pub name: String,
    pub instances: usize,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    pub kind: StageKind,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, instances: usize, inputs: Vec<InputSpec>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            instances,
            inputs,
            outputs: Vec::new(),
            kind,
        }
    }

    pub fn transform(name: impl Into<String>, instances: usize, input: Kind, stage: TransformStage) -> Self {
        Self::new(name, instances, vec![InputSpec::queue(input)], StageKind::Transform(stage))
    }

    pub fn reduce<S: Into<String>>(
        name: impl Into<String>,
        instances: usize,
        input: Kind,
        key_fields: impl IntoIterator<Item = S>,
        combiner: Arc<dyn RowCombiner>,
    ) -> Self {
        let kind = StageKind::Reduce {
            key_fields: key_fields.into_iter().map(Into::into).collect(),
            combiner,
        };
        Self::new(name, instances, vec![InputSpec::queue(input)], kind)
    }

    pub fn top_k<S: Into<String>>(
        name: impl Into<String>,
        instances: usize,
        input: Kind,
        group_by: impl IntoIterator<Item = S>,
        order_by: (&str, &str),
        k: usize,
    ) -> Self {
        let kind = StageKind::TopK {
            group_by: group_by.into_iter().map(Into::into).collect(),
            primary: order_by.0.to_string(),
            secondary: order_by.1.to_string(),
            k,
        };
        Self::new(name, instances, vec![InputSpec::queue(input)], kind)
    }

    /// The stream side reads the stage's own queues.
    pub fn join(name: impl Into<String>, instances: usize, base: InputSpec, stream: Kind, spec: JoinSpec) -> Self {
        Self::new(name, instances, vec![base, InputSpec::queue(stream)], StageKind::Join(spec))
    }

    #[must_use]
    pub fn to(mut self, output: OutputSpec) -> Self {
        self.outputs.push(output);
        self
    }

    /// Source instance `instance` consumes for `input`.
    #[must_use]
    pub fn source(&self, input: &InputSpec, instance: usize) -> Source {
        match &input.feed {
            Feed::Queue => Source::shard(&self.name, instance),
            Feed::Topic(prefix) => Source::topic(prefix.clone(), format!("{}-{instance}", self.name)),
        }
    }

    fn queue_input(&self) -> Option<&InputSpec> {
        self.inputs.iter().find(|i| i.feed == Feed::Queue)
    }
}

/// The whole wiring of one pipeline.
#[derive(Clone, Debug)]
pub struct Topology {
    stages: Vec<StageSpec>,
    routes: Vec<(Kind, OutputSpec)>,
    results_queue: String,
    max_batch_size: usize,
}

impl Topology {
    pub fn new(results_queue: impl Into<String>, max_batch_size: usize) -> Self {
        Self {
            stages: Vec::new(),
            routes: Vec::new(),
            results_queue: results_queue.into(),
            max_batch_size,
        }
    }

    #[must_use]
    pub fn stage(mut self, spec: StageSpec) -> Self {
        self.stages.push(spec);
        self
    }

    /// Gateway entry: uploads of `kind` go to `output`.
    #[must_use]
    pub fn route(mut self, kind: Kind, output: OutputSpec) -> Self {
        self.routes.push((kind, output));
        self
    }

    #[must_use]
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    #[must_use]
    pub fn results_source(&self) -> Source {
        Source::shard(&self.results_queue, 0)
    }

    /// Instances of all stages.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.stages.iter().map(|s| s.instances).sum()
    }

    /// # Errors
    /// [`StageError::Config`] if `target` names an unknown stage.
    pub fn destination(&self, target: &Target) -> Result<Destination> {
        match target {
            Target::Stage(name) => self
                .find(name)
                .map(|s| Destination::queue(name.clone(), s.instances))
                .ok_or_else(|| StageError::config(format!("unknown stage `{name}`"))),
            Target::Topic(prefix) => Ok(Destination::topic(prefix.clone())),
            Target::Results => Ok(Destination::queue(self.results_queue.clone(), 1)),
        }
    }

    /// Concrete [`Output`] for `spec`.
    ///
    /// # Errors
    /// [`StageError::Config`] if the target does not exist.
    pub fn resolve(&self, spec: &OutputSpec) -> Result<Output> {
        let destination = self.destination(&spec.target)?;
        Ok(match &spec.route {
            RouteBy::Broadcast => Output::broadcast(destination, spec.kind),
            RouteBy::RoundRobin => Output::round_robin(destination, spec.kind),
            RouteBy::Key(field, key) => Output::by_key(destination, spec.kind, field, *key),
        })
    }

    /// Gateway routes, resolved.
    ///
    /// # Errors
    /// [`StageError::Config`] if a route targets an unknown stage.
    pub fn gateway_routes(&self) -> Result<Vec<(Kind, Output)>> {
        self.routes
            .iter()
            .map(|(kind, spec)| Ok((*kind, self.resolve(spec)?)))
            .collect()
    }

    fn targets(&self, target: &Target, kind: Kind) -> usize {
        let from_stages: usize = self
            .stages
            .iter()
            .map(|s| {
                s.instances
                    * s.outputs
                        .iter()
                        .filter(|o| o.target == *target && o.kind == kind)
                        .count()
            })
            .sum();
        let from_gateway = self
            .routes
            .iter()
            .filter(|(k, o)| o.target == *target && *k == kind)
            .count();
        from_stages + from_gateway
    }

    /// EOFs `stage`'s `input` must see per session before its barrier fires.
    #[must_use]
    pub fn producers(&self, stage: &StageSpec, input: &InputSpec) -> usize {
        let target = match &input.feed {
            Feed::Queue => Target::Stage(stage.name.clone()),
            Feed::Topic(prefix) => Target::Topic(prefix.clone()),
        };
        self.targets(&target, input.kind)
    }

    /// EOFs the client must see per result kind before a session is complete.
    #[must_use]
    pub fn expected_results(&self) -> BTreeMap<Kind, usize> {
        Kind::RESULTS
            .iter()
            .map(|k| (*k, self.targets(&Target::Results, *k)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    /// Check the wiring before anything runs.
    ///
    /// # Errors
    /// [`StageError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(StageError::config("max_batch_size must be at least 1"));
        }
        let mut names = HashSet::new();
        for stage in &self.stages {
            if stage.name.is_empty() || !names.insert(stage.name.as_str()) {
                return Err(StageError::config(format!(
                    "stage names must be unique and non-empty: `{}`",
                    stage.name
                )));
            }
            if stage.instances == 0 {
                return Err(StageError::config(format!("stage `{}` has no instances", stage.name)));
            }
            if stage.inputs.len() != stage.kind.arity() {
                return Err(StageError::config(format!(
                    "stage `{}` needs {} input(s), has {}",
                    stage.name,
                    stage.kind.arity(),
                    stage.inputs.len()
                )));
            }
            if stage.inputs.iter().filter(|i| i.feed == Feed::Queue).count() > 1 {
                return Err(StageError::config(format!(
                    "stage `{}` has more than one queue input",
                    stage.name
                )));
            }
            for input in &stage.inputs {
                if !input.kind.is_data() {
                    return Err(StageError::config(format!("stage `{}` accepts EOF", stage.name)));
                }
                if self.producers(stage, input) == 0 {
                    return Err(StageError::config(format!(
                        "input {} of stage `{}` has no producers",
                        input.kind, stage.name
                    )));
                }
            }
        }
        let outputs = self
            .stages
            .iter()
            .flat_map(|s| s.outputs.iter().map(move |o| (s.name.as_str(), o)))
            .chain(self.routes.iter().map(|(_, o)| ("gateway", o)));
        for (from, output) in outputs {
            self.check_consumer(from, output)?;
        }
        for (kind, _) in &self.routes {
            if !Kind::DATASETS.contains(kind) {
                return Err(StageError::config(format!("gateway cannot upload {kind}")));
            }
        }
        Ok(())
    }

    fn check_consumer(&self, from: &str, output: &OutputSpec) -> Result<()> {
        let kind = output.kind;
        match &output.target {
            Target::Stage(name) => {
                let stage = self
                    .find(name)
                    .ok_or_else(|| StageError::config(format!("`{from}` targets unknown stage `{name}`")))?;
                match stage.queue_input() {
                    Some(input) if input.kind == kind => Ok(()),
                    Some(input) => Err(StageError::config(format!(
                        "`{from}` sends {kind} to `{name}`, which accepts {}",
                        input.kind
                    ))),
                    None => Err(StageError::config(format!("stage `{name}` has no queue input"))),
                }
            }
            Target::Topic(prefix) => {
                let subscribers: Vec<&InputSpec> = self
                    .stages
                    .iter()
                    .flat_map(|s| s.inputs.iter())
                    .filter(|i| i.feed == Feed::Topic(prefix.clone()))
                    .collect();
                if subscribers.is_empty() {
                    return Err(StageError::config(format!("topic `{prefix}` has no subscribers")));
                }
                if let Some(bad) = subscribers.iter().find(|i| i.kind != kind) {
                    return Err(StageError::config(format!(
                        "`{from}` publishes {kind} on `{prefix}`, a subscriber accepts {}",
                        bad.kind
                    )));
                }
                Ok(())
            }
            Target::Results if kind.is_result() => Ok(()),
            Target::Results => Err(StageError::config(format!("`{from}` sends {kind} as a result"))),
        }
    }

    /// Create every queue and topic binding, so nothing published before a
    /// consumer starts is lost.
    ///
    /// # Errors
    /// The transport refused a declaration.
    pub fn declare(&self, transport: &dyn Transport) -> Result<()> {
        for stage in &self.stages {
            for instance in 0..stage.instances {
                for input in &stage.inputs {
                    transport.declare(&stage.source(input, instance))?;
                }
            }
        }
        transport.declare(&self.results_source())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combiners::CountRows;

    fn small() -> Topology {
        Topology::new("results", 10)
            .stage(
                StageSpec::transform("clean", 2, Kind::Transactions, TransformStage::default()).to(
                    OutputSpec::to_stage(
                        "count",
                        Kind::Transactions,
                        RouteBy::Key("store_id".into(), ShardKey::Numeric),
                    ),
                ),
            )
            .stage(
                StageSpec::reduce("count", 3, Kind::Transactions, ["store_id"], Arc::new(CountRows::new("n")))
                    .to(OutputSpec::to_results(Kind::Q3)),
            )
            .route(
                Kind::Transactions,
                OutputSpec::to_stage("clean", Kind::Transactions, RouteBy::RoundRobin),
            )
    }

    #[test]
    fn producers_are_summed_instances() {
        let t = small();
        t.validate().unwrap();
        let clean = t.find("clean").unwrap();
        let count = t.find("count").unwrap();
        assert_eq!(t.producers(clean, &clean.inputs[0]), 1);
        assert_eq!(t.producers(count, &count.inputs[0]), 2);
        assert_eq!(t.expected_results().get(&Kind::Q3), Some(&3));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let t = small().stage(
            StageSpec::transform("odd", 1, Kind::Users, TransformStage::default())
                .to(OutputSpec::to_stage("count", Kind::Users, RouteBy::RoundRobin)),
        );
        assert!(t.validate().is_err());
    }

    #[test]
    fn input_without_producers_is_rejected() {
        let t = small().stage(StageSpec::transform("orphan", 1, Kind::Stores, TransformStage::default()));
        assert!(matches!(t.validate(), Err(StageError::Config { .. })));
    }

    #[test]
    fn topic_sources_are_private_per_instance() {
        let spec = StageSpec::join(
            "join",
            2,
            InputSpec::topic("stores", Kind::Stores),
            Kind::Q3,
            JoinSpec::on("store_id", ["store_name"]),
        );
        let a = spec.source(&spec.inputs[0], 0);
        let b = spec.source(&spec.inputs[0], 1);
        assert_ne!(a.queue_name(), b.queue_name());
        assert_eq!(a.pattern(), "stores.*");
        assert_eq!(spec.source(&spec.inputs[1], 1).queue_name(), "join-1");
    }
}
