//! Downstream emission: routing, batch capping and EOF broadcast.

use crate::error::Result;
use crate::message::{Kind, encode_eof, encode_rows};
use crate::metrics::StageMetrics;
use crate::partition::{Partitioner, ShardKey};
use crate::row::Row;
use crate::transport::{Destination, Transport};
use std::sync::Arc;
use tracing::trace;

/// How rows of one output are spread over the destination's shards.
#[derive(Clone, Debug)]
pub enum Routing {
    /// Every shard receives every row.
    Broadcast,
    /// Whole batches rotate over the shards.
    RoundRobin,
    /// Each row goes to the shard its key maps to.
    ByKey(Partitioner),
}

/// One logical downstream edge.
#[derive(Clone, Debug)]
pub struct Output {
    pub destination: Destination,
    pub routing: Routing,
    /// Kind stamped on emitted batches.
    pub kind: Kind,
}

impl Output {
    #[must_use]
    pub fn broadcast(destination: Destination, kind: Kind) -> Self {
        Self {
            destination,
            routing: Routing::Broadcast,
            kind,
        }
    }

    #[must_use]
    pub fn round_robin(destination: Destination, kind: Kind) -> Self {
        Self {
            destination,
            routing: Routing::RoundRobin,
            kind,
        }
    }

    /// Shard rows by `field`; the partitioner is sized to the destination.
    #[must_use]
    pub fn by_key(destination: Destination, kind: Kind, field: &str, key: ShardKey) -> Self {
        let partitioner = Partitioner::sized(field, key, destination.fan_out());
        Self {
            destination,
            routing: Routing::ByKey(partitioner),
            kind,
        }
    }
}

struct OutputState {
    output: Output,
    cursor: usize,
}

/// Everything a stage may do to the outside world.
///
/// Owned by the runtime and lent to [`StageLogic`](crate::runtime::StageLogic)
/// callbacks; stages never see the transport directly.
pub struct Outputs {
    transport: Arc<dyn Transport>,
    outputs: Vec<OutputState>,
    max_batch_size: usize,
    /// Routing key for topic publishes: the producing instance index.
    instance: usize,
    metrics: Arc<StageMetrics>,
}

impl Outputs {
    pub fn new(
        transport: Arc<dyn Transport>,
        outputs: Vec<Output>,
        max_batch_size: usize,
        instance: usize,
        metrics: Arc<StageMetrics>,
    ) -> Self {
        Self {
            transport,
            outputs: outputs
                .into_iter()
                .map(|output| OutputState { output, cursor: 0 })
                .collect(),
            max_batch_size: max_batch_size.max(1),
            instance,
            metrics,
        }
    }

    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    #[must_use]
    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Forward `rows` of `session` to every output. Empty input sends nothing.
    ///
    /// # Errors
    /// The first transport failure.
    pub fn emit(&mut self, session: &str, rows: Vec<Row>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let n = rows.len();
        let last = self.outputs.len().saturating_sub(1);
        let mut rows = Some(rows);
        for i in 0..self.outputs.len() {
            // only the last output gets the rows without a copy
            let batch = if i == last {
                rows.take().unwrap_or_default()
            } else {
                rows.clone().unwrap_or_default()
            };
            self.emit_to(i, session, batch)?;
        }
        self.metrics.add_rows_out(n);
        Ok(())
    }

    fn emit_to(&mut self, index: usize, session: &str, mut rows: Vec<Row>) -> Result<()> {
        let max = self.max_batch_size;
        let instance = self.instance;
        let transport = Arc::clone(&self.transport);
        let state = &mut self.outputs[index];
        let kind = state.output.kind;
        let destination = &state.output.destination;

        if let Destination::Topic { .. } = destination {
            let address = destination.address(instance);
            return send_capped(transport.as_ref(), &address, kind, session, &rows, max);
        }

        match &state.output.routing {
            Routing::Broadcast => {
                for shard in 0..destination.fan_out() {
                    let address = destination.address(shard);
                    send_capped(transport.as_ref(), &address, kind, session, &rows, max)?;
                }
            }
            Routing::RoundRobin => {
                for chunk in rows.chunks(max) {
                    let shard = state.cursor % destination.fan_out().max(1);
                    state.cursor = state.cursor.wrapping_add(1);
                    let address = destination.address(shard);
                    trace!(%address, rows = chunk.len(), "round-robin batch");
                    transport.send(&address, encode_rows(kind, session, chunk))?;
                }
            }
            Routing::ByKey(partitioner) => {
                let mut buckets: Vec<Vec<Row>> = vec![Vec::new(); partitioner.shards()];
                for mut row in rows.drain(..) {
                    let shard = partitioner.route(&mut row);
                    buckets[shard].push(row);
                }
                for (shard, bucket) in buckets.iter().enumerate() {
                    if bucket.is_empty() {
                        continue;
                    }
                    let address = destination.address(shard);
                    send_capped(transport.as_ref(), &address, kind, session, bucket, max)?;
                }
            }
        }
        Ok(())
    }

    /// Tell every shard of every output that `session` is complete here.
    ///
    /// # Errors
    /// The first transport failure.
    pub fn emit_eof(&self, session: &str) -> Result<()> {
        for state in &self.outputs {
            let destination = &state.output.destination;
            let message = encode_eof(session, state.output.kind);
            match destination {
                Destination::Topic { .. } => {
                    self.transport
                        .send(&destination.address(self.instance), message)?;
                }
                Destination::Queue { shards, .. } => {
                    for shard in 0..*shards {
                        self.transport
                            .send(&destination.address(shard), message.clone())?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn send_capped(
    transport: &dyn Transport,
    address: &str,
    kind: Kind,
    session: &str,
    rows: &[Row],
    max: usize,
) -> Result<()> {
    for chunk in rows.chunks(max) {
        transport.send(address, encode_rows(kind, session, chunk))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::message::{Frame, decode};
    use crate::transport::Source;

    fn setup(shards: usize) -> Arc<MemoryBroker> {
        let broker = Arc::new(MemoryBroker::new());
        for s in 0..shards {
            broker.declare(&Source::shard("next", s)).unwrap();
        }
        broker
    }

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| Row::from_pairs([("id", i.to_string())]))
            .collect()
    }

    #[test]
    fn batches_are_capped() {
        let broker = setup(1);
        let mut out = Outputs::new(
            broker.clone(),
            vec![Output::broadcast(Destination::queue("next", 1), Kind::Users)],
            2,
            0,
            Arc::default(),
        );
        out.emit("s", rows(5)).unwrap();
        let sizes: Vec<usize> = broker
            .drain("next-0")
            .unwrap()
            .iter()
            .map(|m| match decode(m).unwrap() {
                Frame::Batch { rows, .. } => rows.len(),
                Frame::Eof { .. } => 0,
            })
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn by_key_sends_each_row_to_one_shard() {
        let broker = setup(3);
        let mut out = Outputs::new(
            broker.clone(),
            vec![Output::by_key(
                Destination::queue("next", 3),
                Kind::Users,
                "id",
                ShardKey::Numeric,
            )],
            100,
            0,
            Arc::default(),
        );
        out.emit("s", rows(9)).unwrap();
        for shard in 0..3 {
            let msgs = broker.drain(&format!("next-{shard}")).unwrap();
            assert_eq!(msgs.len(), 1);
            let Frame::Batch { rows, .. } = decode(&msgs[0]).unwrap() else {
                panic!("expected a batch");
            };
            assert!(rows.iter().all(|r| {
                r.get("id").unwrap().parse::<usize>().unwrap() % 3 == shard
            }));
        }
    }

    #[test]
    fn eof_reaches_every_shard() {
        let broker = setup(2);
        let out = Outputs::new(
            broker.clone(),
            vec![Output::round_robin(Destination::queue("next", 2), Kind::Users)],
            10,
            0,
            Arc::default(),
        );
        out.emit_eof("s").unwrap();
        assert_eq!(broker.pending("next-0"), 1);
        assert_eq!(broker.pending("next-1"), 1);
    }
}
