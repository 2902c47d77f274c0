use anyhow::Result;
use stageflow::combiners::SumField;
use stageflow::message::{Frame, Kind, Message, decode, encode_eof, encode_rows};
use stageflow::metrics::{MetricsRegistry, StageMetrics};
use stageflow::runtime::{EofBarrier, BarrierState, Output, Outputs, StageContext, StageRuntime};
use stageflow::stages::{KeyedReducer, Step, TransformStage};
use stageflow::transport::{CancellationToken, Destination, Flow, Source, Transport};
use stageflow::{MemoryBroker, Row, StageError, row};
use std::sync::Arc;

const DOWN: &str = "down";

fn broker() -> Result<Arc<MemoryBroker>> {
    let b = Arc::new(MemoryBroker::new());
    b.declare(&Source::shard(DOWN, 0))?;
    Ok(b)
}

fn outputs(b: &Arc<MemoryBroker>, kind: Kind, metrics: &Arc<StageMetrics>) -> Outputs {
    let transport: Arc<dyn Transport> = b.clone();
    Outputs::new(
        transport,
        vec![Output::round_robin(Destination::queue(DOWN, 1), kind)],
        100,
        0,
        Arc::clone(metrics),
    )
}

fn frames(b: &MemoryBroker) -> Result<Vec<Frame>> {
    Ok(b.drain(&format!("{DOWN}-0"))?
        .iter()
        .map(decode)
        .collect::<stageflow::Result<Vec<_>>>()?)
}

fn passthrough(b: &Arc<MemoryBroker>, producers: usize) -> Result<StageRuntime<TransformStage>> {
    let metrics = Arc::new(StageMetrics::default());
    let ctx = StageContext::new("pass", 0, Arc::clone(&metrics));
    Ok(StageRuntime::new(
        ctx,
        Source::shard("pass", 0),
        Kind::Transactions,
        producers,
        TransformStage::new(vec![Step::require(["id"])]),
        outputs(b, Kind::Transactions, &metrics),
    )?)
}

#[test]
fn barrier_fires_exactly_once_per_session() -> Result<()> {
    let mut barrier = EofBarrier::new("s/in", 3)?;
    assert!(matches!(barrier.observe("a")?, BarrierState::Open { seen: 1, expected: 3 }));
    assert!(matches!(barrier.observe("b")?, BarrierState::Open { seen: 1, .. }));
    assert!(matches!(barrier.observe("a")?, BarrierState::Open { seen: 2, .. }));
    assert_eq!(barrier.observe("a")?, BarrierState::Fired);
    assert!(barrier.is_closed("a"));
    assert!(!barrier.is_closed("b"));
    assert_eq!(barrier.seen("b"), 1);

    let late = barrier.observe("a");
    assert!(matches!(late, Err(StageError::ProtocolViolation { .. })));
    Ok(())
}

#[test]
fn zero_producers_is_a_config_error() {
    assert!(matches!(EofBarrier::new("x", 0), Err(StageError::Config { .. })));
}

#[test]
fn stage_forwards_rows_then_one_eof_after_all_producers() -> Result<()> {
    let b = broker()?;
    let mut stage = passthrough(&b, 2)?;

    stage.handle(encode_rows(Kind::Transactions, "s1", &[row! { "id" => "1" }, row! { "x" => "no id" }]))?;
    stage.handle(encode_eof("s1", Kind::Transactions))?;
    assert_eq!(frames(&b)?.len(), 1, "first EOF must not be forwarded");

    stage.handle(encode_eof("s1", Kind::Transactions))?;
    let out = frames(&b)?;
    assert_eq!(
        out,
        vec![Frame::Eof {
            session: "s1".into(),
            kind: Kind::Transactions
        }]
    );
    assert_eq!(stage.context().metrics.rows_dropped(), 1);
    assert_eq!(stage.context().metrics.sessions_closed(), 1);
    Ok(())
}

#[test]
fn sessions_interleave_without_mixing() -> Result<()> {
    let b = broker()?;
    let mut stage = passthrough(&b, 1)?;

    stage.handle(encode_rows(Kind::Transactions, "a", &[row! { "id" => "a1" }]))?;
    stage.handle(encode_rows(Kind::Transactions, "b", &[row! { "id" => "b1" }]))?;
    stage.handle(encode_eof("b", Kind::Transactions))?;
    stage.handle(encode_rows(Kind::Transactions, "a", &[row! { "id" => "a2" }]))?;
    stage.handle(encode_eof("a", Kind::Transactions))?;

    let sessions: Vec<(String, bool)> = frames(&b)?
        .iter()
        .map(|f| (f.session().to_string(), matches!(f, Frame::Eof { .. })))
        .collect();
    assert_eq!(
        sessions,
        vec![
            ("a".into(), false),
            ("b".into(), false),
            ("b".into(), true),
            ("a".into(), false),
            ("a".into(), true),
        ]
    );
    Ok(())
}

#[test]
fn malformed_message_is_rejected_without_stopping() -> Result<()> {
    let b = broker()?;
    let mut stage = passthrough(&b, 1)?;

    let err = stage.handle(Message::from("TRN")).unwrap_err();
    assert!(matches!(err, StageError::Format { .. }));
    assert!(!err.is_fatal());

    let err = stage.handle(Message::from("XYZ[\"s\"]")).unwrap_err();
    assert!(matches!(err, StageError::Format { .. }));

    stage.handle(encode_rows(Kind::Transactions, "s", &[row! { "id" => "1" }]))?;
    assert_eq!(frames(&b)?.len(), 1);
    Ok(())
}

#[test]
fn wrong_kind_and_late_messages_are_protocol_violations() -> Result<()> {
    let b = broker()?;
    let mut stage = passthrough(&b, 1)?;

    let err = stage.handle(encode_rows(Kind::Stores, "s", &[row! { "id" => "1" }])).unwrap_err();
    assert!(matches!(err, StageError::ProtocolViolation { .. }));

    stage.handle(encode_eof("s", Kind::Transactions))?;
    let err = stage.handle(encode_eof("s", Kind::Transactions)).unwrap_err();
    assert!(matches!(err, StageError::ProtocolViolation { .. }));
    let err = stage
        .handle(encode_rows(Kind::Transactions, "s", &[row! { "id" => "2" }]))
        .unwrap_err();
    assert!(err.is_fatal());
    Ok(())
}

#[test]
fn reducer_emits_once_on_close_and_purges() -> Result<()> {
    let b = broker()?;
    let metrics = Arc::new(StageMetrics::default());
    let reducer = KeyedReducer::new(["store_id"], Arc::new(SumField::new("amount", "total")));
    let mut stage = StageRuntime::new(
        StageContext::new("sum", 0, Arc::clone(&metrics)),
        Source::shard("sum", 0),
        Kind::Transactions,
        1,
        reducer,
        outputs(&b, Kind::Q3, &metrics),
    )?;

    let rows: Vec<Row> = vec![
        row! { "store_id" => "1", "amount" => "2.5" },
        row! { "store_id" => "1", "amount" => "7.5" },
        row! { "store_id" => "", "amount" => "100" },
    ];
    stage.handle(encode_rows(Kind::Transactions, "s", &rows))?;
    assert!(frames(&b)?.is_empty(), "reducer must hold rows until close");
    assert_eq!(stage.logic().key_count("s"), 1);

    stage.handle(encode_eof("s", Kind::Transactions))?;
    let out = frames(&b)?;
    assert_eq!(out.len(), 2);
    match &out[0] {
        Frame::Batch { kind, rows, .. } => {
            assert_eq!(*kind, Kind::Q3);
            assert_eq!(rows, &vec![row! { "store_id" => "1", "total" => "10" }]);
        }
        other => panic!("expected a batch, got {other:?}"),
    }
    assert!(matches!(out[1], Frame::Eof { kind: Kind::Q3, .. }));
    assert_eq!(stage.logic().key_count("s"), 0);
    assert_eq!(metrics.rows_dropped(), 1);
    Ok(())
}

#[test]
fn registry_collects_instances() {
    let registry = MetricsRegistry::new();
    registry.register("reduce_q3-0").add_dropped(2);
    registry.register("reduce_q3-1").add_dropped(3);
    registry.register("join_q3-0").add_dropped(7);
    assert_eq!(registry.dropped_for("reduce_q3"), 5);
    assert_eq!(registry.snapshot().len(), 3);
}

/// Fires `token` the moment a message is handed to the stage, so the stage
/// sees the stop request with a message in hand.
struct CancelOnDelivery {
    inner: Arc<MemoryBroker>,
    token: CancellationToken,
}

impl Transport for CancelOnDelivery {
    fn declare(&self, source: &Source) -> stageflow::Result<()> {
        self.inner.declare(source)
    }

    fn send(&self, address: &str, message: Message) -> stageflow::Result<()> {
        self.inner.send(address, message)
    }

    fn requeue(&self, source: &Source, message: Message) -> stageflow::Result<()> {
        self.inner.requeue(source, message)
    }

    fn consume(
        &self,
        source: &Source,
        _cancel: &CancellationToken,
        handler: &mut dyn FnMut(Message) -> stageflow::Result<Flow>,
    ) -> stageflow::Result<()> {
        self.inner.consume(source, &CancellationToken::new(), &mut |m| {
            self.token.cancel();
            handler(m)
        })
    }
}

#[test]
fn cancelled_stage_requeues_the_message_in_hand() -> Result<()> {
    let b = broker()?;
    let input = Source::shard("pass", 0);
    b.declare(&input)?;
    let batch = encode_rows(Kind::Transactions, "s1", &[row! { "id" => "1" }]);
    b.send(&input.queue_name(), batch.clone())?;

    let cancel = CancellationToken::new();
    let transport: Arc<dyn Transport> = Arc::new(CancelOnDelivery {
        inner: Arc::clone(&b),
        token: cancel.clone(),
    });
    let metrics = Arc::new(StageMetrics::default());
    let stage = StageRuntime::new(
        StageContext::new("pass", 0, Arc::clone(&metrics)),
        input.clone(),
        Kind::Transactions,
        1,
        TransformStage::new(vec![Step::require(["id"])]),
        Outputs::new(
            transport,
            vec![Output::round_robin(Destination::queue(DOWN, 1), Kind::Transactions)],
            100,
            0,
            Arc::clone(&metrics),
        ),
    )?;
    stage.run(&cancel)?;

    assert!(frames(&b)?.is_empty());
    assert_eq!(metrics.rows_in(), 0);
    assert_eq!(b.drain(&input.queue_name())?, vec![batch]);
    Ok(())
}
