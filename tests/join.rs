use anyhow::Result;
use stageflow::message::{Frame, Kind, decode, encode_eof, encode_rows};
use stageflow::metrics::StageMetrics;
use stageflow::runtime::{Output, Outputs, StageContext};
use stageflow::stages::{JoinInput, JoinSpec, Side, TwoStreamJoiner};
use stageflow::transport::{CancellationToken, Destination, Source, Transport};
use stageflow::{MemoryBroker, Row, StageError, row};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const DOWN: &str = "joined";

struct Fixture {
    broker: Arc<MemoryBroker>,
    joiner: TwoStreamJoiner,
}

fn fixture(base_producers: usize, stream_producers: usize) -> Result<Fixture> {
    let broker = Arc::new(MemoryBroker::new().with_poll_interval(Duration::from_millis(5)));
    broker.declare(&Source::shard(DOWN, 0))?;
    let base = JoinInput::new(Source::topic("stores", "join_q3-0"), Kind::Stores, base_producers);
    let stream = JoinInput::new(Source::shard("join_q3", 0), Kind::Q3, stream_producers);
    broker.declare(&base.source)?;
    broker.declare(&stream.source)?;

    let metrics = Arc::new(StageMetrics::default());
    let transport: Arc<dyn Transport> = broker.clone();
    let outputs = Outputs::new(
        transport,
        vec![Output::round_robin(Destination::queue(DOWN, 1), Kind::Q3)],
        50,
        0,
        Arc::clone(&metrics),
    );
    let joiner = TwoStreamJoiner::new(
        StageContext::new("join_q3", 0, metrics),
        JoinSpec::on("store_id", ["store_name"]),
        base,
        stream,
        outputs,
    )?;
    Ok(Fixture { broker, joiner })
}

fn stores() -> Vec<Row> {
    vec![
        row! { "store_id" => "1", "store_name" => "USJ" },
        row! { "store_id" => "2", "store_name" => "Putra" },
    ]
}

fn emitted(b: &MemoryBroker) -> Result<Vec<Frame>> {
    Ok(b.drain(&format!("{DOWN}-0"))?
        .iter()
        .map(decode)
        .collect::<stageflow::Result<Vec<_>>>()?)
}

fn batch_rows(frames: &[Frame]) -> Vec<Row> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Batch { rows, .. } => Some(rows.clone()),
            Frame::Eof { .. } => None,
        })
        .flatten()
        .collect()
}

fn eof_count(frames: &[Frame]) -> usize {
    frames.iter().filter(|f| matches!(f, Frame::Eof { .. })).count()
}

#[test]
fn stream_eof_before_base_eof_buffers_then_joins_everything() -> Result<()> {
    let f = fixture(1, 1)?;
    let j = &f.joiner;

    j.handle(Side::Stream, encode_rows(Kind::Q3, "s", &[row! { "store_id" => "1", "tpv" => "10" }]))?;
    j.handle(Side::Stream, encode_rows(Kind::Q3, "s", &[row! { "store_id" => "2", "tpv" => "20" }]))?;
    j.handle(Side::Stream, encode_eof("s", Kind::Q3))?;
    assert!(emitted(&f.broker)?.is_empty(), "nothing may leave before the base is complete");
    assert_eq!(j.buffered("s")?, 2);

    j.handle(Side::Base, encode_rows(Kind::Stores, "s", &stores()))?;
    assert!(emitted(&f.broker)?.is_empty());
    j.handle(Side::Base, encode_eof("s", Kind::Stores))?;

    let out = emitted(&f.broker)?;
    assert_eq!(
        batch_rows(&out),
        vec![
            row! { "store_id" => "1", "tpv" => "10", "store_name" => "USJ" },
            row! { "store_id" => "2", "tpv" => "20", "store_name" => "Putra" },
        ]
    );
    assert_eq!(eof_count(&out), 1);
    assert!(matches!(out.last(), Some(Frame::Eof { .. })));
    assert_eq!(j.open_sessions()?, 0);
    Ok(())
}

#[test]
fn base_first_joins_stream_batches_as_they_arrive() -> Result<()> {
    let f = fixture(1, 2)?;
    let j = &f.joiner;

    j.handle(Side::Base, encode_rows(Kind::Stores, "s", &stores()))?;
    j.handle(Side::Base, encode_eof("s", Kind::Stores))?;

    j.handle(Side::Stream, encode_rows(Kind::Q3, "s", &[row! { "store_id" => "2", "tpv" => "5" }]))?;
    let out = emitted(&f.broker)?;
    assert_eq!(
        batch_rows(&out),
        vec![row! { "store_id" => "2", "tpv" => "5", "store_name" => "Putra" }]
    );
    assert_eq!(j.buffered("s")?, 0);

    j.handle(Side::Stream, encode_eof("s", Kind::Q3))?;
    assert_eq!(eof_count(&emitted(&f.broker)?), 0, "one of two stream producers is still open");
    j.handle(Side::Stream, encode_eof("s", Kind::Q3))?;
    assert_eq!(eof_count(&emitted(&f.broker)?), 1);
    Ok(())
}

#[test]
fn unmatched_stream_rows_are_dropped_and_counted() -> Result<()> {
    let f = fixture(1, 1)?;
    let j = &f.joiner;

    j.handle(Side::Base, encode_rows(Kind::Stores, "s", &stores()))?;
    j.handle(Side::Base, encode_eof("s", Kind::Stores))?;
    j.handle(
        Side::Stream,
        encode_rows(
            Kind::Q3,
            "s",
            &[
                row! { "store_id" => "9", "tpv" => "1" },
                row! { "store_id" => "1", "tpv" => "2" },
            ],
        ),
    )?;
    j.handle(Side::Stream, encode_eof("s", Kind::Q3))?;

    let out = emitted(&f.broker)?;
    assert_eq!(batch_rows(&out).len(), 1);
    assert_eq!(j.context().metrics.rows_dropped(), 1);
    Ok(())
}

#[test]
fn sessions_join_against_their_own_base() -> Result<()> {
    let f = fixture(1, 1)?;
    let j = &f.joiner;

    j.handle(Side::Base, encode_rows(Kind::Stores, "a", &[row! { "store_id" => "1", "store_name" => "A" }]))?;
    j.handle(Side::Base, encode_rows(Kind::Stores, "b", &[row! { "store_id" => "1", "store_name" => "B" }]))?;
    j.handle(Side::Base, encode_eof("b", Kind::Stores))?;
    j.handle(Side::Stream, encode_rows(Kind::Q3, "b", &[row! { "store_id" => "1" }]))?;
    j.handle(Side::Stream, encode_rows(Kind::Q3, "a", &[row! { "store_id" => "1" }]))?;

    let out = emitted(&f.broker)?;
    assert_eq!(batch_rows(&out), vec![row! { "store_id" => "1", "store_name" => "B" }]);
    assert_eq!(j.buffered("a")?, 1);
    assert_eq!(j.open_sessions()?, 2);
    Ok(())
}

#[test]
fn protocol_violations_on_either_side() -> Result<()> {
    let f = fixture(1, 1)?;
    let j = &f.joiner;

    let err = j
        .handle(Side::Base, encode_rows(Kind::Q3, "s", &[row! { "store_id" => "1" }]))
        .unwrap_err();
    assert!(matches!(err, StageError::ProtocolViolation { .. }));

    j.handle(Side::Base, encode_eof("s", Kind::Stores))?;
    let err = j.handle(Side::Base, encode_eof("s", Kind::Stores)).unwrap_err();
    assert!(matches!(err, StageError::ProtocolViolation { .. }));
    let err = j
        .handle(Side::Base, encode_rows(Kind::Stores, "s", &stores()))
        .unwrap_err();
    assert!(err.is_fatal());
    Ok(())
}

#[test]
fn run_joins_concurrently_and_stops_on_cancel() -> Result<()> {
    let f = fixture(1, 1)?;
    let broker = Arc::clone(&f.broker);
    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        let joiner = f.joiner;
        thread::spawn(move || joiner.run(&cancel))
    };

    broker.send("join_q3-0", encode_rows(Kind::Q3, "s", &[row! { "store_id" => "2", "tpv" => "7" }]))?;
    broker.send("join_q3-0", encode_eof("s", Kind::Q3))?;
    broker.send("stores.0", encode_rows(Kind::Stores, "s", &stores()))?;
    broker.send("stores.0", encode_eof("s", Kind::Stores))?;

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut frames = Vec::new();
    while eof_count(&frames) == 0 && Instant::now() < deadline {
        frames.extend(emitted(&broker)?);
        thread::sleep(Duration::from_millis(5));
    }
    cancel.cancel();
    let joined = handle.join().map_err(|_| anyhow::anyhow!("join thread panicked"))?;
    joined?;

    assert_eq!(
        batch_rows(&frames),
        vec![row! { "store_id" => "2", "tpv" => "7", "store_name" => "Putra" }]
    );
    assert_eq!(eof_count(&frames), 1);
    Ok(())
}
