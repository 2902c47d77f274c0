use anyhow::Result;
use stageflow::combiners::CountRows;
use stageflow::gateway::{ResultCollector, SessionGateway};
use stageflow::message::{Kind, encode_eof, encode_rows};
use stageflow::metrics::StageMetrics;
use stageflow::runtime::Output;
use stageflow::topology::{OutputSpec, RouteBy, StageSpec, Topology};
use stageflow::transport::{Destination, Source, Transport};
use stageflow::{MemoryBroker, StageError, row};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn collector(expected: &[(Kind, usize)]) -> stageflow::Result<ResultCollector> {
    let broker: Arc<dyn Transport> = Arc::new(MemoryBroker::new());
    ResultCollector::new(broker, Source::shard("results", 0), expected.iter().copied().collect())
}

#[test]
fn session_completes_after_every_expected_eof() -> Result<()> {
    let c = collector(&[(Kind::Q1, 2), (Kind::Q3, 1)])?;
    c.handle(encode_rows(Kind::Q1, "s", &[row! { "transaction_id" => "t1" }]))?;
    c.handle(encode_eof("s", Kind::Q1))?;
    c.handle(encode_eof("s", Kind::Q3))?;
    assert!(c.wait_for("s", Duration::from_millis(20))?.is_none());

    c.handle(encode_rows(Kind::Q1, "s", &[row! { "transaction_id" => "t2" }]))?;
    c.handle(encode_eof("s", Kind::Q1))?;
    let done = c
        .wait_for("s", Duration::from_secs(1))?
        .ok_or_else(|| anyhow::anyhow!("session did not complete"))?;
    assert_eq!(done.rows(Kind::Q1).len(), 2);
    assert!(done.rows(Kind::Q3).is_empty());
    assert_eq!(c.open_sessions()?, 0);
    Ok(())
}

#[test]
fn other_sessions_are_parked_for_their_own_waiter() -> Result<()> {
    let c = collector(&[(Kind::Q4, 1)])?;
    c.handle(encode_rows(Kind::Q4, "b", &[row! { "user_id" => "1" }]))?;
    c.handle(encode_eof("b", Kind::Q4))?;
    c.handle(encode_eof("a", Kind::Q4))?;

    let a = c.wait_for("a", Duration::from_secs(1))?;
    assert_eq!(a.map(|r| r.total_rows()), Some(0));
    let b = c.wait_for("b", Duration::from_secs(1))?;
    assert_eq!(b.map(|r| r.total_rows()), Some(1));
    Ok(())
}

#[test]
fn concurrent_waiters_each_get_their_own_session() -> Result<()> {
    let c = collector(&[(Kind::Q1, 1)])?;
    let feed = c.completed()?;
    for round in 0..5 {
        let (a_id, b_id) = (format!("a{round}"), format!("b{round}"));
        let (a, b) = thread::scope(|s| -> Result<_> {
            let a = s.spawn(|| c.wait_for(&a_id, Duration::from_secs(2)));
            let b = s.spawn(|| c.wait_for(&b_id, Duration::from_secs(2)));
            thread::sleep(Duration::from_millis(20));
            c.handle(encode_eof(&b_id, Kind::Q1))?;
            thread::sleep(Duration::from_millis(20));
            c.handle(encode_eof(&a_id, Kind::Q1))?;
            let a = a.join().map_err(|_| anyhow::anyhow!("waiter panicked"))??;
            let b = b.join().map_err(|_| anyhow::anyhow!("waiter panicked"))??;
            Ok((a, b))
        })?;
        assert_eq!(a.map(|r| r.session), Some(a_id.clone()), "round {round}");
        assert_eq!(b.map(|r| r.session), Some(b_id.clone()), "round {round}");
    }
    let order: Vec<String> = feed.try_iter().map(|r| r.session).collect();
    assert_eq!(order.len(), 10);
    assert_eq!(order[..2], ["b0", "a0"]);
    Ok(())
}

#[test]
fn a_session_completed_before_waiting_is_still_handed_out() -> Result<()> {
    let c = collector(&[(Kind::Q1, 1)])?;
    c.handle(encode_eof("early", Kind::Q1))?;
    thread::sleep(Duration::from_millis(10));
    let done = c.wait_for("early", Duration::ZERO)?;
    assert_eq!(done.map(|r| r.session), Some("early".to_string()));
    assert!(c.wait_for("early", Duration::from_millis(10))?.is_none());
    Ok(())
}

#[test]
fn late_or_foreign_results_are_protocol_violations() -> Result<()> {
    let c = collector(&[(Kind::Q1, 1)])?;
    let err = c.handle(encode_eof("s", Kind::Q2Profit)).unwrap_err();
    assert!(matches!(err, StageError::ProtocolViolation { .. }));

    c.handle(encode_eof("s", Kind::Q1))?;
    let err = c.handle(encode_eof("s", Kind::Q1)).unwrap_err();
    assert!(matches!(err, StageError::ProtocolViolation { .. }));
    let err = c
        .handle(encode_rows(Kind::Q1, "s", &[row! { "transaction_id" => "t9" }]))
        .unwrap_err();
    assert!(matches!(err, StageError::ProtocolViolation { .. }));
    Ok(())
}

#[test]
fn collector_rejects_meaningless_expectations() {
    assert!(matches!(collector(&[]), Err(StageError::Config { .. })));
    assert!(matches!(collector(&[(Kind::Stores, 1)]), Err(StageError::Config { .. })));
    assert!(matches!(collector(&[(Kind::Q1, 0)]), Err(StageError::Config { .. })));
}

#[test]
fn gateway_sends_one_eof_per_shard() -> Result<()> {
    let broker = Arc::new(MemoryBroker::new());
    for shard in 0..3 {
        broker.declare(&Source::shard("filter", shard))?;
    }
    let transport: Arc<dyn Transport> = broker.clone();
    let gateway = SessionGateway::new(
        transport,
        vec![(Kind::Stores, Output::round_robin(Destination::queue("filter", 3), Kind::Stores))],
        2,
        Arc::new(StageMetrics::default()),
    )?;

    let session = gateway.open_session();
    gateway.upload(&session, Kind::Stores, store_rows())?;
    gateway.finish(&session, Kind::Stores)?;

    let mut batches = 0;
    for shard in 0..3 {
        let messages = broker.drain(&format!("filter-{shard}"))?;
        let last = messages.last().map(|m| m.as_str().to_string()).unwrap_or_default();
        assert!(last.starts_with("EOF["), "shard {shard} must end with an EOF");
        batches += messages.len() - 1;
    }
    // five rows in batches of two
    assert_eq!(batches, 3);

    assert!(matches!(
        gateway.upload(&session, Kind::Users, vec![row! { "user_id" => "1" }]),
        Err(StageError::ProtocolViolation { .. })
    ));
    Ok(())
}

fn store_rows() -> Vec<stageflow::Row> {
    (1..=5)
        .map(|i| row! { "store_id" => i.to_string(), "store_name" => format!("shop {i}") })
        .collect()
}

#[test]
fn gateway_refuses_to_route_results() {
    let broker: Arc<dyn Transport> = Arc::new(MemoryBroker::new());
    let routes = vec![(Kind::Q1, Output::broadcast(Destination::queue("x", 1), Kind::Q1))];
    let err = SessionGateway::new(broker, routes, 10, Arc::new(StageMetrics::default()));
    assert!(matches!(err, Err(StageError::Config { .. })));
}

#[test]
fn topology_validation_catches_wiring_mistakes() {
    let reduce = || {
        StageSpec::reduce(
            "count",
            1,
            Kind::Transactions,
            ["store_id"],
            Arc::new(CountRows::new("n")),
        )
    };

    // no producers for the stage input
    let t = Topology::new("results", 10).stage(reduce().to(OutputSpec::to_results(Kind::Q4)));
    assert!(t.validate().is_err());

    // wrong kind sent to the stage
    let t = Topology::new("results", 10)
        .route(Kind::Stores, OutputSpec::to_stage("count", Kind::Stores, RouteBy::RoundRobin))
        .stage(reduce().to(OutputSpec::to_results(Kind::Q4)));
    assert!(t.validate().is_err());

    // a data kind delivered as a result
    let t = Topology::new("results", 10)
        .route(Kind::Transactions, OutputSpec::to_stage("count", Kind::Transactions, RouteBy::RoundRobin))
        .stage(reduce().to(OutputSpec::to_results(Kind::Stores)));
    assert!(t.validate().is_err());

    // a topic nobody subscribes to
    let t = Topology::new("results", 10)
        .route(Kind::Transactions, OutputSpec::to_stage("count", Kind::Transactions, RouteBy::RoundRobin))
        .stage(
            reduce()
                .to(OutputSpec::to_results(Kind::Q4))
                .to(OutputSpec::to_topic("nobody", Kind::Q4)),
        );
    assert!(t.validate().is_err());

    // and the fixed version
    let t = Topology::new("results", 10)
        .route(Kind::Transactions, OutputSpec::to_stage("count", Kind::Transactions, RouteBy::RoundRobin))
        .stage(reduce().to(OutputSpec::to_results(Kind::Q4)));
    assert!(t.validate().is_ok());
    assert_eq!(t.expected_results(), BTreeMap::from([(Kind::Q4, 1)]));
}
