use anyhow::Result;
use stageflow::message::{Frame, Kind, Message, decode, decode_eof, decode_rows, encode_eof, encode_rows};
use stageflow::partition::{Partitioner, ShardKey, shard_for, shard_for_numeric};
use stageflow::testing::sequential_rows;
use stageflow::{StageError, row};

#[test]
fn every_shard_is_in_range_and_stable() {
    for shards in 1..=7 {
        for i in 0..200 {
            let v = format!("key-{i}");
            let s = shard_for(&v, shards);
            assert!(s < shards);
            assert_eq!(s, shard_for(&v, shards));
        }
    }
}

#[test]
fn numeric_spellings_share_a_shard() {
    for shards in [2, 3, 5] {
        assert_eq!(shard_for_numeric("42", shards), shard_for_numeric("42.0", shards));
        assert_eq!(shard_for_numeric("-7", shards), 7 % shards);
        assert_eq!(shard_for_numeric(" 9 ", shards), 9 % shards);
    }
}

#[test]
fn empty_keys_land_on_shard_zero() {
    let p = Partitioner::new("store_id", ShardKey::Numeric, 4).unwrap();
    let mut r = row! { "store_id" => "" };
    assert_eq!(p.route(&mut r), 0);
    let mut missing = row! { "other" => "1" };
    assert_eq!(p.route(&mut missing), 0);
}

#[test]
fn partitioning_is_a_partition() -> Result<()> {
    let p = Partitioner::new("id", ShardKey::Numeric, 3)?;
    let rows = sequential_rows("id", 0, 30);
    let mut shards = vec![Vec::new(); 3];
    for mut r in rows.clone() {
        let s = p.route(&mut r);
        shards[s].push(r);
    }
    assert_eq!(shards.iter().map(Vec::len).sum::<usize>(), rows.len());
    for (s, bucket) in shards.iter().enumerate() {
        assert_eq!(bucket.len(), 10, "shard {s}");
    }
    Ok(())
}

#[test]
fn routing_rewrites_numeric_keys_to_canonical_form() -> Result<()> {
    let p = Partitioner::new("user_id", ShardKey::Numeric, 2)?;
    let mut r = row! { "user_id" => "10.0", "x" => "y" };
    p.route(&mut r);
    assert_eq!(r.get("user_id"), Some("10"));
    assert_eq!(r.get("x"), Some("y"));
    Ok(())
}

#[test]
fn batch_round_trip_keeps_field_order() -> Result<()> {
    let rows = vec![
        row! { "z" => "1", "a" => "2" },
        row! { "m" => "" },
    ];
    let m = encode_rows(Kind::TransactionItems, "9f1c", &rows);
    match decode(&m)? {
        Frame::Batch { kind, session, rows: back } => {
            assert_eq!(kind, Kind::TransactionItems);
            assert_eq!(session, "9f1c");
            assert_eq!(back, rows);
            let fields: Vec<&str> = back[0].iter().map(|(k, _)| k).collect();
            assert_eq!(fields, vec!["z", "a"]);
        }
        Frame::Eof { .. } => panic!("decoded a batch as EOF"),
    }
    Ok(())
}

#[test]
fn eof_carries_the_terminated_kind() -> Result<()> {
    let m = encode_eof("s", Kind::Q4);
    assert_eq!(decode_eof(&m)?, Kind::Q4);
    assert!(matches!(decode_rows(&m, Kind::Q4), Err(StageError::Format { .. })));
    Ok(())
}

#[test]
fn malformed_envelopes_are_format_errors() {
    for raw in [
        "",
        "EO",
        "TRN\"s\"]",
        "TRN[\"s\",{\"a\":1}]",
        "TRN[42]",
        "TRN[]",
        "EOF[\"s\"]",
        "EOF[\"s\",\"EOF\"]",
        "EOF[\"s\",\"TRN\",\"STR\"]",
    ] {
        let err = decode(&Message::from(raw)).unwrap_err();
        assert!(matches!(err, StageError::Format { .. }), "{raw:?} gave {err:?}");
    }
}

#[test]
fn declared_kind_must_match_expected() {
    let m = encode_rows(Kind::Users, "s", &[row! { "user_id" => "1" }]);
    assert!(matches!(decode_rows(&m, Kind::Stores), Err(StageError::Format { .. })));
}
