use std::sync::Arc;
use std::time::Duration;

use strand_common::{ExchangeId, WorkerId};
use strand_exchange::{Consumer, DataMessage, ExchangeRegistry, LocalSink, Producer, Routing};
use strand_execution::{
    drive_to_eos, Batch, BatchBuilder, ColumnType, MemoryScan, Operator, Schema,
};

fn schema() -> Schema {
    Schema::new([("id", ColumnType::Long), ("name", ColumnType::String)])
}

fn batch(ids: &[i64]) -> Batch {
    let mut b = BatchBuilder::new(schema());
    for id in ids {
        b.put_long(0, *id).expect("id");
        b.put_string(1, &format!("n{id}")).expect("name");
    }
    b.finish().expect("finish")
}

fn drain_round(consumer: &mut Consumer) -> Vec<i64> {
    let mut ids = Vec::new();
    while !consumer.eos() && !consumer.eoi() {
        if let Some(b) = consumer.next().expect("next") {
            ids.extend_from_slice(b.long_values(0).expect("ids"));
        }
    }
    ids
}

#[test]
fn rounds_and_end_of_stream_cross_the_exchange() {
    let registry = Arc::new(ExchangeRegistry::new());
    let id = ExchangeId::next();
    let sink = Arc::new(LocalSink::new(WorkerId(1), Arc::clone(&registry)));
    let scan = MemoryScan::with_rounds(schema(), vec![vec![batch(&[1, 2])], vec![batch(&[3])]]);
    let mut producer = Producer::new(id, Routing::Collect(WorkerId::MASTER), sink)
        .expect("producer")
        .with_child(Box::new(scan))
        .expect("wire");
    producer.open().expect("open");
    let sent = drive_to_eos(&mut producer, "exchange-test", |_| Ok(())).expect("drive");
    producer.close().expect("close");
    assert_eq!(sent, 3);

    let mut consumer = Consumer::new(id, schema(), [WorkerId(1)], &registry)
        .expect("consumer")
        .with_poll_timeout(Duration::from_millis(10));
    consumer.open().expect("open");
    assert_eq!(drain_round(&mut consumer), vec![1, 2]);
    assert!(consumer.eoi() && !consumer.eos());
    consumer.set_eoi(false);
    assert_eq!(drain_round(&mut consumer), vec![3]);
    assert!(consumer.eos());
}

#[test]
fn consumer_waits_for_every_source() {
    let registry = Arc::new(ExchangeRegistry::new());
    let id = ExchangeId::next();
    for worker in [WorkerId(1), WorkerId(2)] {
        let sink = Arc::new(LocalSink::new(worker, Arc::clone(&registry)));
        let mut producer = Producer::new(id, Routing::Collect(WorkerId::MASTER), sink)
            .expect("producer")
            .with_child(Box::new(MemoryScan::new(schema(), vec![batch(&[i64::from(worker.0)])])))
            .expect("wire");
        producer.open().expect("open");
        drive_to_eos(&mut producer, "exchange-test", |_| Ok(())).expect("drive");
        producer.close().expect("close");
    }

    let mut consumer = Consumer::new(id, schema(), [WorkerId(1), WorkerId(2)], &registry)
        .expect("consumer")
        .with_poll_timeout(Duration::from_millis(10));
    consumer.open().expect("open");
    let mut ids = drain_round(&mut consumer);
    ids.sort();
    assert_eq!(ids, vec![1, 2]);
    assert!(consumer.eos());
}

#[test]
fn shuffle_partitions_rows_by_key() {
    let registry = Arc::new(ExchangeRegistry::new());
    let left = ExchangeId::next();
    let sink = Arc::new(LocalSink::new(WorkerId(1), Arc::clone(&registry)));
    let ids: Vec<i64> = (0..64).collect();
    let mut producer = Producer::new(
        left,
        Routing::Shuffle {
            destinations: vec![WorkerId(2), WorkerId(3)],
            key_column: 0,
        },
        sink,
    )
    .expect("producer")
    .with_child(Box::new(MemoryScan::new(schema(), vec![batch(&ids), batch(&ids)])))
    .expect("wire");
    producer.open().expect("open");
    drive_to_eos(&mut producer, "exchange-test", |_| Ok(())).expect("drive");

    // LocalSink ignores the destination, so both partitions land on one queue;
    // every key must still arrive exactly twice with its row intact.
    let mut consumer = Consumer::new(left, schema(), [WorkerId(1)], &registry)
        .expect("consumer")
        .with_poll_timeout(Duration::from_millis(10));
    consumer.open().expect("open");
    let mut seen = Vec::new();
    while !consumer.eos() {
        if let Some(b) = consumer.next().expect("next") {
            for r in 0..b.num_tuples() {
                let id = b.get_long(0, r).expect("id");
                assert_eq!(b.get_string(1, r).expect("name"), format!("n{id}"));
                seen.push(id);
            }
        }
    }
    seen.sort();
    let mut expected: Vec<i64> = ids.iter().chain(ids.iter()).copied().collect();
    expected.sort();
    assert_eq!(seen, expected);
}

#[test]
fn unexpected_sender_is_an_error() {
    let registry = Arc::new(ExchangeRegistry::new());
    let id = ExchangeId::next();
    let sink = Arc::new(LocalSink::new(WorkerId(9), Arc::clone(&registry)));
    let mut producer = Producer::new(id, Routing::Collect(WorkerId::MASTER), sink)
        .expect("producer")
        .with_child(Box::new(MemoryScan::new(schema(), vec![batch(&[1])])))
        .expect("wire");
    producer.open().expect("open");
    drive_to_eos(&mut producer, "exchange-test", |_| Ok(())).expect("drive");

    let mut consumer = Consumer::new(id, schema(), [WorkerId(1)], &registry)
        .expect("consumer")
        .with_poll_timeout(Duration::from_millis(10));
    consumer.open().expect("open");
    assert!(consumer.next().is_err());
}

#[test]
fn repeated_eoi_from_one_source_merges_into_the_open_round() {
    let registry = ExchangeRegistry::new();
    let id = ExchangeId::next();
    registry.deliver(WorkerId(1), DataMessage::eoi(id));
    registry.deliver(WorkerId(1), DataMessage::eoi(id));
    registry.deliver(WorkerId(2), DataMessage::eoi(id));
    registry.deliver(WorkerId(1), DataMessage::eos(id));
    registry.deliver(WorkerId(2), DataMessage::eos(id));

    let mut consumer = Consumer::new(id, schema(), [WorkerId(1), WorkerId(2)], &registry)
        .expect("consumer")
        .with_poll_timeout(Duration::from_millis(10));
    consumer.open().expect("open");
    assert!(drain_round(&mut consumer).is_empty());
    assert!(consumer.eoi());
    assert!(!consumer.eos());

    consumer.set_eoi(false);
    assert!(drain_round(&mut consumer).is_empty());
    assert!(consumer.eos());
    assert!(!consumer.eoi());
}
