use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strand_common::{ExchangeId, QueryId, Result, WorkerId};
use strand_distributed::{
    Catalog, ChannelSink, Coordinator, CoordinatorConfig, InProcessTransport, InboundMessage,
    InboundSender, SocketInfo,
};
use strand_exchange::{Consumer, ControlKind, ControlMessage, Producer, Routing, TransportMessage};
use strand_execution::{
    drive_to_eos, Batch, BatchBuilder, ColumnType, MemoryScan, Operator, Schema,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Fragment format understood by the simulated workers below.
#[derive(Debug, Serialize, Deserialize)]
struct Fragment {
    exchange: u64,
    values: Vec<i64>,
}

fn schema() -> Schema {
    Schema::new([("v", ColumnType::Long)])
}

fn batch(values: &[i64]) -> Batch {
    let mut b = BatchBuilder::new(schema());
    for v in values {
        b.put_long(0, *v).expect("put");
    }
    b.finish().expect("finish")
}

fn notify(inbound: &InboundSender, sender: WorkerId, control: ControlMessage) {
    inbound
        .send(InboundMessage {
            sender,
            message: TransportMessage::Control(control),
        })
        .expect("coordinator inbound open");
}

fn run_fragment(worker: WorkerId, fragment: &Fragment, inbound: InboundSender) -> Result<()> {
    let sink = Arc::new(ChannelSink::new(worker, inbound));
    let scan = MemoryScan::new(schema(), vec![batch(&fragment.values)]);
    let mut producer = Producer::new(
        ExchangeId::from_existing(fragment.exchange),
        Routing::Collect(WorkerId::MASTER),
        sink,
    )?
    .with_child(Box::new(scan))?;
    producer.open()?;
    drive_to_eos(&mut producer, "worker", |_| Ok(()))?;
    producer.close()
}

/// Minimal worker: announces itself, acknowledges fragments, runs them on
/// START_QUERY and reports completion.
fn spawn_worker(
    worker: WorkerId,
    mut outbox: mpsc::UnboundedReceiver<TransportMessage>,
    inbound: InboundSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        notify(&inbound, worker, ControlMessage::new(ControlKind::WorkerAlive));
        let mut fragments: HashMap<QueryId, Fragment> = HashMap::new();
        while let Some(message) = outbox.recv().await {
            match message {
                TransportMessage::Query(query) => {
                    let fragment = serde_json::from_slice(&query.fragment).expect("fragment");
                    fragments.insert(query.query_id, fragment);
                    notify(
                        &inbound,
                        worker,
                        ControlMessage::for_query(query.query_id, ControlKind::QueryReadyToExecute),
                    );
                }
                TransportMessage::Control(ControlMessage {
                    kind: ControlKind::StartQuery,
                    query_id: Some(query_id),
                }) => {
                    let fragment = fragments.remove(&query_id).expect("fragment before start");
                    run_fragment(worker, &fragment, inbound.clone()).expect("fragment runs");
                    notify(
                        &inbound,
                        worker,
                        ControlMessage::for_query(query_id, ControlKind::QueryComplete),
                    );
                }
                TransportMessage::Control(ControlMessage {
                    kind: ControlKind::Shutdown,
                    ..
                }) => break,
                other => panic!("worker {worker} got unexpected {other:?}"),
            }
        }
    })
}

struct Cluster {
    coordinator: Coordinator<InProcessTransport>,
    workers: Vec<JoinHandle<()>>,
}

fn cluster(ids: &[u32]) -> Cluster {
    let transport = InProcessTransport::new();
    let outboxes: Vec<_> = ids
        .iter()
        .map(|w| (WorkerId(*w), transport.connect_worker(WorkerId(*w))))
        .collect();
    let catalog = Catalog::in_memory(
        SocketInfo::new("localhost", 8001),
        ids.iter()
            .map(|w| (WorkerId(*w), SocketInfo::new("localhost", 9000 + *w as u16))),
    );
    let config = CoordinatorConfig {
        wait_poll_interval_ms: 10,
        dispatcher_poll_interval_ms: 10,
        ..CoordinatorConfig::default()
    };
    let coordinator = Coordinator::new(config, catalog, transport).expect("coordinator");
    coordinator.start().expect("start");
    let workers = outboxes
        .into_iter()
        .map(|(id, outbox)| spawn_worker(id, outbox, coordinator.inbound()))
        .collect();
    Cluster {
        coordinator,
        workers,
    }
}

fn plans(exchange: ExchangeId, per_worker: &[(u32, Vec<i64>)]) -> BTreeMap<WorkerId, Vec<u8>> {
    per_worker
        .iter()
        .map(|(w, values)| {
            let fragment = Fragment {
                exchange: exchange.as_u64(),
                values: values.clone(),
            };
            (WorkerId(*w), serde_json::to_vec(&fragment).expect("encode"))
        })
        .collect()
}

fn consumer(cluster: &Cluster, exchange: ExchangeId, schema: Schema) -> Box<dyn Operator> {
    Box::new(
        Consumer::new(
            exchange,
            schema,
            [WorkerId(1), WorkerId(2)],
            &cluster.coordinator.exchanges(),
        )
        .expect("consumer")
        .with_poll_timeout(Duration::from_millis(10)),
    )
}

async fn stop(cluster: Cluster, query_id: QueryId) {
    tokio::time::timeout(
        Duration::from_secs(5),
        cluster.coordinator.wait_for_completion(query_id),
    )
    .await
    .expect("completion in time")
    .expect("known query");
    cluster.coordinator.shutdown().await.expect("shutdown");
    for worker in cluster.workers {
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker exits")
            .expect("worker task");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn collect_gathers_rows_from_every_worker() {
    let cluster = cluster(&[1, 2]);
    let exchange = ExchangeId::next();
    let query_id = QueryId(11);
    cluster
        .coordinator
        .dispatch_worker_query_plans(
            query_id,
            plans(exchange, &[(1, vec![1, 2, 3]), (2, vec![10, 20])]),
        )
        .await
        .expect("dispatch");

    let root = consumer(&cluster, exchange, schema());
    let buffer = tokio::time::timeout(
        Duration::from_secs(10),
        cluster.coordinator.start_server_query_collect(query_id, root),
    )
    .await
    .expect("collect in time")
    .expect("collect");

    let mut values: Vec<i64> = buffer
        .into_batches()
        .expect("batches")
        .iter()
        .flat_map(|b| b.long_values(0).expect("longs").to_vec())
        .collect();
    values.sort();
    assert_eq!(values, vec![1, 2, 3, 10, 20]);

    tokio::time::timeout(
        Duration::from_secs(5),
        cluster.coordinator.wait_for_completion(query_id),
    )
    .await
    .expect("completion in time")
    .expect("known query");
    let status = cluster.coordinator.query_status(query_id).expect("status");
    assert!(status.started);
    assert!(status.executing.is_empty());
    assert!(status.failure.is_none());
    stop(cluster, query_id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submitted_query_can_be_driven_locally() {
    let cluster = cluster(&[1, 2]);
    let exchange = ExchangeId::next();
    let query_id = cluster
        .coordinator
        .submit_query(
            "select * from t",
            "Consumer(Producer(Scan(t)))",
            plans(exchange, &[(1, vec![4, 5]), (2, vec![6])]),
        )
        .await
        .expect("submit");
    assert_eq!(query_id, QueryId(1));

    let root = consumer(&cluster, exchange, schema());
    let rows = tokio::time::timeout(
        Duration::from_secs(10),
        cluster.coordinator.start_server_query_drive(query_id, root),
    )
    .await
    .expect("drive in time")
    .expect("drive");
    assert_eq!(rows, 3);
    stop(cluster, query_id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_local_plan_marks_the_query_failed() {
    let cluster = cluster(&[1, 2]);
    let exchange = ExchangeId::next();
    let query_id = QueryId(12);
    cluster
        .coordinator
        .dispatch_worker_query_plans(query_id, plans(exchange, &[(1, vec![1]), (2, vec![2])]))
        .await
        .expect("dispatch");

    // Workers ship LONG columns; a consumer expecting INT cannot decode them.
    let root = consumer(&cluster, exchange, Schema::new([("v", ColumnType::Int)]));
    let err = tokio::time::timeout(
        Duration::from_secs(10),
        cluster.coordinator.start_server_query_collect(query_id, root),
    )
    .await
    .expect("collect in time")
    .expect_err("type mismatch");
    let status = cluster.coordinator.query_status(query_id).expect("status");
    assert_eq!(status.failure, Some(err.to_string()));
    stop(cluster, query_id).await;
}
