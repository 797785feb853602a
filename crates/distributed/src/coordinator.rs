//! Master-side query coordinator.
//!
//! Responsibilities:
//! - track worker liveness from inbound WORKER_ALIVE notices;
//! - dispatch per-worker plan fragments and record ready acknowledgments;
//! - start workers exactly once per query and drive the local result tree;
//! - track per-query completion reports;
//! - route inbound exchange data into the local exchange registry.
//!
//! Every inbound message is handled by one dispatcher task, in arrival
//! order. Waiters are woken through a `Notify` and re-check on a bounded
//! interval, so a missed wakeup only costs one interval.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitvec::prelude::*;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strand_common::{
    env_parse_or, global_metrics, EngineConfig, LoggingConfig, QueryId, Result, StrandError,
    WorkerId,
};
use strand_exchange::{
    ControlKind, ControlMessage, DataMessageKind, ExchangeRegistry, QueryMessage,
    TransportMessage,
};
use strand_execution::{drive_to_eos, BatchBuffer, Operator};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, SocketInfo};
use crate::transport::{InboundMessage, InboundSender, Transport};

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Coordinator timing knobs.
pub struct CoordinatorConfig {
    /// Re-check interval of liveness and readiness waits.
    pub wait_poll_interval_ms: u64,
    /// Bounded wait of the dispatcher on an empty inbound queue; also bounds
    /// how long a stop request takes to be observed.
    pub dispatcher_poll_interval_ms: u64,
    /// Batch sizing and consumer polling for locally driven trees.
    pub engine: EngineConfig,
    /// Handed to [`strand_common::init_logging`] by the hosting process.
    pub logging: LoggingConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            wait_poll_interval_ms: 100,
            dispatcher_poll_interval_ms: 100,
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Overlay `STRAND_WAIT_POLL_MS` / `STRAND_DISPATCHER_POLL_MS` and the
    /// engine variables on the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            wait_poll_interval_ms: env_parse_or(
                "STRAND_WAIT_POLL_MS",
                defaults.wait_poll_interval_ms,
            )
            .max(1),
            dispatcher_poll_interval_ms: env_parse_or(
                "STRAND_DISPATCHER_POLL_MS",
                defaults.dispatcher_poll_interval_ms,
            )
            .max(1),
            engine: EngineConfig::from_env(),
            logging: LoggingConfig::from_env(),
        }
    }

    fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    fn dispatcher_poll_interval(&self) -> Duration {
        Duration::from_millis(self.dispatcher_poll_interval_ms)
    }
}

#[derive(Debug)]
struct QueryMeta {
    /// Assigned worker -> stable index into `ready`.
    assigned: BTreeMap<WorkerId, usize>,
    ready: BitVec,
    executing: HashSet<WorkerId>,
    started: bool,
    failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Point-in-time view of one query's coordinator state.
pub struct QueryStatus {
    pub query_id: QueryId,
    pub assigned: Vec<WorkerId>,
    pub ready: Vec<WorkerId>,
    pub executing: Vec<WorkerId>,
    pub started: bool,
    pub failure: Option<String>,
}

struct Shared<T: Transport> {
    config: CoordinatorConfig,
    transport: T,
    catalog: Mutex<Catalog>,
    workers: HashMap<WorkerId, SocketInfo>,
    alive: DashSet<WorkerId>,
    queries: DashMap<QueryId, QueryMeta>,
    exchanges: Arc<ExchangeRegistry>,
    changed: Notify,
    stopped: AtomicBool,
}

impl<T: Transport> Shared<T> {
    fn query_ready(&self, query_id: QueryId) -> bool {
        match self.queries.get(&query_id) {
            Some(meta) => {
                meta.ready.all() && meta.assigned.keys().all(|w| self.alive.contains(w))
            }
            None => false,
        }
    }

    fn query_completed(&self, query_id: QueryId) -> bool {
        self.queries
            .get(&query_id)
            .map_or(true, |meta| meta.executing.is_empty())
    }

    fn handle_inbound(&self, inbound: InboundMessage) -> Result<()> {
        let InboundMessage { sender, message } = inbound;
        match message {
            TransportMessage::Data(data) => {
                if data.kind != DataMessageKind::Normal {
                    debug!(
                        exchange_id = %data.exchange_id,
                        sender = %sender,
                        kind = data.kind.label(),
                        "exchange control marker received"
                    );
                }
                self.exchanges.deliver(sender, data);
                Ok(())
            }
            TransportMessage::Control(control) => self.handle_control(sender, control),
            TransportMessage::Query(query) => Err(StrandError::Protocol(format!(
                "unexpected QUERY message for query {} from worker {sender}",
                query.query_id
            ))),
        }
    }

    fn handle_control(&self, sender: WorkerId, control: ControlMessage) -> Result<()> {
        match control.kind {
            ControlKind::WorkerAlive => {
                if self.alive.insert(sender) {
                    info!(worker = %sender, operator = "CoordinatorDispatcher", "worker alive");
                    global_metrics().set_alive_workers(self.alive.len());
                }
                self.changed.notify_waiters();
            }
            ControlKind::QueryReadyToExecute => {
                let Some(query_id) = control.query_id else {
                    warn!(worker = %sender, "ready notice without a query id ignored");
                    return Ok(());
                };
                match self.queries.get_mut(&query_id) {
                    Some(mut meta) => match meta.assigned.get(&sender).copied() {
                        Some(index) => {
                            meta.ready.set(index, true);
                            debug!(query_id = %query_id, worker = %sender, "worker ready");
                        }
                        None => warn!(
                            query_id = %query_id,
                            worker = %sender,
                            "ready notice from a worker not assigned to the query"
                        ),
                    },
                    None => warn!(query_id = %query_id, worker = %sender, "ready notice for unknown query"),
                }
                self.changed.notify_waiters();
            }
            ControlKind::QueryComplete => {
                let Some(query_id) = control.query_id else {
                    warn!(worker = %sender, "completion notice without a query id ignored");
                    return Ok(());
                };
                match self.queries.get_mut(&query_id) {
                    Some(mut meta) => {
                        if !meta.executing.remove(&sender) {
                            warn!(
                                query_id = %query_id,
                                worker = %sender,
                                "completion from a worker not executing the query"
                            );
                        } else if meta.executing.is_empty() {
                            info!(query_id = %query_id, operator = "CoordinatorDispatcher", "query completed");
                            global_metrics().inc_coordinator_query_event("completed");
                        }
                    }
                    None => warn!(query_id = %query_id, worker = %sender, "completion for unknown query"),
                }
                self.changed.notify_waiters();
            }
            ControlKind::Disconnect => {
                debug!(worker = %sender, "disconnect notice");
            }
            ControlKind::Connect | ControlKind::Shutdown | ControlKind::StartQuery => {
                return Err(StrandError::Protocol(format!(
                    "unexpected control message {:?} at coordinator from worker {sender}",
                    control.kind
                )));
            }
        }
        Ok(())
    }
}

async fn run_dispatcher<T: Transport>(
    shared: Arc<Shared<T>>,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
) -> Result<()> {
    let poll = shared.config.dispatcher_poll_interval();
    while !shared.stopped.load(Ordering::Acquire) {
        let message = match tokio::time::timeout(poll, inbound.recv()).await {
            Err(_) => continue,
            Ok(None) => {
                debug!(operator = "CoordinatorDispatcher", "inbound queue closed");
                break;
            }
            Ok(Some(message)) => message,
        };
        if let Err(e) = shared.handle_inbound(message) {
            error!(operator = "CoordinatorDispatcher", error = %e, "dispatcher stopped on protocol violation");
            return Err(e);
        }
    }
    debug!(operator = "CoordinatorDispatcher", "dispatcher stopped");
    Ok(())
}

fn join_error(what: &str, e: tokio::task::JoinError) -> StrandError {
    StrandError::Execution(format!("{what} task failed: {e}"))
}

/// Master-side query coordinator over a transport `T`.
pub struct Coordinator<T: Transport> {
    shared: Arc<Shared<T>>,
    inbound_tx: InboundSender,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    dispatcher: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl<T: Transport> Coordinator<T> {
    /// Build a coordinator. The catalog must list exactly one master.
    pub fn new(config: CoordinatorConfig, catalog: Catalog, transport: T) -> Result<Self> {
        let master = catalog.master()?.clone();
        let workers = catalog.workers();
        info!(
            master = %master,
            workers = workers.len(),
            operator = "CoordinatorInit",
            "coordinator created"
        );
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                transport,
                catalog: Mutex::new(catalog),
                workers,
                alive: DashSet::new(),
                queries: DashMap::new(),
                exchanges: Arc::new(ExchangeRegistry::new()),
                changed: Notify::new(),
                stopped: AtomicBool::new(false),
            }),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            dispatcher: Mutex::new(None),
        })
    }

    /// Spawn the dispatcher task on the current tokio runtime.
    pub fn start(&self) -> Result<()> {
        let inbound = self.inbound_rx.lock().take().ok_or_else(|| {
            StrandError::InvalidConfig("coordinator already started".to_string())
        })?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            StrandError::InvalidConfig(format!(
                "coordinator must start inside a tokio runtime: {e}"
            ))
        })?;
        let handle = runtime.spawn(run_dispatcher(Arc::clone(&self.shared), inbound));
        *self.dispatcher.lock() = Some(handle);
        info!(operator = "CoordinatorInit", "dispatcher started");
        Ok(())
    }

    /// Sender for the inbound queue; the network layer feeds received
    /// messages through it.
    pub fn inbound(&self) -> InboundSender {
        self.inbound_tx.clone()
    }

    /// Queues of exchanges whose consumers run on the coordinator.
    pub fn exchanges(&self) -> Arc<ExchangeRegistry> {
        Arc::clone(&self.shared.exchanges)
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    pub fn workers(&self) -> &HashMap<WorkerId, SocketInfo> {
        &self.shared.workers
    }

    pub fn is_alive(&self, worker: WorkerId) -> bool {
        self.shared.alive.contains(&worker)
    }

    pub fn alive_workers(&self) -> Vec<WorkerId> {
        let mut workers: Vec<WorkerId> = self.shared.alive.iter().map(|w| *w).collect();
        workers.sort();
        workers
    }

    /// Whether the dispatcher task is still consuming inbound messages.
    pub fn dispatcher_running(&self) -> bool {
        self.dispatcher
            .lock()
            .as_ref()
            .map_or(false, |h| !h.is_finished())
    }

    async fn wait_for(&self, mut done: impl FnMut(&Shared<T>) -> bool + Send) {
        let interval = self.shared.config.wait_poll_interval();
        loop {
            let changed = self.shared.changed.notified();
            if done(&self.shared) {
                return;
            }
            let _ = tokio::time::timeout(interval, changed).await;
        }
    }

    fn ensure_known(&self, query_id: QueryId) -> Result<()> {
        if self.shared.queries.contains_key(&query_id) {
            Ok(())
        } else {
            Err(StrandError::InvalidConfig(format!("unknown query {query_id}")))
        }
    }

    /// Register the query, then send each worker its fragment once that
    /// worker is alive. Returns after the last fragment has been sent.
    pub async fn dispatch_worker_query_plans(
        &self,
        query_id: QueryId,
        plans: BTreeMap<WorkerId, Vec<u8>>,
    ) -> Result<()> {
        if plans.is_empty() {
            return Err(StrandError::InvalidConfig(format!(
                "query {query_id} has no worker plans"
            )));
        }
        if let Some(worker) = plans.keys().find(|w| !self.shared.workers.contains_key(w)) {
            return Err(StrandError::InvalidConfig(format!(
                "query {query_id} assigns a plan to unknown worker {worker}"
            )));
        }
        let meta = QueryMeta {
            assigned: plans.keys().enumerate().map(|(i, w)| (*w, i)).collect(),
            ready: bitvec![0; plans.len()],
            executing: plans.keys().copied().collect(),
            started: false,
            failure: None,
        };
        match self.shared.queries.entry(query_id) {
            Entry::Occupied(_) => {
                return Err(StrandError::InvalidConfig(format!(
                    "query {query_id} was already dispatched"
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(meta);
            }
        }
        info!(
            query_id = %query_id,
            workers = plans.len(),
            operator = "CoordinatorDispatch",
            "dispatching worker plans"
        );
        global_metrics().inc_coordinator_query_event("dispatched");

        for (worker, fragment) in plans {
            self.wait_for(|shared| shared.alive.contains(&worker)).await;
            debug!(query_id = %query_id, worker = %worker, bytes = fragment.len(), "sending plan fragment");
            self.shared
                .transport
                .send(worker, TransportMessage::Query(QueryMessage { query_id, fragment }))
                .await?;
        }
        Ok(())
    }

    /// Wait until every assigned worker is alive and has acknowledged its
    /// fragment. There is no timeout.
    pub async fn wait_until_ready(&self, query_id: QueryId) -> Result<()> {
        self.ensure_known(query_id)?;
        self.wait_for(|shared| shared.query_ready(query_id)).await;
        Ok(())
    }

    /// Wait until the query is ready, then send START_QUERY to every assigned
    /// worker. Later calls for the same query send nothing.
    pub async fn start_worker_query(&self, query_id: QueryId) -> Result<()> {
        self.wait_until_ready(query_id).await?;
        let workers: Vec<WorkerId> = {
            let mut meta = self.shared.queries.get_mut(&query_id).ok_or_else(|| {
                StrandError::InvalidConfig(format!("unknown query {query_id}"))
            })?;
            if meta.started {
                debug!(query_id = %query_id, "worker query already started");
                return Ok(());
            }
            meta.started = true;
            meta.assigned.keys().copied().collect()
        };
        info!(
            query_id = %query_id,
            workers = workers.len(),
            operator = "CoordinatorStart",
            "starting worker query"
        );
        for worker in workers {
            self.shared
                .transport
                .send(
                    worker,
                    TransportMessage::Control(ControlMessage::for_query(
                        query_id,
                        ControlKind::StartQuery,
                    )),
                )
                .await?;
        }
        global_metrics().inc_coordinator_query_event("started");
        Ok(())
    }

    /// Drive `plan` to end of stream and collect every tuple it produces.
    pub async fn start_server_query_collect(
        &self,
        query_id: QueryId,
        plan: Box<dyn Operator>,
    ) -> Result<BatchBuffer> {
        let schema = plan.schema().ok_or_else(|| {
            StrandError::InvalidConfig(format!("query {query_id} root has no output schema"))
        })?;
        let batch_size = self.shared.config.engine.batch_size_rows;
        let buffer = self
            .drive(query_id, plan, "collect", move |root, label| {
                let mut buffer = BatchBuffer::with_batch_size(schema, batch_size);
                drive_to_eos(root, label, |batch| batch.compact_into(&mut buffer))?;
                Ok(buffer)
            })
            .await?;
        info!(
            query_id = %query_id,
            rows = buffer.num_tuples(),
            operator = "CoordinatorCollect",
            "query results collected"
        );
        Ok(buffer)
    }

    /// Drive `plan` to end of stream, discarding its output. Returns the
    /// number of tuples the root produced.
    pub async fn start_server_query_drive(
        &self,
        query_id: QueryId,
        plan: Box<dyn Operator>,
    ) -> Result<u64> {
        self.drive(query_id, plan, "drive", |root, label| {
            drive_to_eos(root, label, |_| Ok(()))
        })
        .await
    }

    async fn drive<R, F>(
        &self,
        query_id: QueryId,
        mut plan: Box<dyn Operator>,
        mode: &'static str,
        body: F,
    ) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn Operator, &str) -> Result<R> + Send + 'static,
    {
        self.wait_until_ready(query_id).await?;

        let opened = tokio::task::spawn_blocking(move || match plan.open() {
            Ok(()) => Ok(plan),
            Err(e) => {
                let _ = plan.close();
                Err(e)
            }
        })
        .await
        .map_err(|e| join_error("plan open", e))?;
        let mut plan = match opened {
            Ok(plan) => plan,
            Err(e) => return Err(self.fail_query(query_id, e)),
        };

        if let Err(e) = self.start_worker_query(query_id).await {
            let _ = plan.close();
            return Err(self.fail_query(query_id, e));
        }

        let started = Instant::now();
        let label = query_id.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            let result = body(plan.as_mut(), &label);
            let closed = plan.close();
            let value = result?;
            closed?;
            Ok(value)
        })
        .await
        .map_err(|e| join_error("query driver", e))?;
        let elapsed = started.elapsed();
        global_metrics().observe_drive_seconds(mode, elapsed.as_secs_f64());

        match outcome {
            Ok(value) => {
                info!(
                    query_id = %query_id,
                    mode,
                    elapsed_ms = elapsed.as_millis() as u64,
                    operator = "CoordinatorDrive",
                    "local plan reached end of stream"
                );
                Ok(value)
            }
            Err(e) => Err(self.fail_query(query_id, e)),
        }
    }

    fn fail_query(&self, query_id: QueryId, err: StrandError) -> StrandError {
        if let Some(mut meta) = self.shared.queries.get_mut(&query_id) {
            meta.failure = Some(err.to_string());
        }
        error!(query_id = %query_id, error = %err, operator = "CoordinatorDrive", "query failed");
        global_metrics().inc_coordinator_query_event("failed");
        err
    }

    /// True once every assigned worker has reported completion. Unknown
    /// queries count as complete.
    pub fn query_completed(&self, query_id: QueryId) -> bool {
        self.shared.query_completed(query_id)
    }

    /// Wait for `query_completed` to become true.
    pub async fn wait_for_completion(&self, query_id: QueryId) -> Result<()> {
        self.ensure_known(query_id)?;
        self.wait_for(|shared| shared.query_completed(query_id)).await;
        Ok(())
    }

    pub fn query_status(&self, query_id: QueryId) -> Option<QueryStatus> {
        let meta = self.shared.queries.get(&query_id)?;
        let mut executing: Vec<WorkerId> = meta.executing.iter().copied().collect();
        executing.sort();
        Some(QueryStatus {
            query_id,
            assigned: meta.assigned.keys().copied().collect(),
            ready: meta
                .assigned
                .iter()
                .filter(|(_, index)| meta.ready[**index])
                .map(|(w, _)| *w)
                .collect(),
            executing,
            started: meta.started,
            failure: meta.failure.clone(),
        })
    }

    /// Record a query in the catalog, dispatch its plans, wait for every
    /// worker to be ready and start it.
    pub async fn submit_query(
        &self,
        raw_query: &str,
        logical_ra: &str,
        plans: BTreeMap<WorkerId, Vec<u8>>,
    ) -> Result<QueryId> {
        let query_id = self.shared.catalog.lock().new_query(raw_query, logical_ra)?;
        info!(query_id = %query_id, operator = "CoordinatorSubmit", "query submitted");
        self.dispatch_worker_query_plans(query_id, plans).await?;
        self.wait_until_ready(query_id).await?;
        self.start_worker_query(query_id).await?;
        Ok(query_id)
    }

    /// Stop the dispatcher, tell every alive worker to shut down, then
    /// release the transport and the catalog. Unreachable workers are
    /// logged and skipped. A dispatcher that died on a protocol violation
    /// is reported after cleanup.
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.stopped.store(true, Ordering::Release);
        let handle = self.dispatcher.lock().take();
        let dispatcher_result = match handle {
            Some(handle) => handle
                .await
                .map_err(|e| join_error("dispatcher", e))
                .and_then(|r| r),
            None => Ok(()),
        };

        for worker in self.alive_workers() {
            let message = TransportMessage::Control(ControlMessage::new(ControlKind::Shutdown));
            if let Err(e) = self.shared.transport.send(worker, message).await {
                error!(worker = %worker, error = %e, "fail to reach worker; continue cleaning");
            }
        }
        self.shared.transport.shutdown().await?;
        self.shared.catalog.lock().close()?;
        info!(operator = "CoordinatorShutdown", "coordinator shut down");
        dispatcher_result
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
