//! Transport contract between the coordinator and workers.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use strand_common::{Result, StrandError, WorkerId};
use strand_exchange::{DataMessage, ExchangeSink, TransportMessage};
use tokio::sync::mpsc;
use tracing::debug;

/// One message received by the coordinator, tagged with its sender.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub sender: WorkerId,
    pub message: TransportMessage,
}

/// Producer half of the coordinator's inbound queue.
pub type InboundSender = mpsc::UnboundedSender<InboundMessage>;

#[async_trait]
/// Outbound side of the wire. Message framing and connection management
/// live behind this trait.
pub trait Transport: Send + Sync + 'static {
    /// Deliver `message` to `worker`, completing once the send has finished.
    async fn send(&self, worker: WorkerId, message: TransportMessage) -> Result<()>;
    /// Release all connections. Sends after shutdown fail.
    async fn shutdown(&self) -> Result<()>;
}

/// In-process transport: one channel per connected worker, plus a log of
/// every message sent.
#[derive(Debug, Default)]
pub struct InProcessTransport {
    outboxes: DashMap<WorkerId, mpsc::UnboundedSender<TransportMessage>>,
    sent: Mutex<Vec<(WorkerId, TransportMessage)>>,
    shut_down: AtomicBool,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the channel for `worker` and return its receiving end.
    pub fn connect_worker(&self, worker: WorkerId) -> mpsc::UnboundedReceiver<TransportMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outboxes.insert(worker, tx);
        rx
    }

    pub fn sent_messages(&self) -> Vec<(WorkerId, TransportMessage)> {
        self.sent.lock().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn send(&self, worker: WorkerId, message: TransportMessage) -> Result<()> {
        if self.is_shut_down() {
            return Err(StrandError::Execution("transport is shut down".to_string()));
        }
        self.sent.lock().push((worker, message.clone()));
        let outbox = self
            .outboxes
            .get(&worker)
            .ok_or_else(|| StrandError::Execution(format!("no connection to worker {worker}")))?;
        outbox
            .send(message)
            .map_err(|_| StrandError::Execution(format!("worker {worker} disconnected")))
    }

    async fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::Release);
        self.outboxes.clear();
        debug!("in-process transport shut down");
        Ok(())
    }
}

/// Exchange sink writing into a coordinator's inbound queue, as a remote
/// worker's producer would over the wire.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: WorkerId,
    inbound: InboundSender,
}

impl ChannelSink {
    pub fn new(sender: WorkerId, inbound: InboundSender) -> Self {
        Self { sender, inbound }
    }
}

impl ExchangeSink for ChannelSink {
    fn send(&self, _destination: WorkerId, message: DataMessage) -> Result<()> {
        self.inbound
            .send(InboundMessage {
                sender: self.sender,
                message: TransportMessage::Data(message),
            })
            .map_err(|_| StrandError::Execution("coordinator inbound queue closed".to_string()))
    }
}
