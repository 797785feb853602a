//! Sending side of an exchange edge.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use strand_common::{global_metrics, ExchangeId, Result, StrandError, WorkerId};
use strand_execution::operator::expect_children;
use strand_execution::{Batch, BatchBuilder, Operator, OperatorState, Schema};
use tracing::debug;

use crate::message::DataMessage;
use crate::queue::ExchangeRegistry;

/// Delivers data messages to a destination process.
pub trait ExchangeSink: Send + Sync {
    fn send(&self, destination: WorkerId, message: DataMessage) -> Result<()>;
}

/// Sink for producer/consumer pairs inside one process: messages go
/// straight into the local registry, tagged with `sender`.
#[derive(Debug, Clone)]
pub struct LocalSink {
    sender: WorkerId,
    registry: Arc<ExchangeRegistry>,
}

impl LocalSink {
    pub fn new(sender: WorkerId, registry: Arc<ExchangeRegistry>) -> Self {
        Self { sender, registry }
    }
}

impl ExchangeSink for LocalSink {
    fn send(&self, _destination: WorkerId, message: DataMessage) -> Result<()> {
        self.registry.deliver(self.sender, message);
        Ok(())
    }
}

/// Where a producer's batches go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Everything to one destination.
    Collect(WorkerId),
    /// Every batch to every destination.
    Broadcast(Vec<WorkerId>),
    /// Rows hash-partitioned on `key_column`.
    Shuffle {
        destinations: Vec<WorkerId>,
        key_column: usize,
    },
}

impl Routing {
    pub fn destinations(&self) -> &[WorkerId] {
        match self {
            Routing::Collect(dest) => std::slice::from_ref(dest),
            Routing::Broadcast(dests) => dests,
            Routing::Shuffle { destinations, .. } => destinations,
        }
    }
}

fn partition_of(batch: &Batch, column: usize, row: usize, partitions: usize) -> Result<usize> {
    let mut hasher = DefaultHasher::new();
    batch.value(column, row)?.hash(&mut hasher);
    Ok((hasher.finish() % partitions as u64) as usize)
}

/// Pulls its child and ships every batch over the exchange identified by
/// `exchange_id`, followed by EOI at each round end and EOS at the end.
///
/// Batches are passed through to the parent unchanged, so a producer can sit
/// at the root of a fragment that is driven for its side effects.
pub struct Producer {
    state: OperatorState,
    children: Vec<Box<dyn Operator>>,
    exchange_id: ExchangeId,
    routing: Routing,
    sink: Arc<dyn ExchangeSink>,
}

impl Producer {
    pub fn new(
        exchange_id: ExchangeId,
        routing: Routing,
        sink: Arc<dyn ExchangeSink>,
    ) -> Result<Self> {
        if routing.destinations().is_empty() {
            return Err(StrandError::InvalidConfig(format!(
                "producer for exchange {exchange_id} has no destinations"
            )));
        }
        Ok(Self {
            state: OperatorState::default(),
            children: Vec::new(),
            exchange_id,
            routing,
            sink,
        })
    }

    pub fn with_child(mut self, child: Box<dyn Operator>) -> Result<Self> {
        self.set_children(vec![child])?;
        Ok(self)
    }

    pub fn exchange_id(&self) -> ExchangeId {
        self.exchange_id
    }

    fn broadcast(&self, message: impl Fn() -> DataMessage) -> Result<()> {
        for dest in self.routing.destinations() {
            self.sink.send(*dest, message())?;
        }
        Ok(())
    }

    fn send_batch(&self, batch: &Batch) -> Result<()> {
        match &self.routing {
            Routing::Collect(dest) => self
                .sink
                .send(*dest, DataMessage::from_batch(self.exchange_id, batch)?)?,
            Routing::Broadcast(dests) => {
                let message = DataMessage::from_batch(self.exchange_id, batch)?;
                for dest in dests {
                    self.sink.send(*dest, message.clone())?;
                }
            }
            Routing::Shuffle {
                destinations,
                key_column,
            } => {
                let mut parts: Vec<BatchBuilder> = destinations
                    .iter()
                    .map(|_| {
                        BatchBuilder::with_capacity(batch.schema().clone(), batch.num_tuples())
                    })
                    .collect();
                for row in 0..batch.num_tuples() {
                    let p = partition_of(batch, *key_column, row, destinations.len())?;
                    parts[p].append_row(batch, row)?;
                }
                for (dest, part) in destinations.iter().zip(parts.iter_mut()) {
                    if part.is_empty() {
                        continue;
                    }
                    let piece = part.finish()?;
                    self.sink
                        .send(*dest, DataMessage::from_batch(self.exchange_id, &piece)?)?;
                }
            }
        }
        global_metrics()
            .record_exchange_rows_sent(&self.exchange_id.to_string(), batch.num_tuples() as u64);
        Ok(())
    }
}

impl Operator for Producer {
    fn name(&self) -> &'static str {
        "Producer"
    }

    fn state(&self) -> &OperatorState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperatorState {
        &mut self.state
    }

    fn children(&self) -> &[Box<dyn Operator>] {
        &self.children
    }

    fn children_mut(&mut self) -> &mut [Box<dyn Operator>] {
        &mut self.children
    }

    fn set_children(&mut self, children: Vec<Box<dyn Operator>>) -> Result<()> {
        expect_children(self.name(), 1, &children)?;
        if let Routing::Shuffle { key_column, .. } = &self.routing {
            let width = children[0].schema().map_or(0, |s| s.num_columns());
            if *key_column >= width {
                return Err(StrandError::InvalidConfig(format!(
                    "shuffle key column {key_column} out of range for input with {width} columns"
                )));
            }
        }
        self.children = children;
        Ok(())
    }

    fn schema(&self) -> Option<Schema> {
        self.children.first().and_then(|c| c.schema())
    }

    fn fetch_next(&mut self) -> Result<Option<Batch>> {
        let child = self.children.first_mut().ok_or_else(|| {
            StrandError::Execution("producer pulled without a child".to_string())
        })?;
        match child.next()? {
            Some(batch) => {
                self.send_batch(&batch)?;
                Ok(Some(batch))
            }
            None if child.eos() => {
                let id = self.exchange_id;
                self.broadcast(|| DataMessage::eos(id))?;
                self.state.set_eos();
                debug!(operator = "Producer", exchange_id = %id, "sent end of stream");
                Ok(None)
            }
            None if child.eoi() => {
                child.set_eoi(false);
                let id = self.exchange_id;
                self.broadcast(|| DataMessage::eoi(id))?;
                self.state.set_eoi(true);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn check_eos_and_eoi(&mut self) {}
}
