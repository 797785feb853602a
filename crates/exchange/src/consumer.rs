//! Receiving side of an exchange edge.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use strand_common::{global_metrics, EngineConfig, ExchangeId, Result, StrandError, WorkerId};
use strand_execution::operator::leaf_children;
use strand_execution::{Batch, Operator, OperatorState, Schema};
use tracing::{debug, warn};

use crate::message::DataMessageKind;
use crate::queue::{ExchangeRegistry, InboundQueue};

/// Leaf operator fed by an inbound exchange queue.
///
/// EOS is reached once every source has sent EOS. A round ends (EOI) once
/// every source that has not finished has sent EOI for it.
pub struct Consumer {
    state: OperatorState,
    exchange_id: ExchangeId,
    schema: Schema,
    queue: Arc<InboundQueue>,
    sources: HashSet<WorkerId>,
    finished: HashSet<WorkerId>,
    round_done: HashSet<WorkerId>,
    poll_timeout: Duration,
}

impl Consumer {
    pub fn new(
        exchange_id: ExchangeId,
        schema: Schema,
        sources: impl IntoIterator<Item = WorkerId>,
        registry: &ExchangeRegistry,
    ) -> Result<Self> {
        let sources: HashSet<WorkerId> = sources.into_iter().collect();
        if sources.is_empty() {
            return Err(StrandError::InvalidConfig(format!(
                "consumer for exchange {exchange_id} has no sources"
            )));
        }
        Ok(Self {
            state: OperatorState::default(),
            exchange_id,
            schema,
            queue: registry.queue(exchange_id),
            sources,
            finished: HashSet::new(),
            round_done: HashSet::new(),
            poll_timeout: Duration::from_millis(EngineConfig::default().consumer_poll_timeout_ms),
        })
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn exchange_id(&self) -> ExchangeId {
        self.exchange_id
    }

    fn round_complete(&self) -> bool {
        !self.round_done.is_empty()
            && self
                .sources
                .iter()
                .all(|s| self.finished.contains(s) || self.round_done.contains(s))
    }
}

impl Operator for Consumer {
    fn name(&self) -> &'static str {
        "Consumer"
    }

    fn state(&self) -> &OperatorState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperatorState {
        &mut self.state
    }

    fn children(&self) -> &[Box<dyn Operator>] {
        &[]
    }

    fn children_mut(&mut self) -> &mut [Box<dyn Operator>] {
        &mut []
    }

    fn set_children(&mut self, children: Vec<Box<dyn Operator>>) -> Result<()> {
        leaf_children(self.name(), children)
    }

    fn schema(&self) -> Option<Schema> {
        Some(self.schema.clone())
    }

    fn fetch_next(&mut self) -> Result<Option<Batch>> {
        loop {
            let Some(item) = self.queue.poll(self.poll_timeout) else {
                return Ok(None);
            };
            if !self.sources.contains(&item.sender) {
                return Err(StrandError::Execution(format!(
                    "exchange {} received data from unexpected worker {}",
                    self.exchange_id, item.sender
                )));
            }
            global_metrics().inc_exchange_messages_received(item.message.kind.label());
            match item.message.kind {
                DataMessageKind::Normal => {
                    return item.message.to_batch(&self.schema).map(Some);
                }
                DataMessageKind::Eos => {
                    if !self.finished.insert(item.sender) {
                        warn!(
                            exchange_id = %self.exchange_id,
                            sender = %item.sender,
                            "duplicate end of stream ignored"
                        );
                    }
                    self.round_done.remove(&item.sender);
                    if self.finished.len() == self.sources.len() {
                        debug!(exchange_id = %self.exchange_id, "all sources finished");
                        self.state.set_eos();
                        return Ok(None);
                    }
                }
                DataMessageKind::Eoi => {
                    if !self.round_done.insert(item.sender) {
                        warn!(
                            exchange_id = %self.exchange_id,
                            sender = %item.sender,
                            "end of iteration merged into the open round"
                        );
                    }
                }
            }
            if self.round_complete() {
                self.round_done.clear();
                self.state.set_eoi(true);
                return Ok(None);
            }
        }
    }

    fn check_eos_and_eoi(&mut self) {}
}
