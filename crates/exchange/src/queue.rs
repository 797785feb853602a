//! Per-exchange inbound FIFOs.
//!
//! The dispatcher (or an in-process producer) offers items; a consumer
//! operator polls them with a bounded wait so it never blocks forever on a
//! silent edge.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use strand_common::{ExchangeId, WorkerId};
use tracing::trace;

use crate::message::DataMessage;

/// One received item: who sent it and what it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeData {
    pub sender: WorkerId,
    pub message: DataMessage,
}

#[derive(Debug, Default)]
pub struct InboundQueue {
    items: Mutex<VecDeque<ExchangeData>>,
    available: Condvar,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&self, item: ExchangeData) {
        self.items.lock().push_back(item);
        self.available.notify_one();
    }

    /// Pop the oldest item, waiting at most `timeout` for one to arrive.
    pub fn poll(&self, timeout: Duration) -> Option<ExchangeData> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            if self.available.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inbound queues keyed by exchange identity, created by whichever side
/// touches an identity first.
#[derive(Debug, Default)]
pub struct ExchangeRegistry {
    queues: DashMap<ExchangeId, Arc<InboundQueue>>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, exchange_id: ExchangeId) -> Arc<InboundQueue> {
        Arc::clone(
            self.queues
                .entry(exchange_id)
                .or_insert_with(|| Arc::new(InboundQueue::new()))
                .value(),
        )
    }

    /// Route a received data message to its exchange's queue.
    pub fn deliver(&self, sender: WorkerId, message: DataMessage) {
        trace!(
            exchange_id = %message.exchange_id,
            sender = %sender,
            kind = message.kind.label(),
            "enqueue exchange data"
        );
        self.queue(message.exchange_id)
            .offer(ExchangeData { sender, message });
    }

    pub fn remove(&self, exchange_id: ExchangeId) -> Option<Arc<InboundQueue>> {
        self.queues.remove(&exchange_id).map(|(_, q)| q)
    }

    pub fn contains(&self, exchange_id: ExchangeId) -> bool {
        self.queues.contains_key(&exchange_id)
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn poll_times_out_on_empty_queue() {
        let q = InboundQueue::new();
        let started = Instant::now();
        assert!(q.poll(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn poll_wakes_on_offer_and_keeps_fifo_order() {
        let registry = Arc::new(ExchangeRegistry::new());
        let id = ExchangeId::next();
        let queue = registry.queue(id);
        let producer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for _ in 0..3 {
                    registry.deliver(WorkerId(1), DataMessage::eoi(id));
                }
                registry.deliver(WorkerId(1), DataMessage::eos(id));
            })
        };
        let mut kinds = Vec::new();
        while kinds.len() < 4 {
            if let Some(item) = queue.poll(Duration::from_secs(5)) {
                kinds.push(item.message.kind.label());
            }
        }
        producer.join().expect("producer thread");
        assert_eq!(kinds, vec!["eoi", "eoi", "eoi", "eos"]);
    }

    #[test]
    fn queue_is_created_by_first_touch() {
        let registry = ExchangeRegistry::new();
        let id = ExchangeId::next();
        registry.deliver(WorkerId(2), DataMessage::eos(id));
        assert!(registry.contains(id));
        assert_eq!(registry.queue(id).len(), 1);
        assert!(registry.remove(id).is_some());
        assert!(registry.is_empty());
    }
}
