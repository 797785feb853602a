//! Cross-worker exchange primitives.
//!
//! Architecture role:
//! - wire message model (data, control, query) and the column codec
//! - per-exchange inbound queues fed by the dispatcher
//! - producer / consumer operators that turn local pulls into messages and back
//!
//! Key modules:
//! - [`message`]
//! - [`queue`]
//! - [`producer`]
//! - [`consumer`]

pub mod consumer;
pub mod message;
pub mod producer;
pub mod queue;

pub use consumer::Consumer;
pub use message::{
    ColumnData, ColumnMessage, ControlKind, ControlMessage, DataMessage, DataMessageKind,
    QueryMessage, TransportMessage,
};
pub use producer::{ExchangeSink, LocalSink, Producer, Routing};
pub use queue::{ExchangeData, ExchangeRegistry, InboundQueue};
