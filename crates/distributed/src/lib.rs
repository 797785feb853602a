//! Query coordination for strand deployments.
//!
//! Architecture role:
//! - deployment catalog (master/worker sockets and the query log)
//! - transport contract plus an in-process implementation
//! - coordinator: liveness, plan dispatch, query start and completion
//!
//! Key modules:
//! - [`catalog`]
//! - [`coordinator`]
//! - [`transport`]

pub mod catalog;
pub mod coordinator;
pub mod transport;

pub use catalog::{Catalog, QueryRecord, SocketInfo};
pub use coordinator::{Coordinator, CoordinatorConfig, QueryStatus};
pub use transport::{ChannelSink, InProcessTransport, InboundMessage, InboundSender, Transport};
