//! Typed identifiers shared across coordinator, exchange and runtime components.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Stable query identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a process taking part in query execution.
///
/// The coordinator always uses [`WorkerId::MASTER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(
    /// Raw numeric id value.
    pub u32,
);

impl WorkerId {
    /// Id reserved for the coordinator process.
    pub const MASTER: WorkerId = WorkerId(0);
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_EXCHANGE_ID: AtomicU64 = AtomicU64::new(1);

/// Routing key of one dataflow edge between a producer and a consumer.
///
/// Ids minted with [`ExchangeId::next`] are unique within the process; ids
/// received on the wire are rebuilt with [`ExchangeId::from_existing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExchangeId(u64);

impl ExchangeId {
    /// Mint a new process-unique id.
    pub fn next() -> Self {
        Self(NEXT_EXCHANGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild an id that was assigned elsewhere in the distributed plan.
    pub fn from_existing(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value, as carried on the wire.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
