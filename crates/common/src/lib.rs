//! Shared configuration, error types, IDs, logging and observability primitives for strand crates.
//!
//! Architecture role:
//! - defines engine/coordinator configuration passed across layers
//! - provides common [`StrandError`] / [`Result`] contracts
//! - hosts metrics and explicit logging initialisation
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`logging`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod logging;
pub mod metrics;

pub use config::{env_parse_or, EngineConfig, LoggingConfig, DEFAULT_BATCH_SIZE};
pub use error::{Result, StrandError};
pub use ids::{ExchangeId, QueryId, WorkerId};
pub use logging::init_logging;
pub use metrics::{global_metrics, MetricsRegistry};
