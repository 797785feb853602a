use std::env;

use serde::{Deserialize, Serialize};

/// Default number of tuples a sealed batch may hold.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of tuples per batch produced by builders and buffers.
    pub batch_size_rows: usize,
    /// Bounded wait used by exchange consumers when their inbound queue is empty.
    pub consumer_poll_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size_rows: DEFAULT_BATCH_SIZE,
            consumer_poll_timeout_ms: 100,
        }
    }
}

impl EngineConfig {
    /// Overlay `STRAND_BATCH_SIZE_ROWS` / `STRAND_CONSUMER_POLL_MS` on the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size_rows: env_parse_or("STRAND_BATCH_SIZE_ROWS", defaults.batch_size_rows)
                .max(1),
            consumer_poll_timeout_ms: env_parse_or(
                "STRAND_CONSUMER_POLL_MS",
                defaults.consumer_poll_timeout_ms,
            ),
        }
    }
}

/// Logging setup handed to [`crate::logging::init_logging`] at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `strand_distributed=debug,info`.
    pub filter: String,
    /// Emit span/target information with each event.
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Read the filter from `STRAND_LOG`, falling back to `info`.
    pub fn from_env() -> Self {
        Self {
            filter: env::var("STRAND_LOG").unwrap_or_else(|_| "info".to_string()),
            ..Self::default()
        }
    }
}

/// Parse `key` from the environment, falling back to `default` when unset or unparsable.
pub fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
