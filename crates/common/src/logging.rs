//! Explicit tracing subscriber setup.
//!
//! Levels are never mutated globally after start; callers build a
//! [`LoggingConfig`] and pass it here once.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{Result, StrandError};

/// Install the global fmt subscriber described by `config`.
///
/// Fails with [`StrandError::InvalidConfig`] for an unparsable filter or when a
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter).map_err(|e| {
        StrandError::InvalidConfig(format!("invalid log filter '{}': {e}", config.filter))
    })?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .try_init()
        .map_err(|e| StrandError::InvalidConfig(format!("logging already initialised: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unparsable_filter() {
        let cfg = LoggingConfig {
            filter: "strand=notalevel".to_string(),
            with_target: false,
        };
        assert!(matches!(
            init_logging(&cfg),
            Err(StrandError::InvalidConfig(_))
        ));
    }
}
