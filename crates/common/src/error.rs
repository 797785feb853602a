use thiserror::Error;

/// Canonical strand error taxonomy used across crates.
///
/// Classification guidance:
/// - [`StrandError::InvalidConfig`]: problems detected while building an operator or query
/// - [`StrandError::Execution`]: failures surfaced from `fetch_next` while a tree runs
/// - [`StrandError::Protocol`]: a message arrived at an endpoint where it is meaningless
/// - [`StrandError::Catalog`]: catalog load/store failures (abort startup)
/// - [`StrandError::Unsupported`]: misuse of an API the callee never supports
/// - [`StrandError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum StrandError {
    /// Invalid or inconsistent configuration.
    ///
    /// Examples:
    /// - aggregate op mask that is empty or not supported by the column type
    /// - plan document missing a required field
    /// - merge join with an empty key-column list
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Runtime execution failures after construction succeeded.
    ///
    /// Examples:
    /// - typed accessor used on a column of another type
    /// - wire payload whose columns disagree with the consumer schema
    /// - operator pulled before it was opened
    #[error("execution error: {0}")]
    Execution(String),

    /// Internal-consistency failure of the message protocol. Never retried.
    ///
    /// Examples:
    /// - `START_QUERY` or `SHUTDOWN` control message received by the coordinator
    /// - any `QUERY` message received by the coordinator
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Catalog could not be read, parsed or persisted.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid call shape that the receiver never supports.
    ///
    /// Examples:
    /// - wiring children into a leaf operator
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Standard strand result alias.
pub type Result<T> = std::result::Result<T, StrandError>;
