use crate::protocol::ErrorCode;
use crate::types::BrokerId;
use thiserror::Error;

/// Result type alias for offset management operations
pub type Result<T> = std::result::Result<T, OffsetError>;

/// Errors raised while tracking and committing consumer offsets.
///
/// The type is `Clone` because a single transport failure on a broker
/// manager is delivered to every partition attached to it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OffsetError {
    /// The coordinator client was closed before the operation started
    #[error("Tried to use a client that was closed")]
    ClosedClient,

    /// Invalid configuration or duplicate registration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The broker response did not cover every requested partition
    #[error("Response did not contain all the expected topic/partition blocks")]
    IncompleteResponse,

    /// Per-partition error code reported by the broker
    #[error("Broker error: {code}")]
    Broker { code: ErrorCode },

    /// The request could not be delivered or its response could not be read
    #[error("Transport error: {0}")]
    Transport(String),

    /// Coordinator discovery failed
    #[error("Coordinator error: {0}")]
    Coordinator(String),

    /// The broker offset manager stopped accepting partitions
    #[error("Offset manager for broker {broker} is closed")]
    BrokerClosed { broker: BrokerId },

    /// Coordinator resolution kept failing until the retry budget ran out
    #[error("Coordinator resolution failed after {attempts} attempts")]
    RetriesExhausted { attempts: usize },

    /// I/O failure while loading configuration
    #[error("IO error: {0}")]
    Io(String),

    /// Metric registration failure
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Errors still buffered when a partition offset manager was closed
    #[error("{} errors while closing partition offset manager", .0.len())]
    Errors(Vec<OffsetError>),
}

impl From<std::io::Error> for OffsetError {
    fn from(err: std::io::Error) -> Self {
        OffsetError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for OffsetError {
    fn from(err: toml::de::Error) -> Self {
        OffsetError::Configuration(err.to_string())
    }
}

impl From<prometheus::Error> for OffsetError {
    fn from(err: prometheus::Error) -> Self {
        OffsetError::Metrics(err.to_string())
    }
}

impl From<ErrorCode> for OffsetError {
    fn from(code: ErrorCode) -> Self {
        OffsetError::Broker { code }
    }
}

/// Error categories for metrics and monitoring
impl OffsetError {
    /// Get the error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            OffsetError::ClosedClient => "closed_client",
            OffsetError::Configuration(_) => "configuration",
            OffsetError::IncompleteResponse => "incomplete_response",
            OffsetError::Broker { .. } => "broker",
            OffsetError::Transport(_) => "transport",
            OffsetError::Coordinator(_) => "coordinator",
            OffsetError::BrokerClosed { .. } => "broker_closed",
            OffsetError::RetriesExhausted { .. } => "retries_exhausted",
            OffsetError::Io(_) => "io",
            OffsetError::Metrics(_) => "metrics",
            OffsetError::Errors(_) => "multiple",
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            OffsetError::Transport(_)
            | OffsetError::Coordinator(_)
            | OffsetError::BrokerClosed { .. }
            | OffsetError::IncompleteResponse => true,

            OffsetError::Broker { code } => code.is_retriable(),

            OffsetError::ClosedClient
            | OffsetError::Configuration(_)
            | OffsetError::RetriesExhausted { .. }
            | OffsetError::Io(_)
            | OffsetError::Metrics(_)
            | OffsetError::Errors(_) => false,
        }
    }
}
