//! The error taxonomy shared by every stage of the delivery pipeline.

use std::time::Duration;

use thiserror::Error;

/// Errors produced inside the agent.
///
/// Capture entry points never surface these to the host; they exist so the
/// resilience pipeline can decide what to retry, what to drop and what to
/// park in the offline store. `Clone` because idempotent submissions share a
/// single settled result between callers.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum AgentError {
    /// Invalid or missing init fields. Fatal at init time; the agent becomes
    /// a no-op that logs once.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Network or transport failure before an HTTP status was received.
    /// Retryable; feeds the circuit breaker.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The server asked us to come back later (5xx, 429, 408, 425).
    /// Retryable; feeds the circuit breaker. `retry_after` is a lower bound
    /// on the next delay when the server sent one.
    #[error("server returned retryable status {status}")]
    ServerRetryable {
        /// HTTP status code.
        status: u16,
        /// Parsed `Retry-After` value, if the server sent one.
        retry_after: Option<Duration>,
    },

    /// The server rejected the payload outright (other 4xx). Not retried;
    /// the item is dropped from the store with a debug log.
    #[error("server returned terminal status {status}")]
    ServerTerminal {
        /// HTTP status code.
        status: u16,
    },

    /// The circuit breaker refused the call. The item remains enqueued and
    /// the refusal does not count as a retry.
    #[error("circuit open for {endpoint}")]
    CircuitOpen {
        /// The per-feature endpoint whose breaker is open.
        endpoint: String,
    },

    /// A cancellation signal fired. The item remains enqueued.
    #[error("operation aborted")]
    Aborted,

    /// The persistent store is unavailable; the agent fell back to an
    /// in-memory queue with reduced capacity.
    #[error("persistent store degraded: {0}")]
    StorageDegraded(String),

    /// Unexpected failure inside the agent itself. Caught at every capture
    /// boundary; never propagated to the host.
    #[error("internal agent error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Whether this failure is worth another attempt.
    ///
    /// Unclassified internal errors default to retryable only for idempotent
    /// operations.
    pub fn is_retryable(&self, idempotent: bool) -> bool {
        match self {
            AgentError::Transport(_) | AgentError::ServerRetryable { .. } => true,
            AgentError::Config(_)
            | AgentError::ServerTerminal { .. }
            | AgentError::CircuitOpen { .. }
            | AgentError::Aborted => false,
            AgentError::StorageDegraded(_) => false,
            AgentError::Internal(_) => idempotent,
        }
    }

    /// Server-requested minimum delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AgentError::ServerRetryable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// A specialized `Result` for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;
