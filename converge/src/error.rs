//! Engine error types.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while driving a remote operation to convergence.
///
/// `E` is the caller's own error type for remote calls. Synthesized variants
/// keep the underlying error or last observed status for diagnostics.
#[derive(Debug, Error)]
pub enum Error<E> {
    /// The remote call failed with a non-retryable error.
    #[error("request rejected: {0}")]
    Fatal(#[source] E),

    /// Retryable errors persisted past the time budget.
    #[error("timed out retrying after {attempts} attempts ({elapsed:?}): {last}")]
    RetryTimeout {
        attempts: u32,
        elapsed: Duration,
        #[source]
        last: E,
    },

    /// The resource reached a known-bad terminal status.
    #[error("resource {id} reached failure state {status}")]
    FailureState { id: String, status: String },

    /// The resource reported a status outside the declared pending, target and failure sets.
    #[error("resource {id} entered unexpected state {status}")]
    UnexpectedState { id: String, status: String },

    /// No target or failure status was observed before the timeout.
    #[error(
        "timed out after {timeout:?} waiting for resource {id} (last status: {})",
        .last_status.as_deref().unwrap_or("none")
    )]
    ConvergeTimeout {
        id: String,
        timeout: Duration,
        last_status: Option<String>,
    },

    /// The resource kept being reported as absent while absence was not a target.
    #[error("resource {id} not found after {checks} checks")]
    Vanished { id: String, checks: u32 },

    /// A cancellation token fired while the operation was waiting.
    ///
    /// `last` is the retryable error that preceded a cancelled backoff.
    #[error("{operation} cancelled")]
    Cancelled {
        operation: String,
        #[source]
        last: Option<E>,
    },

    /// The server handed back a page cursor that was already consumed.
    #[error("page cursor {token:?} was already consumed")]
    CursorRepeated { token: String },

    /// An operation was composed from an invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl<E> Error<E> {
    /// The remote error behind this failure, if there is one.
    pub fn underlying(&self) -> Option<&E> {
        match self {
            Error::Fatal(e) => Some(e),
            Error::RetryTimeout { last, .. } => Some(last),
            Error::Cancelled { last, .. } => last.as_ref(),
            _ => None,
        }
    }

    /// Whether the failure was caused by a time budget running out.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::RetryTimeout { .. } | Error::ConvergeTimeout { .. }
        )
    }
}

/// Errors in engine configuration, detected before any remote call is made.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("status {0} is both a target and a failure status")]
    OverlappingStatus(String),

    #[error("no target status given and absence is not accepted")]
    NoTarget,

    #[error("page size must be at least 1")]
    ZeroPageSize,

    #[error("poll interval must be non-zero")]
    ZeroPollInterval,

    #[error("invalid status {0:?}")]
    InvalidStatus(String),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}
