//! Error types for the hypervisor client core.

use thiserror::Error;

/// Errors that can occur while mediating between the caller and the
/// hypervisor endpoint.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// A SOAP/HTTP call to the endpoint failed at the transport level.
    ///
    /// The session monitor marks the session faulted and tears it down; the
    /// next tick reconnects. Never retried inline.
    #[error("transport fault talking to {endpoint}: {source}")]
    TransportFault {
        endpoint: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A long-running hypervisor task (power op, reconfigure, clone, ...)
    /// terminated in the `error` state.
    #[error("task failed: {0}")]
    TaskError(String),

    /// Caller-supplied argument is invalid for the requested operation
    /// (unknown `Reconfigure` feature key, `Save` against an untagged
    /// template's disk, malformed blank-disk template name, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The VM, snapshot, question, or managed reference named by the caller
    /// is not present in this client's view of the endpoint.
    #[error("not found: {0}")]
    NotFound(String),

    /// The client attempted the one permitted retry after a race (e.g. a
    /// cache-remove lost to a concurrent reconcile) and still failed.
    #[error("operation did not complete after retry: {0}")]
    RaceRetry(String),

    /// Internal invariant violation or state the client cannot make sense
    /// of (malformed property value, missing required managed reference).
    #[error("internal error: {0}")]
    Internal(String),
}

impl HypervisorError {
    pub fn transport(endpoint: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::TransportFault {
            endpoint: endpoint.into(),
            source: Box::new(source),
        }
    }

    /// `ServerTooBusy`-class transport fault: the session monitor tears down
    /// the session regardless of what the caller does with the error.
    pub fn is_server_too_busy(&self) -> bool {
        matches!(self, HypervisorError::TransportFault { source, .. }
            if source.to_string().to_lowercase().contains("too busy"))
    }
}

/// Result type alias for hypervisor client operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
