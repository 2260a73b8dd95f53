//! Client-level error types.

use thiserror::Error;

use crate::request::JsonRpcError;

/// Errors that can occur during an RPC call or subscription operation.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Peer unreachable, or the connection dropped while the call was in flight.
    #[error("connection error: {0}")]
    Connection(String),

    /// No response was correlated within the configured duration.
    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The node returned a well-formed JSON-RPC error object.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Application(JsonRpcError),

    /// A subscription for this query is already active.
    #[error("already subscribed to query: {query}")]
    DuplicateSubscription { query: String },

    /// `unsubscribe` for a query that has no live subscription.
    #[error("not subscribed to query: {query}")]
    SubscriptionNotFound { query: String },

    /// The event filter expression could not be parsed.
    #[error("invalid query {query:?}: {reason}")]
    InvalidQuery { query: String, reason: String },

    /// Malformed or unexpected frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A result payload could not be decoded into the requested type.
    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// The endpoint address is not usable.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A caller-supplied argument could not be encoded for the node.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The node serves a different chain than the client was built for.
    #[error("network mismatch: expected {expected}, node reports {actual}")]
    NetworkMismatch { expected: String, actual: String },

    /// The client has been shut down.
    #[error("client closed")]
    Closed,
}

impl RpcError {
    /// Returns `true` for transient failures a caller may choose to retry.
    ///
    /// The client itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout { .. })
    }

    /// Returns `true` if the node itself rejected the request.
    pub fn is_application_error(&self) -> bool {
        matches!(self, Self::Application(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
