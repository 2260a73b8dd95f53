//! The `RpcTransport` trait — the seam between typed node calls and the wire.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RpcError;
use crate::request::RpcParams;

/// Connection health as last observed by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// A connection to the node is currently open.
    Healthy,
    /// The last connection attempt failed or the connection dropped.
    Unhealthy,
    /// No connection has been attempted yet.
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A transport able to run one correlated JSON-RPC call.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and can be stored as `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Issue `method` with `params` and wait for the correlated result.
    ///
    /// Node-side errors come back as [`RpcError::Application`].
    async fn request(&self, method: &str, params: RpcParams) -> Result<Value, RpcError>;

    /// Return the current health status of this transport.
    fn health(&self) -> HealthStatus {
        HealthStatus::Unknown
    }

    /// Return the transport's endpoint URL.
    fn url(&self) -> &str;
}
