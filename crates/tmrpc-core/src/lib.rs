//! tmrpc-core — foundation traits and types for TmRPC.
//!
//! # Overview
//!
//! TmRPC is a client for the JSON-RPC interface of a Tendermint-based
//! blockchain node. The core crate defines:
//!
//! - [`RpcTransport`] — the async trait the typed node calls run over
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`] / [`Inbound`] — wire types
//! - [`RpcError`] — the error taxonomy surfaced to callers
//! - [`ClientConfig`] / [`NetworkKind`] — client configuration
//! - [`query`] module — the event filter language used by subscriptions

pub mod config;
pub mod error;
pub mod query;
pub mod request;
pub mod transport;

pub use config::{ClientConfig, NetworkKind};
pub use error::RpcError;
pub use query::Query;
pub use request::{
    Event, Inbound, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ResponsePayload, RpcId,
    RpcParams,
};
pub use transport::{HealthStatus, RpcTransport};
