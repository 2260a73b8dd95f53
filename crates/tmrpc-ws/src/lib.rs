//! tmrpc-ws — WebSocket JSON-RPC client for Tendermint-style nodes.
//!
//! # Features
//! - Request multiplexing over a single connection, matched by id
//! - Per-call timeouts that never leave pending state behind
//! - Passive reconnect: the next call after a drop dials again
//! - Event subscriptions keyed by query, at most one per query
//! - Re-subscribe after reconnect

pub mod client;
pub mod correlator;
pub mod subscriptions;
pub mod transport;

pub use client::WsRpcClient;
pub use correlator::{Correlator, PendingTable};
pub use subscriptions::{EventStream, SubscriptionRegistry};
pub use transport::{websocket_url, ConnectionState, FrameHandler, TransportConfig, WsTransport};
