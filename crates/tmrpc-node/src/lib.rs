//! tmrpc-node — typed node operations for TmRPC.
//!
//! [`NodeClient`] wraps any [`RpcTransport`](tmrpc_core::RpcTransport) and
//! exposes the node's RPC surface as typed calls: status and health probes,
//! block / commit / validator / transaction lookups, broadcast in the three
//! delivery modes, and the application's ABCI queries.
//!
//! # Quick start
//! ```rust,no_run
//! use tmrpc_core::NetworkKind;
//! use tmrpc_node::NodeClient;
//!
//! # async fn run() -> Result<(), tmrpc_core::RpcError> {
//! let client = NodeClient::new("tcp://127.0.0.1:26657", NetworkKind::TestNet)?;
//! let status = client.status().await?;
//! println!("height {}", status.sync_info.latest_block_height);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod types;

pub use client::NodeClient;
pub use types::{
    AbciInfo, AbciPayload, AbciQuery, AbciQueryResponse, BlockResult, BlockResults,
    BlockchainInfo, BroadcastMode, BroadcastOutcome, BroadcastTxCommitResult, BroadcastTxResult,
    Commit, ConsensusState, DumpConsensusState, Genesis, Health, NetInfo, NodeInfo, Status,
    SyncInfo, TxResult, TxSearch, UnconfirmedTxs, Validator, ValidatorInfo, Validators,
};
