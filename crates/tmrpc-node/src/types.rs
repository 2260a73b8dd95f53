//! Typed results of node calls.
//!
//! The node encodes 64-bit integers as decimal strings and byte fields as
//! base64. Integer fields here accept either a string or a JSON number;
//! nested structures the client does not interpret stay as [`Value`].

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tmrpc_core::error::RpcError;

#[derive(Deserialize)]
#[serde(untagged)]
enum IntRepr {
    Int(i64),
    Str(String),
}

fn de_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    match IntRepr::deserialize(d)? {
        IntRepr::Int(n) => Ok(n),
        IntRepr::Str(s) if s.is_empty() => Ok(0),
        IntRepr::Str(s) => s.parse().map_err(de::Error::custom),
    }
}

fn decode_base64(field: &str, encoded: Option<&str>) -> Result<Vec<u8>, RpcError> {
    match encoded {
        None | Some("") => Ok(Vec::new()),
        Some(s) => BASE64
            .decode(s)
            .map_err(|e| RpcError::Protocol(format!("{field} is not valid base64: {e}"))),
    }
}

// ─── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeInfo {
    pub id: String,
    pub listen_addr: String,
    /// Chain id the node serves.
    pub network: String,
    pub version: String,
    pub moniker: String,
    pub protocol_version: Value,
    pub other: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncInfo {
    pub latest_block_hash: String,
    pub latest_app_hash: String,
    #[serde(deserialize_with = "de_i64")]
    pub latest_block_height: i64,
    pub latest_block_time: String,
    pub catching_up: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorInfo {
    pub address: String,
    pub pub_key: Value,
    #[serde(deserialize_with = "de_i64")]
    pub voting_power: i64,
}

/// Result of `status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Status {
    pub node_info: NodeInfo,
    pub sync_info: SyncInfo,
    pub validator_info: ValidatorInfo,
}

/// Result of `health`; the node answers with an empty object when alive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Health {}

// ─── ABCI ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AbciInfoResponse {
    pub data: String,
    pub version: String,
    #[serde(deserialize_with = "de_i64")]
    pub app_version: i64,
    #[serde(deserialize_with = "de_i64")]
    pub last_block_height: i64,
    pub last_block_app_hash: Option<String>,
}

/// Result of `abci_info`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AbciInfo {
    pub response: AbciInfoResponse,
}

/// The application's answer to an ABCI query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AbciQueryResponse {
    pub code: u32,
    pub log: String,
    pub info: String,
    #[serde(deserialize_with = "de_i64")]
    pub index: i64,
    /// Base64.
    pub key: Option<String>,
    /// Base64.
    pub value: Option<String>,
    pub proof: Value,
    #[serde(deserialize_with = "de_i64")]
    pub height: i64,
    pub codespace: String,
}

impl AbciQueryResponse {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    pub fn key_bytes(&self) -> Result<Vec<u8>, RpcError> {
        decode_base64("key", self.key.as_deref())
    }

    pub fn value_bytes(&self) -> Result<Vec<u8>, RpcError> {
        decode_base64("value", self.value.as_deref())
    }
}

/// Result of `abci_query`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AbciQuery {
    pub response: AbciQueryResponse,
}

/// Raw value returned by an application-specific ABCI query.
///
/// Some paths answer with JSON, others with the application's binary
/// encoding; this type keeps the bytes as-is.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AbciPayload(pub Vec<u8>);

impl AbciPayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode the payload as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, RpcError> {
        Ok(serde_json::from_slice(&self.0)?)
    }
}

impl fmt::Debug for AbciPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AbciPayload({})", hex::encode(&self.0))
    }
}

// ─── Network / chain ──────────────────────────────────────────────────────────

/// Result of `net_info`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetInfo {
    pub listening: bool,
    pub listeners: Vec<String>,
    #[serde(deserialize_with = "de_i64")]
    pub n_peers: i64,
    pub peers: Vec<Value>,
}

/// Result of `genesis`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Genesis {
    pub genesis: Value,
}

/// Result of `blockchain`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockchainInfo {
    #[serde(deserialize_with = "de_i64")]
    pub last_height: i64,
    pub block_metas: Vec<Value>,
}

/// Result of `block`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockResult {
    pub block_meta: Value,
    pub block: Value,
}

impl BlockResult {
    /// Height from the block header, if present.
    pub fn height(&self) -> Option<i64> {
        let h = &self.block["header"]["height"];
        h.as_i64().or_else(|| h.as_str()?.parse().ok())
    }
}

/// Result of `block_results`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockResults {
    #[serde(deserialize_with = "de_i64")]
    pub height: i64,
    pub results: Value,
}

/// Result of `commit`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Commit {
    pub signed_header: Value,
    pub canonical: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Validator {
    pub address: String,
    pub pub_key: Value,
    #[serde(deserialize_with = "de_i64")]
    pub voting_power: i64,
    #[serde(deserialize_with = "de_i64")]
    pub proposer_priority: i64,
}

/// Result of `validators`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Validators {
    #[serde(deserialize_with = "de_i64")]
    pub block_height: i64,
    pub validators: Vec<Validator>,
}

/// Result of `consensus_state`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusState {
    pub round_state: Value,
}

/// Result of `dump_consensus_state`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConsensusState {
    pub round_state: Value,
    pub peers: Vec<Value>,
}

// ─── Mempool / transactions ───────────────────────────────────────────────────

/// Result of `unconfirmed_txs` and `num_unconfirmed_txs`.
///
/// `txs` is empty for `num_unconfirmed_txs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UnconfirmedTxs {
    #[serde(deserialize_with = "de_i64")]
    pub n_txs: i64,
    #[serde(deserialize_with = "de_i64")]
    pub total: i64,
    #[serde(deserialize_with = "de_i64")]
    pub total_bytes: i64,
    /// Base64-encoded transactions.
    pub txs: Option<Vec<String>>,
}

impl UnconfirmedTxs {
    pub fn tx_bytes(&self) -> Result<Vec<Vec<u8>>, RpcError> {
        self.txs
            .iter()
            .flatten()
            .map(|tx| decode_base64("tx", Some(tx.as_str())))
            .collect()
    }
}

/// Result of `tx`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TxResult {
    /// Hex-encoded hash.
    pub hash: String,
    #[serde(deserialize_with = "de_i64")]
    pub height: i64,
    pub index: u32,
    pub tx_result: Value,
    /// Base64-encoded transaction.
    pub tx: String,
    pub proof: Value,
}

impl TxResult {
    pub fn tx_bytes(&self) -> Result<Vec<u8>, RpcError> {
        decode_base64("tx", Some(self.tx.as_str()))
    }
}

/// Result of `tx_search`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TxSearch {
    pub txs: Vec<TxResult>,
    #[serde(deserialize_with = "de_i64")]
    pub total_count: i64,
}

/// Result of `broadcast_tx_async` and `broadcast_tx_sync`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastTxResult {
    pub code: u32,
    pub data: String,
    pub log: String,
    /// Hex-encoded hash.
    pub hash: String,
}

impl BroadcastTxResult {
    /// `true` if the transaction passed the mempool check (sync mode).
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// Result of `broadcast_tx_commit`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastTxCommitResult {
    pub check_tx: Value,
    pub deliver_tx: Value,
    pub hash: String,
    #[serde(deserialize_with = "de_i64")]
    pub height: i64,
}

impl BroadcastTxCommitResult {
    /// `true` if both the mempool check and block execution returned code 0.
    pub fn is_ok(&self) -> bool {
        let code = |v: &Value| v.get("code").and_then(Value::as_u64).unwrap_or(0);
        code(&self.check_tx) == 0 && code(&self.deliver_tx) == 0
    }
}

/// Broadcast delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastMode {
    /// Return as soon as the node received the transaction.
    Async,
    /// Return after the mempool check.
    #[default]
    Sync,
    /// Return after the transaction was included in a block.
    Commit,
}

impl BroadcastMode {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Async => "broadcast_tx_async",
            Self::Sync => "broadcast_tx_sync",
            Self::Commit => "broadcast_tx_commit",
        }
    }
}

/// Outcome of [`NodeClient::broadcast_tx`](crate::NodeClient::broadcast_tx).
#[derive(Debug, Clone)]
pub enum BroadcastOutcome {
    Submitted(BroadcastTxResult),
    Committed(BroadcastTxCommitResult),
}

impl BroadcastOutcome {
    pub fn hash(&self) -> &str {
        match self {
            Self::Submitted(r) => &r.hash,
            Self::Committed(r) => &r.hash,
        }
    }
}
