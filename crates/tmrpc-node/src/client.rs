//! `NodeClient`: typed node operations over any [`RpcTransport`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use tmrpc_core::config::{ClientConfig, NetworkKind};
use tmrpc_core::error::RpcError;
use tmrpc_core::request::RpcParams;
use tmrpc_core::transport::RpcTransport;
use tmrpc_ws::{EventStream, WsRpcClient};

use crate::types::*;

/// Store holding account records.
const ACCOUNT_STORE: &str = "acc";

fn params(value: Value) -> RpcParams {
    match value {
        Value::Object(map) => map,
        _ => RpcParams::new(),
    }
}

fn height_param(params: &mut RpcParams, height: Option<i64>) {
    if let Some(h) = height {
        params.insert("height".into(), Value::String(h.to_string()));
    }
}

/// Typed wrapper around a transport: fixes the method name, encodes the
/// params the way the node expects and decodes the result.
pub struct NodeClient<T: RpcTransport> {
    transport: T,
    network: NetworkKind,
}

impl NodeClient<WsRpcClient> {
    /// Build a WebSocket-backed client for `endpoint`. Does not connect.
    pub fn new(endpoint: &str, network: NetworkKind) -> Result<Self, RpcError> {
        Ok(Self::with_transport(WsRpcClient::new(endpoint, network)?, network))
    }

    pub fn with_config(endpoint: &str, config: ClientConfig) -> Result<Self, RpcError> {
        let network = config.network;
        Ok(Self::with_transport(
            WsRpcClient::with_config(endpoint, config)?,
            network,
        ))
    }

    /// Subscribe to events matching `query`. See [`WsRpcClient::subscribe`].
    pub async fn subscribe(&self, query: &str, capacity: usize) -> Result<EventStream, RpcError> {
        self.transport.subscribe(query, capacity).await
    }

    pub async fn unsubscribe(&self, query: &str) -> Result<(), RpcError> {
        self.transport.unsubscribe(query).await
    }

    pub async fn unsubscribe_all(&self) -> Result<(), RpcError> {
        self.transport.unsubscribe_all().await
    }

    pub fn set_timeout(&self, timeout: std::time::Duration) {
        self.transport.set_timeout(timeout);
    }

    pub fn pending_request_count(&self) -> usize {
        self.transport.pending_request_count()
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

impl<T: RpcTransport> NodeClient<T> {
    pub fn with_transport(transport: T, network: NetworkKind) -> Self {
        Self { transport, network }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn network(&self) -> NetworkKind {
        self.network
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: RpcParams) -> Result<R, RpcError> {
        tracing::trace!(method, url = %self.transport.url(), "node call");
        let value = self.transport.request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    // ─── Info ─────────────────────────────────────────────────────────────

    pub async fn status(&self) -> Result<Status, RpcError> {
        self.call("status", RpcParams::new()).await
    }

    pub async fn health(&self) -> Result<Health, RpcError> {
        self.call("health", RpcParams::new()).await
    }

    /// Fail with [`RpcError::NetworkMismatch`] unless the node serves the
    /// chain this client was built for.
    pub async fn check_network(&self) -> Result<(), RpcError> {
        let status = self.status().await?;
        let expected = self.network.chain_id();
        if status.node_info.network != expected {
            return Err(RpcError::NetworkMismatch {
                expected: expected.to_string(),
                actual: status.node_info.network,
            });
        }
        Ok(())
    }

    pub async fn net_info(&self) -> Result<NetInfo, RpcError> {
        self.call("net_info", RpcParams::new()).await
    }

    pub async fn genesis(&self) -> Result<Genesis, RpcError> {
        self.call("genesis", RpcParams::new()).await
    }

    pub async fn consensus_state(&self) -> Result<ConsensusState, RpcError> {
        self.call("consensus_state", RpcParams::new()).await
    }

    pub async fn dump_consensus_state(&self) -> Result<DumpConsensusState, RpcError> {
        self.call("dump_consensus_state", RpcParams::new()).await
    }

    // ─── Blocks ───────────────────────────────────────────────────────────

    /// Block metas for heights `min..=max`.
    pub async fn blockchain_info(&self, min_height: i64, max_height: i64) -> Result<BlockchainInfo, RpcError> {
        let p = params(json!({
            "minHeight": min_height.to_string(),
            "maxHeight": max_height.to_string(),
        }));
        self.call("blockchain", p).await
    }

    /// Block at `height`, or the latest block.
    pub async fn block(&self, height: Option<i64>) -> Result<BlockResult, RpcError> {
        let mut p = RpcParams::new();
        height_param(&mut p, height);
        self.call("block", p).await
    }

    pub async fn block_results(&self, height: Option<i64>) -> Result<BlockResults, RpcError> {
        let mut p = RpcParams::new();
        height_param(&mut p, height);
        self.call("block_results", p).await
    }

    pub async fn commit(&self, height: Option<i64>) -> Result<Commit, RpcError> {
        let mut p = RpcParams::new();
        height_param(&mut p, height);
        self.call("commit", p).await
    }

    pub async fn validators(&self, height: Option<i64>) -> Result<Validators, RpcError> {
        let mut p = RpcParams::new();
        height_param(&mut p, height);
        self.call("validators", p).await
    }

    // ─── Mempool and transactions ─────────────────────────────────────────

    pub async fn unconfirmed_txs(&self, limit: u32) -> Result<UnconfirmedTxs, RpcError> {
        self.call("unconfirmed_txs", params(json!({"limit": limit.to_string()})))
            .await
    }

    pub async fn num_unconfirmed_txs(&self) -> Result<UnconfirmedTxs, RpcError> {
        self.call("num_unconfirmed_txs", RpcParams::new()).await
    }

    /// Look a transaction up by its hex-encoded hash.
    pub async fn tx(&self, hash: &str, prove: bool) -> Result<TxResult, RpcError> {
        let raw = hex::decode(hash.trim_start_matches("0x"))
            .map_err(|e| RpcError::InvalidArgument(format!("tx hash {hash:?}: {e}")))?;
        let p = params(json!({"hash": BASE64.encode(raw), "prove": prove}));
        self.call("tx", p).await
    }

    /// Search transactions by event query, e.g. `tx.height = 5`.
    pub async fn tx_search(
        &self,
        query: &str,
        prove: bool,
        page: u32,
        per_page: u32,
    ) -> Result<TxSearch, RpcError> {
        let p = params(json!({
            "query": query,
            "prove": prove,
            "page": page.to_string(),
            "per_page": per_page.to_string(),
        }));
        self.call("tx_search", p).await
    }

    /// Submit a signed, encoded transaction.
    pub async fn broadcast_tx(&self, tx: &[u8], mode: BroadcastMode) -> Result<BroadcastOutcome, RpcError> {
        let p = params(json!({"tx": BASE64.encode(tx)}));
        let outcome = match mode {
            BroadcastMode::Commit => BroadcastOutcome::Committed(self.call(mode.method(), p).await?),
            _ => BroadcastOutcome::Submitted(self.call(mode.method(), p).await?),
        };
        tracing::debug!(method = mode.method(), hash = %outcome.hash(), "transaction broadcast");
        Ok(outcome)
    }

    pub async fn broadcast_tx_async(&self, tx: &[u8]) -> Result<BroadcastTxResult, RpcError> {
        self.call("broadcast_tx_async", params(json!({"tx": BASE64.encode(tx)})))
            .await
    }

    pub async fn broadcast_tx_sync(&self, tx: &[u8]) -> Result<BroadcastTxResult, RpcError> {
        self.call("broadcast_tx_sync", params(json!({"tx": BASE64.encode(tx)})))
            .await
    }

    pub async fn broadcast_tx_commit(&self, tx: &[u8]) -> Result<BroadcastTxCommitResult, RpcError> {
        self.call("broadcast_tx_commit", params(json!({"tx": BASE64.encode(tx)})))
            .await
    }

    // ─── ABCI ─────────────────────────────────────────────────────────────

    pub async fn abci_info(&self) -> Result<AbciInfo, RpcError> {
        self.call("abci_info", RpcParams::new()).await
    }

    /// Query the application at `path`; `data` is sent hex-encoded.
    pub async fn abci_query(
        &self,
        path: &str,
        data: &[u8],
        height: Option<i64>,
        prove: bool,
    ) -> Result<AbciQuery, RpcError> {
        let mut p = params(json!({
            "path": path,
            "data": hex::encode(data),
            "prove": prove,
        }));
        height_param(&mut p, height);
        self.call("abci_query", p).await
    }

    /// Run an ABCI query at the latest height and return its value.
    ///
    /// A non-zero application code is reported as [`RpcError::Application`].
    async fn query_value(&self, path: &str, data: &[u8]) -> Result<AbciPayload, RpcError> {
        let resp = self.abci_query(path, data, None, false).await?.response;
        if !resp.is_ok() {
            return Err(RpcError::Application(tmrpc_core::request::JsonRpcError {
                code: i64::from(resp.code),
                message: resp.log.clone(),
                data: Some(json!({"codespace": resp.codespace, "path": path})),
            }));
        }
        Ok(AbciPayload(resp.value_bytes()?))
    }

    async fn query_json(&self, path: &str, data: &[u8]) -> Result<Value, RpcError> {
        let payload = self.query_value(path, data).await?;
        if payload.is_empty() {
            return Ok(Value::Null);
        }
        payload.json()
    }

    /// Raw key lookup in an application store.
    pub async fn query_store(&self, store: &str, key: &[u8]) -> Result<AbciPayload, RpcError> {
        self.query_value(&format!("/store/{store}/key"), key).await
    }

    pub async fn list_tokens(&self, offset: u32, limit: u32) -> Result<Value, RpcError> {
        self.query_json(&format!("tokens/list/{offset}/{limit}"), &[])
            .await
    }

    pub async fn token_info(&self, symbol: &str) -> Result<Value, RpcError> {
        self.query_json(&format!("tokens/info/{symbol}"), &[]).await
    }

    /// Encoded account record for the raw 20-byte `address`.
    pub async fn account(&self, address: &[u8]) -> Result<AbciPayload, RpcError> {
        let mut key = b"account:".to_vec();
        key.extend_from_slice(address);
        self.query_store(ACCOUNT_STORE, &key).await
    }

    /// Account balances live inside the account record.
    pub async fn balances(&self, address: &[u8]) -> Result<AbciPayload, RpcError> {
        self.account(address).await
    }

    pub async fn fees(&self) -> Result<AbciPayload, RpcError> {
        self.query_value("/param/fees", &[]).await
    }

    /// Open orders of bech32 `address` on `pair` (e.g. `XYZ-000_BNB`).
    pub async fn open_orders(&self, address: &str, pair: &str) -> Result<Value, RpcError> {
        self.query_json(&format!("dex/openorders/{pair}/{address}"), &[])
            .await
    }

    pub async fn trading_pairs(&self, offset: u32, limit: u32) -> Result<AbciPayload, RpcError> {
        self.query_value(&format!("dex/pairs/{offset}/{limit}"), &[])
            .await
    }

    pub async fn depth(&self, pair: &str) -> Result<AbciPayload, RpcError> {
        self.query_value(&format!("dex/orderbook/{pair}"), &[]).await
    }

    pub async fn stake_validators(&self) -> Result<Value, RpcError> {
        self.query_json("custom/stake/validators", &[]).await
    }

    /// Unbonding delegations of bech32 delegator `address`.
    pub async fn delegator_unbonding_delegations(&self, address: &str) -> Result<Value, RpcError> {
        let filter = json!({"DelegatorAddr": address});
        self.query_json(
            "custom/stake/delegatorUnbondingDelegations",
            &serde_json::to_vec(&filter)?,
        )
        .await
    }

    /// Governance proposals, optionally filtered by status name
    /// (`DepositPeriod`, `VotingPeriod`, `Passed`, `Rejected`).
    pub async fn proposals(&self, status: Option<&str>, limit: u32) -> Result<Value, RpcError> {
        let mut filter = json!({"Limit": limit.to_string()});
        if let Some(s) = status {
            filter["ProposalStatus"] = Value::String(s.to_string());
        }
        self.query_json("custom/gov/proposals", &serde_json::to_vec(&filter)?)
            .await
    }

    pub async fn proposal(&self, id: u64) -> Result<Value, RpcError> {
        let filter = json!({"ProposalID": id.to_string()});
        self.query_json("custom/gov/proposal", &serde_json::to_vec(&filter)?)
            .await
    }

    /// Time-locked funds of bech32 `address`.
    pub async fn timelocks(&self, address: &str) -> Result<Value, RpcError> {
        let filter = json!({"Account": address});
        self.query_json("custom/timelock/timelocks", &serde_json::to_vec(&filter)?)
            .await
    }

    pub async fn timelock(&self, address: &str, id: u64) -> Result<Value, RpcError> {
        let filter = json!({"Account": address, "Id": id});
        self.query_json("custom/timelock/timelock", &serde_json::to_vec(&filter)?)
            .await
    }
}

impl<T: RpcTransport> std::fmt::Debug for NodeClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeClient")
            .field("url", &self.transport.url())
            .field("network", &self.network)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tmrpc_core::request::JsonRpcError;

    /// Records each call and answers from a fixed table.
    struct MockTransport {
        url: String,
        answers: Vec<(&'static str, Result<Value, i64>)>,
        calls: Mutex<Vec<(String, RpcParams)>>,
    }

    impl MockTransport {
        fn new(answers: Vec<(&'static str, Result<Value, i64>)>) -> Self {
            Self {
                url: "mock://node".into(),
                answers,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn last_params(&self) -> RpcParams {
            self.calls.lock().unwrap().last().unwrap().1.clone()
        }
    }

    #[async_trait]
    impl RpcTransport for MockTransport {
        async fn request(&self, method: &str, params: RpcParams) -> Result<Value, RpcError> {
            self.calls.lock().unwrap().push((method.to_string(), params));
            match self.answers.iter().find(|(m, _)| *m == method) {
                Some((_, Ok(v))) => Ok(v.clone()),
                Some((_, Err(code))) => Err(RpcError::Application(JsonRpcError {
                    code: *code,
                    message: "Internal error".into(),
                    data: None,
                })),
                None => Err(RpcError::Connection("no route".into())),
            }
        }

        fn url(&self) -> &str {
            &self.url
        }
    }

    fn client(answers: Vec<(&'static str, Result<Value, i64>)>) -> NodeClient<MockTransport> {
        NodeClient::with_transport(MockTransport::new(answers), NetworkKind::TestNet)
    }

    fn abci_value(value: &[u8]) -> Value {
        json!({"response": {"code": 0, "value": BASE64.encode(value), "height": "42"}})
    }

    #[tokio::test]
    async fn status_decodes_and_network_matches() {
        let c = client(vec![(
            "status",
            Ok(json!({
                "node_info": {"network": "Binance-Chain-Ganges"},
                "sync_info": {"latest_block_height": "1000"}
            })),
        )]);
        let status = c.status().await.unwrap();
        assert_eq!(status.sync_info.latest_block_height, 1000);
        c.check_network().await.unwrap();
    }

    #[tokio::test]
    async fn network_mismatch_is_reported() {
        let c = client(vec![(
            "status",
            Ok(json!({"node_info": {"network": "Binance-Chain-Tigris"}})),
        )]);
        match c.check_network().await.unwrap_err() {
            RpcError::NetworkMismatch { expected, actual } => {
                assert_eq!(expected, "Binance-Chain-Ganges");
                assert_eq!(actual, "Binance-Chain-Tigris");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn heights_are_sent_as_strings() {
        let c = client(vec![("block", Ok(json!({"block": {"header": {"height": "9"}}})))]);
        let block = c.block(Some(9)).await.unwrap();
        assert_eq!(block.height(), Some(9));
        assert_eq!(c.transport().last_params()["height"], "9");

        c.block(None).await.unwrap();
        assert!(c.transport().last_params().get("height").is_none());
    }

    #[tokio::test]
    async fn tx_hash_is_sent_base64() {
        let c = client(vec![("tx", Ok(json!({"hash": "ABCD", "height": "3", "tx": "AQI="})))]);
        let tx = c.tx("abcd", false).await.unwrap();
        assert_eq!(tx.height, 3);
        assert_eq!(tx.tx_bytes().unwrap(), vec![1, 2]);
        assert_eq!(c.transport().last_params()["hash"], "q80=");

        let err = c.tx("not-hex", false).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn broadcast_picks_method_by_mode() {
        let c = client(vec![
            ("broadcast_tx_sync", Ok(json!({"code": 0, "hash": "AA", "log": ""}))),
            ("broadcast_tx_commit", Ok(json!({"check_tx": {}, "deliver_tx": {}, "hash": "BB", "height": "5"}))),
        ]);
        let sync = c.broadcast_tx(&[1, 2, 3], BroadcastMode::Sync).await.unwrap();
        assert!(matches!(sync, BroadcastOutcome::Submitted(ref r) if r.is_ok()));
        assert_eq!(c.transport().last_params()["tx"], "AQID");

        let commit = c.broadcast_tx(&[1], BroadcastMode::Commit).await.unwrap();
        assert_eq!(commit.hash(), "BB");

        let err = c.broadcast_tx_async(&[1]).await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn application_errors_pass_through() {
        let c = client(vec![("validators", Err(-32603))]);
        let err = c.validators(None).await.unwrap_err();
        assert!(err.is_application_error());
    }

    #[tokio::test]
    async fn abci_query_sends_hex_data() {
        let c = client(vec![("abci_query", Ok(abci_value(b"raw")))]);
        let q = c.abci_query("/store/acc/key", b"k", Some(7), true).await.unwrap();
        assert_eq!(q.response.value_bytes().unwrap(), b"raw".to_vec());

        let p = c.transport().last_params();
        assert_eq!(p["data"], "6b");
        assert_eq!(p["height"], "7");
        assert_eq!(p["prove"], true);
    }

    #[tokio::test]
    async fn json_shortcuts_decode_payload() {
        let c = client(vec![(
            "abci_query",
            Ok(abci_value(br#"[{"symbol":"BNB","total_supply":"2000"}]"#)),
        )]);
        let tokens = c.list_tokens(0, 10).await.unwrap();
        assert_eq!(tokens[0]["symbol"], "BNB");
        assert_eq!(c.transport().last_params()["path"], "tokens/list/0/10");
    }

    #[tokio::test]
    async fn account_uses_prefixed_store_key() {
        let c = client(vec![("abci_query", Ok(abci_value(&[0xaa, 0xbb])))]);
        let address = [0x11u8; 20];
        let payload = c.account(&address).await.unwrap();
        assert_eq!(payload.as_bytes(), &[0xaa, 0xbb]);

        let p = c.transport().last_params();
        assert_eq!(p["path"], "/store/acc/key");
        let mut key = b"account:".to_vec();
        key.extend_from_slice(&address);
        assert_eq!(p["data"], hex::encode(key));
    }

    #[tokio::test]
    async fn non_zero_abci_code_is_an_application_error() {
        let c = client(vec![(
            "abci_query",
            Ok(json!({"response": {"code": 6, "log": "unknown token", "codespace": "tokens"}})),
        )]);
        match c.token_info("NOPE").await.unwrap_err() {
            RpcError::Application(e) => {
                assert_eq!(e.code, 6);
                assert_eq!(e.message, "unknown token");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn proposals_filter_is_json_encoded() {
        let c = client(vec![("abci_query", Ok(abci_value(b"[]")))]);
        let proposals = c.proposals(Some("Passed"), 100).await.unwrap();
        assert_eq!(proposals, json!([]));

        let data = hex::decode(c.transport().last_params()["data"].as_str().unwrap()).unwrap();
        let filter: Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(filter["ProposalStatus"], "Passed");
        assert_eq!(filter["Limit"], "100");
    }

    #[tokio::test]
    async fn unbonding_delegations_are_filtered_by_delegator() {
        let c = client(vec![("abci_query", Ok(abci_value(b"[]")))]);
        let delegations = c
            .delegator_unbonding_delegations("tbnb1delegator")
            .await
            .unwrap();
        assert_eq!(delegations, json!([]));

        let p = c.transport().last_params();
        assert_eq!(p["path"], "custom/stake/delegatorUnbondingDelegations");
        let data = hex::decode(p["data"].as_str().unwrap()).unwrap();
        let filter: Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(filter["DelegatorAddr"], "tbnb1delegator");
    }
}
