//! WebSocket JSON-RPC client: correlated calls plus event subscriptions
//! over one connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use tmrpc_core::config::{ClientConfig, NetworkKind};
use tmrpc_core::error::RpcError;
use tmrpc_core::query::Query;
use tmrpc_core::request::{Inbound, ResponsePayload, RpcParams};
use tmrpc_core::transport::{HealthStatus, RpcTransport};

use crate::correlator::{Correlator, PendingTable};
use crate::subscriptions::{EventStream, SubscriptionRegistry};
use crate::transport::{websocket_url, ConnectionState, FrameHandler, TransportConfig, WsTransport};

/// Routes inbound frames to the pending table or the subscription registry.
struct Router {
    pending: PendingTable,
    subscriptions: SubscriptionRegistry,
}

impl FrameHandler for Router {
    fn on_frame(&self, text: &str) {
        match Inbound::parse(text) {
            Ok(Inbound::Event { event, .. }) => {
                if self.subscriptions.dispatch(&event) == 0 {
                    tracing::debug!(query = %event.query, "event matched no subscription, dropped");
                }
            }
            Ok(Inbound::Response(resp)) => {
                let Some(id) = resp.id.as_number() else {
                    tracing::debug!(id = %resp.id, "response with non-numeric id dropped");
                    return;
                };
                let outcome = match resp.payload() {
                    ResponsePayload::Success(v) => Ok(v),
                    ResponsePayload::Failure(e) => Err(RpcError::Application(e)),
                };
                if !self.pending.resolve(id, outcome) {
                    tracing::debug!(id, "response for unknown or expired request dropped");
                }
            }
            Err(e) => {
                if let Some(id) = frame_id(text) {
                    if self.pending.resolve(id, Err(e)) {
                        return;
                    }
                    tracing::debug!(id, "malformed frame for unknown request dropped");
                    return;
                }
                tracing::debug!(error = %e, "dropping unparsable frame");
            }
        }
    }

    fn on_disconnected(&self, epoch: u64) {
        let failed = self.pending.fail_epoch(epoch);
        if failed > 0 {
            tracing::warn!(epoch, failed, "connection lost with calls in flight");
        }
    }
}

/// Best-effort id of a frame that failed classification.
fn frame_id(text: &str) -> Option<u64> {
    serde_json::from_str::<Value>(text).ok()?.get("id")?.as_u64()
}

fn query_params(query: &str) -> RpcParams {
    let mut params = RpcParams::new();
    params.insert("query".into(), Value::String(query.to_string()));
    params
}

struct Inner {
    url: String,
    config: ClientConfig,
    correlator: Correlator,
    subscriptions: SubscriptionRegistry,
    /// Last link epoch a resubscribe pass was started for.
    resubscribed_epoch: AtomicU64,
}

impl Inner {
    fn transport(&self) -> &WsTransport {
        self.correlator.transport()
    }

    /// Re-issue subscriptions the node forgot when the previous link died.
    fn maybe_resubscribe(self: &Arc<Self>) {
        let epoch = self.transport().epoch();
        if epoch == 0 || self.resubscribed_epoch.swap(epoch, Ordering::AcqRel) == epoch {
            return;
        }
        let stale = self.subscriptions.stale(epoch);
        if stale.is_empty() {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            for key in stale {
                match inner.correlator.call_on_link("subscribe", query_params(&key)).await {
                    Ok((_, on)) => {
                        inner.subscriptions.confirm(&key, on);
                        tracing::info!(query = %key, epoch = on, "resubscribed after reconnect");
                    }
                    Err(e) => {
                        tracing::warn!(query = %key, epoch, error = %e, "resubscribe failed");
                    }
                }
            }
        });
    }

    async fn request(self: &Arc<Self>, method: &str, params: RpcParams) -> Result<Value, RpcError> {
        self.request_on_link(method, params)
            .await
            .map(|(value, _)| value)
    }

    async fn request_on_link(
        self: &Arc<Self>,
        method: &str,
        params: RpcParams,
    ) -> Result<(Value, u64), RpcError> {
        let result = self.correlator.call_on_link(method, params).await;
        if result.is_ok() && !self.subscriptions.is_empty() {
            self.maybe_resubscribe();
        }
        result
    }
}

/// Releases a subscription reservation unless the subscribe went through.
/// Only the registration it made is released, never a newer one.
struct Reservation<'a> {
    subscriptions: &'a SubscriptionRegistry,
    key: String,
    registration: u64,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.subscriptions.remove_if(&self.key, self.registration);
        }
    }
}

/// WebSocket JSON-RPC client for a Tendermint-style node.
///
/// Many tasks may call it concurrently; their requests share one
/// connection and are matched to responses by id. The connection is
/// dialed by the first call and re-dialed by the first call after a drop.
pub struct WsRpcClient {
    inner: Arc<Inner>,
}

impl WsRpcClient {
    /// Create a client for `endpoint` (e.g. `tcp://127.0.0.1:26657`) with
    /// default settings. Does not connect.
    pub fn new(endpoint: &str, network: NetworkKind) -> Result<Self, RpcError> {
        Self::with_config(endpoint, ClientConfig::default().with_network(network))
    }

    pub fn with_config(endpoint: &str, config: ClientConfig) -> Result<Self, RpcError> {
        let url = websocket_url(endpoint)?;
        let pending = PendingTable::new();
        let subscriptions = SubscriptionRegistry::new();
        let router = Arc::new(Router {
            pending: pending.clone(),
            subscriptions: subscriptions.clone(),
        });
        let transport = WsTransport::new(
            url.clone(),
            TransportConfig {
                connect_timeout: config.connect_timeout(),
                probe_interval: config.connect_probe_interval(),
                wait_for_connection: config.wait_for_connection,
            },
            router,
        );
        let correlator = Correlator::new(transport, pending, config.request_timeout());

        Ok(Self {
            inner: Arc::new(Inner {
                url,
                config,
                correlator,
                subscriptions,
                resubscribed_epoch: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn network(&self) -> NetworkKind {
        self.inner.config.network
    }

    /// Change the timeout used by calls issued from now on.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.correlator.set_timeout(timeout);
    }

    pub fn timeout(&self) -> Duration {
        self.inner.correlator.timeout()
    }

    /// Calls currently waiting for a response.
    pub fn pending_request_count(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.transport().state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport().is_connected()
    }

    /// Dial the node now rather than on the first call. Idempotent.
    pub async fn connect(&self) -> Result<(), RpcError> {
        let timeout = self.timeout();
        tokio::time::timeout(timeout, self.inner.transport().connect())
            .await
            .map_err(|_| RpcError::Timeout {
                ms: timeout.as_millis() as u64,
            })?
            .map(|_| ())
    }

    /// Subscribe to events matching `query`.
    ///
    /// Fails with [`RpcError::DuplicateSubscription`] while another
    /// subscription for the same query is live.
    pub async fn subscribe(&self, query: &str, capacity: usize) -> Result<EventStream, RpcError> {
        let parsed = Query::parse(query)?;
        let key = parsed.canonical();
        let stream = self.inner.subscriptions.reserve(parsed, capacity)?;
        let mut reservation = Reservation {
            subscriptions: &self.inner.subscriptions,
            key: key.clone(),
            registration: stream.registration(),
            armed: true,
        };

        let (_, epoch) = self
            .inner
            .request_on_link("subscribe", query_params(&key))
            .await?;

        reservation.armed = false;
        self.inner.subscriptions.confirm(&key, epoch);
        tracing::info!(query = %key, "subscribed");
        Ok(stream)
    }

    /// Subscribe with the configured default buffer capacity.
    pub async fn subscribe_default(&self, query: &str) -> Result<EventStream, RpcError> {
        self.subscribe(query, self.inner.config.default_buffer_capacity)
            .await
    }

    /// Stop the subscription for `query`; its stream ends once drained.
    pub async fn unsubscribe(&self, query: &str) -> Result<(), RpcError> {
        let key = Query::parse(query)?.canonical();
        if !self.inner.subscriptions.remove(&key) {
            return Err(RpcError::SubscriptionNotFound { query: key });
        }
        tracing::info!(query = %key, "unsubscribed");

        // A dead link already took the node-side subscription with it.
        if !self.is_connected() {
            return Ok(());
        }
        self.inner
            .request("unsubscribe", query_params(&key))
            .await
            .map(|_| ())
    }

    /// Stop every subscription.
    pub async fn unsubscribe_all(&self) -> Result<(), RpcError> {
        let removed = self.inner.subscriptions.clear();
        tracing::info!(count = removed.len(), "unsubscribed from all queries");
        if !self.is_connected() {
            return Ok(());
        }
        self.inner
            .request("unsubscribe_all", RpcParams::new())
            .await
            .map(|_| ())
    }

    /// Shut the client down: end every event stream, fail pending calls
    /// and close the connection. Later calls fail with [`RpcError::Closed`].
    pub async fn close(&self) {
        self.inner.subscriptions.clear();
        self.inner.correlator.shutdown().await;
    }

    /// Issue a raw call and return the untyped result.
    pub async fn call_raw(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let params = match params {
            Value::Object(map) => map,
            Value::Null => RpcParams::new(),
            other => {
                return Err(RpcError::Protocol(format!(
                    "params must be a JSON object, got {other}"
                )))
            }
        };
        self.inner.request(method, params).await
    }
}

#[async_trait]
impl RpcTransport for WsRpcClient {
    async fn request(&self, method: &str, params: RpcParams) -> Result<Value, RpcError> {
        self.inner.request(method, params).await
    }

    fn health(&self) -> HealthStatus {
        self.inner.transport().health()
    }

    fn url(&self) -> &str {
        &self.inner.url
    }
}

impl std::fmt::Debug for WsRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsRpcClient")
            .field("url", &self.inner.url)
            .field("state", &self.connection_state())
            .field("pending", &self.pending_request_count())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn router() -> (Router, PendingTable, SubscriptionRegistry) {
        let pending = PendingTable::new();
        let subscriptions = SubscriptionRegistry::new();
        let router = Router {
            pending: pending.clone(),
            subscriptions: subscriptions.clone(),
        };
        (router, pending, subscriptions)
    }

    #[test]
    fn frames_without_a_home_are_dropped() {
        let (router, pending, _subs) = router();
        router.on_frame("garbage");
        router.on_frame(r#"{"jsonrpc":"2.0","id":99,"result":{}}"#);
        router.on_frame(r#"{"jsonrpc":"2.0","id":"x","result":{}}"#);
        router.on_disconnected(1);
        assert!(pending.is_empty());
    }

    #[test]
    fn event_frames_reach_the_registry() {
        let (router, _pending, subs) = router();
        let mut stream = subs
            .reserve(Query::parse("tm.event = 'NewBlock'").unwrap(), 4)
            .unwrap();
        router.on_frame(
            &json!({
                "jsonrpc": "2.0",
                "id": "1#event",
                "result": {
                    "query": "tm.event='NewBlock'",
                    "data": {"type": "tendermint/event/NewBlock", "value": {"block": {}}},
                    "events": {"tm.event": ["NewBlock"]}
                }
            })
            .to_string(),
        );
        assert!(stream.try_recv().is_some());
    }

    #[test]
    fn invalid_endpoint_fails_construction() {
        let err = WsRpcClient::new("ftp://127.0.0.1:21", NetworkKind::TestNet).unwrap_err();
        assert!(matches!(err, RpcError::InvalidEndpoint(_)));
    }

    #[test]
    fn set_timeout_applies_to_later_calls() {
        let client = WsRpcClient::new("tcp://127.0.0.1:1", NetworkKind::TestNet).unwrap();
        assert_eq!(client.timeout(), Duration::from_secs(5));
        client.set_timeout(Duration::from_millis(250));
        assert_eq!(client.timeout(), Duration::from_millis(250));
        assert_eq!(client.pending_request_count(), 0);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }
}
