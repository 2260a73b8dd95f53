//! The single physical WebSocket connection to a node.
//!
//! The transport connects lazily: the first send finds no link and dials
//! the endpoint, and after a drop the next send dials again. There is no
//! background reconnect loop. Each established link gets an epoch number
//! and its own receive task, which hands every text frame to a
//! [`FrameHandler`] and reports the epoch back when the link dies.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use tmrpc_core::error::RpcError;
use tmrpc_core::transport::HealthStatus;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Receives inbound frames and link-loss notifications from the receive task.
pub trait FrameHandler: Send + Sync + 'static {
    /// Called for every text frame, in arrival order.
    fn on_frame(&self, text: &str);

    /// Called once when the link with this epoch has gone away.
    fn on_disconnected(&self, epoch: u64);
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Connection settings, taken from `ClientConfig`.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub probe_interval: Duration,
    pub wait_for_connection: bool,
}

const HEALTH_UNKNOWN: u8 = 0;
const HEALTH_UP: u8 = 1;
const HEALTH_DOWN: u8 = 2;

struct Link {
    sink: SplitSink<WsStream, Message>,
    epoch: u64,
    reader: JoinHandle<()>,
}

struct Shared {
    url: String,
    config: TransportConfig,
    /// Holding this lock serializes every write and every connect attempt.
    link: Mutex<Option<Link>>,
    health: AtomicU8,
    epoch: AtomicU64,
    closed: AtomicBool,
    handler: Arc<dyn FrameHandler>,
}

/// Owner of the WebSocket connection.
pub struct WsTransport {
    shared: Arc<Shared>,
}

impl WsTransport {
    /// Create a transport for an already-normalized `ws://` / `wss://` URL.
    /// Nothing is dialed until the first send.
    pub fn new(url: String, config: TransportConfig, handler: Arc<dyn FrameHandler>) -> Self {
        Self {
            shared: Arc::new(Shared {
                url,
                config,
                link: Mutex::new(None),
                health: AtomicU8::new(HEALTH_UNKNOWN),
                epoch: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                handler,
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Epoch of the most recently established link (0 before the first one).
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        if self.shared.health.load(Ordering::Acquire) == HEALTH_UP {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn health(&self) -> HealthStatus {
        match self.shared.health.load(Ordering::Acquire) {
            HEALTH_UP => HealthStatus::Healthy,
            HEALTH_DOWN => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }

    /// Establish the connection if there is none. Idempotent.
    pub async fn connect(&self) -> Result<u64, RpcError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }
        let mut link = self.shared.link.lock().await;
        if let Some(l) = link.as_ref() {
            return Ok(l.epoch);
        }
        let established = self.establish().await?;
        Ok(link.insert(established).epoch)
    }

    /// Write one text frame, dialing first if the link is down.
    ///
    /// `bind` runs with the epoch of the link the frame is about to be
    /// written to, before the write, so a caller can tie its pending state
    /// to that link.
    pub async fn send<F>(&self, frame: &str, bind: F) -> Result<u64, RpcError>
    where
        F: FnOnce(u64) + Send,
    {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }

        let mut guard = self.shared.link.lock().await;
        let link = match guard.take() {
            Some(link) => link,
            None => self.establish().await?,
        };
        let link = guard.insert(link);
        let epoch = link.epoch;
        bind(epoch);

        let written = link.sink.send(Message::Text(frame.to_owned())).await;
        if let Err(e) = written {
            tracing::warn!(url = %self.shared.url, epoch, error = %e, "WS send failed, dropping link");
            *guard = None;
            self.shared.health.store(HEALTH_DOWN, Ordering::Release);
            return Err(RpcError::Connection(e.to_string()));
        }
        Ok(epoch)
    }

    /// Dial the endpoint. Runs with the link lock held.
    async fn establish(&self) -> Result<Link, RpcError> {
        let shared = &self.shared;
        loop {
            tracing::debug!(url = %shared.url, "connecting via WebSocket");

            let failure = match time::timeout(shared.config.connect_timeout, connect_async(&shared.url)).await {
                Ok(Ok((ws_stream, _))) => {
                    let epoch = shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;
                    let (sink, stream) = ws_stream.split();
                    let reader = tokio::spawn(receive_loop(stream, epoch, Arc::clone(shared)));
                    shared.health.store(HEALTH_UP, Ordering::Release);
                    tracing::info!(url = %shared.url, epoch, "WS connected");
                    return Ok(Link { sink, epoch, reader });
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "connect timed out after {}ms",
                    shared.config.connect_timeout.as_millis()
                ),
            };

            shared.health.store(HEALTH_DOWN, Ordering::Release);
            if !shared.config.wait_for_connection {
                tracing::debug!(url = %shared.url, error = %failure, "WS connect failed");
                return Err(RpcError::Connection(failure));
            }
            tracing::debug!(
                url = %shared.url,
                error = %failure,
                "peer unreachable, probing again in {:?}",
                shared.config.probe_interval
            );
            time::sleep(shared.config.probe_interval).await;

            if shared.closed.load(Ordering::Acquire) {
                return Err(RpcError::Closed);
            }
        }
    }

    /// Close the link and refuse further sends.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let link = self.shared.link.lock().await.take();
        if let Some(mut link) = link {
            let _ = link.sink.send(Message::Close(None)).await;
            let _ = link.sink.close().await;
            link.reader.abort();
            tracing::info!(url = %self.shared.url, epoch = link.epoch, "WS closed");
        }
        self.shared.health.store(HEALTH_DOWN, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Ok(mut link) = self.shared.link.try_lock() {
            if let Some(link) = link.take() {
                link.reader.abort();
            }
        }
    }
}

/// Reads frames for one link until it closes or errors.
async fn receive_loop(mut stream: SplitStream<WsStream>, epoch: u64, shared: Arc<Shared>) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => shared.handler.on_frame(text.as_str()),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => shared.handler.on_frame(text),
                Err(_) => tracing::debug!(epoch, len = bytes.len(), "dropping non-UTF-8 binary frame"),
            },
            Ok(Message::Ping(data)) => {
                let mut guard = shared.link.lock().await;
                if let Some(link) = guard.as_mut().filter(|l| l.epoch == epoch) {
                    let _ = link.sink.send(Message::Pong(data)).await;
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!(url = %shared.url, epoch, "WS closed by node");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(url = %shared.url, epoch, error = %e, "WS receive error");
                break;
            }
        }
    }

    {
        let mut guard = shared.link.lock().await;
        if guard.as_ref().map(|l| l.epoch) == Some(epoch) {
            *guard = None;
            shared.health.store(HEALTH_DOWN, Ordering::Release);
        }
    }
    tracing::warn!(url = %shared.url, epoch, "WS disconnected");
    shared.handler.on_disconnected(epoch);
}

/// Turn a node address into the WebSocket URL of its RPC endpoint.
///
/// `tcp://` and `http://` become `ws://`, `https://` becomes `wss://`, and
/// an address without a path gets `/websocket`.
pub fn websocket_url(endpoint: &str) -> Result<String, RpcError> {
    let parsed = Url::parse(endpoint)
        .map_err(|e| RpcError::InvalidEndpoint(format!("{endpoint}: {e}")))?;

    let scheme = match parsed.scheme() {
        "tcp" | "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RpcError::InvalidEndpoint(format!(
                "{endpoint}: unsupported scheme {other}"
            )))
        }
    };
    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| RpcError::InvalidEndpoint(format!("{endpoint}: missing host")))?;
    let port = parsed.port().map(|p| format!(":{p}")).unwrap_or_default();
    let path = match parsed.path() {
        "" | "/" => "/websocket",
        p => p,
    };

    Ok(format!("{scheme}://{host}{port}{path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_address_maps_to_websocket_path() {
        assert_eq!(
            websocket_url("tcp://127.0.0.1:26657").unwrap(),
            "ws://127.0.0.1:26657/websocket"
        );
        assert_eq!(
            websocket_url("tcp://data-seed-pre-2-s1.bnbchain.org:80").unwrap(),
            "ws://data-seed-pre-2-s1.bnbchain.org:80/websocket"
        );
    }

    #[test]
    fn secure_and_explicit_paths() {
        assert_eq!(
            websocket_url("https://rpc.example.org").unwrap(),
            "wss://rpc.example.org/websocket"
        );
        assert_eq!(
            websocket_url("ws://localhost:9000/custom").unwrap(),
            "ws://localhost:9000/custom"
        );
    }

    #[test]
    fn reject_unusable_endpoints() {
        assert!(matches!(websocket_url("not a url"), Err(RpcError::InvalidEndpoint(_))));
        assert!(matches!(websocket_url("ftp://host:21"), Err(RpcError::InvalidEndpoint(_))));
    }
}
