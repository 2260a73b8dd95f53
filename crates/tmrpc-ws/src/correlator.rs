//! Request/response correlation over the shared connection.
//!
//! Every call gets a fresh numeric id and an entry in the pending table.
//! The entry is removed exactly once, by whichever comes first:
//! - the receive path resolving it with the node's response,
//! - the connection the request went out on dying,
//! - the caller giving up (timeout, send failure, or dropping the future).
//!
//! Removal and delivery happen under the table lock, so a caller that
//! fails to claim its own entry after a timeout knows the result is
//! already sitting in its slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time;

use tmrpc_core::error::RpcError;
use tmrpc_core::request::{JsonRpcRequest, RpcParams};

use crate::transport::WsTransport;

type ResultSlot = oneshot::Sender<Result<Value, RpcError>>;

struct PendingCall {
    method: String,
    issued_at: Instant,
    timeout: Duration,
    /// Link the request was written to; `None` until the write starts.
    epoch: Option<u64>,
    slot: ResultSlot,
}

#[derive(Default)]
struct PendingInner {
    calls: Mutex<HashMap<u64, PendingCall>>,
    count: AtomicUsize,
}

/// Shared table of in-flight calls.
#[derive(Clone, Default)]
pub struct PendingTable {
    inner: Arc<PendingInner>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.inner.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(
        &self,
        id: u64,
        method: &str,
        timeout: Duration,
    ) -> (PendingGuard<'_>, oneshot::Receiver<Result<Value, RpcError>>) {
        let (slot, rx) = oneshot::channel();
        let call = PendingCall {
            method: method.to_string(),
            issued_at: Instant::now(),
            timeout,
            epoch: None,
            slot,
        };
        let mut calls = self.calls();
        calls.insert(id, call);
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        (PendingGuard { table: self, id }, rx)
    }

    fn bind_epoch(&self, id: u64, epoch: u64) {
        if let Some(call) = self.calls().get_mut(&id) {
            call.epoch = Some(epoch);
        }
    }

    /// Remove the entry without delivering anything.
    /// Returns `false` if someone else already removed it.
    fn claim(&self, id: u64) -> bool {
        let mut calls = self.calls();
        let removed = calls.remove(&id).is_some();
        if removed {
            self.inner.count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Complete the call `id` with `outcome`.
    /// Returns `false` if no such call is pending (unknown id, or the caller
    /// already gave up).
    pub fn resolve(&self, id: u64, outcome: Result<Value, RpcError>) -> bool {
        let mut calls = self.calls();
        match calls.remove(&id) {
            Some(call) => {
                self.inner.count.fetch_sub(1, Ordering::AcqRel);
                tracing::trace!(
                    id,
                    method = %call.method,
                    latency_ms = call.issued_at.elapsed().as_millis() as u64,
                    "call resolved"
                );
                let _ = call.slot.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail every call written to the link `epoch` with a connection error.
    pub fn fail_epoch(&self, epoch: u64) -> usize {
        self.fail_where(|call| call.epoch == Some(epoch), || {
            RpcError::Connection(format!("connection lost (epoch {epoch})"))
        })
    }

    /// Fail every pending call, e.g. on shutdown.
    pub fn fail_all(&self, make_err: impl Fn() -> RpcError) -> usize {
        self.fail_where(|_| true, make_err)
    }

    fn fail_where(
        &self,
        pred: impl Fn(&PendingCall) -> bool,
        make_err: impl Fn() -> RpcError,
    ) -> usize {
        let mut calls = self.calls();
        let ids: Vec<u64> = calls
            .iter()
            .filter(|(_, call)| pred(call))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(call) = calls.remove(id) {
                self.inner.count.fetch_sub(1, Ordering::AcqRel);
                tracing::debug!(
                    id,
                    method = %call.method,
                    waited_ms = call.issued_at.elapsed().as_millis() as u64,
                    timeout_ms = call.timeout.as_millis() as u64,
                    "failing pending call"
                );
                let _ = call.slot.send(Err(make_err()));
            }
        }
        ids.len()
    }

    /// Number of calls currently awaiting a response.
    pub fn len(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its entry when dropped, unless it was already removed.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: u64,
}

impl PendingGuard<'_> {
    fn claim(&self) -> bool {
        self.table.claim(self.id)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.claim(self.id);
    }
}

/// Turns a call into a write plus an awaited, time-bounded response.
pub struct Correlator {
    transport: WsTransport,
    pending: PendingTable,
    next_id: AtomicU64,
    timeout_ms: AtomicU64,
}

impl Correlator {
    pub fn new(transport: WsTransport, pending: PendingTable, timeout: Duration) -> Self {
        Self {
            transport,
            pending,
            next_id: AtomicU64::new(1),
            timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
        }
    }

    pub fn transport(&self) -> &WsTransport {
        &self.transport
    }

    /// Timeout applied to calls issued from now on.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms.store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Acquire))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Issue `method` and wait for its correlated result.
    pub async fn call(&self, method: &str, params: RpcParams) -> Result<Value, RpcError> {
        self.call_on_link(method, params).await.map(|(value, _)| value)
    }

    /// Like [`call`](Self::call), also returning the epoch of the link the
    /// request was written on.
    pub async fn call_on_link(
        &self,
        method: &str,
        params: RpcParams,
    ) -> Result<(Value, u64), RpcError> {
        let timeout = self.timeout();
        let deadline = time::Instant::now() + timeout;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        let (guard, mut rx) = self.pending.register(id, method, timeout);
        let sent_on = AtomicU64::new(0);
        tracing::trace!(id, method, "dispatching call");

        let outcome = time::timeout_at(deadline, async {
            self.transport
                .send(&frame, |epoch| {
                    sent_on.store(epoch, Ordering::Release);
                    self.pending.bind_epoch(id, epoch);
                })
                .await?;
            match (&mut rx).await {
                Ok(result) => result,
                Err(_) => Err(RpcError::Connection("pending call dropped".into())),
            }
        })
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_elapsed) => {
                if guard.claim() {
                    tracing::debug!(id, method, timeout_ms = timeout.as_millis() as u64, "call timed out");
                    Err(RpcError::Timeout {
                        ms: timeout.as_millis() as u64,
                    })
                } else {
                    // The receive path won the race; its outcome is already in the slot.
                    rx.try_recv().unwrap_or(Err(RpcError::Timeout {
                        ms: timeout.as_millis() as u64,
                    }))
                }
            }
        };
        result.map(|value| (value, sent_on.load(Ordering::Acquire)))
    }

    /// Close the transport and fail whatever is still waiting.
    pub async fn shutdown(&self) {
        self.transport.close().await;
        let failed = self.pending.fail_all(|| RpcError::Closed);
        if failed > 0 {
            tracing::debug!(failed, "failed pending calls on shutdown");
        }
    }
}
