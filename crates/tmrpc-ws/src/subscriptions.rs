//! Event subscription registry.
//!
//! Subscriptions are keyed by the canonical form of their query, so at
//! most one can be live per distinct filter. Each one owns a bounded
//! channel; when a consumer falls behind, new events for that consumer
//! are dropped and counted instead of stalling the receive loop.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use tmrpc_core::error::RpcError;
use tmrpc_core::query::Query;
use tmrpc_core::request::Event;

struct SubscriptionEntry {
    query: Query,
    sender: mpsc::Sender<Event>,
    capacity: usize,
    /// Link epoch the node acknowledged this subscription on.
    confirmed_epoch: Option<u64>,
    /// Distinguishes this registration from later ones for the same query.
    registration: u64,
    dropped: Arc<AtomicU64>,
}

#[derive(Default)]
struct RegistryInner {
    entries: Mutex<HashMap<String, SubscriptionEntry>>,
    next_registration: AtomicU64,
}

/// Manages live subscriptions and fans events out to them.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, SubscriptionEntry>> {
        self.inner.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the slot for `query` and create its event channel.
    ///
    /// A capacity of 0 is treated as 1.
    pub fn reserve(&self, query: Query, capacity: usize) -> Result<EventStream, RpcError> {
        let key = query.canonical();
        let capacity = capacity.max(1);
        let mut entries = self.entries();
        if entries.contains_key(&key) {
            return Err(RpcError::DuplicateSubscription { query: key });
        }
        let (sender, rx) = mpsc::channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let registration = self.inner.next_registration.fetch_add(1, Ordering::Relaxed) + 1;
        entries.insert(
            key.clone(),
            SubscriptionEntry {
                query,
                sender,
                capacity,
                confirmed_epoch: None,
                registration,
                dropped: Arc::clone(&dropped),
            },
        );
        Ok(EventStream {
            query: key,
            registration,
            rx,
            dropped,
        })
    }

    /// Record that the node acknowledged `key` on link `epoch`.
    pub fn confirm(&self, key: &str, epoch: u64) {
        if let Some(entry) = self.entries().get_mut(key) {
            entry.confirmed_epoch = Some(epoch);
        }
    }

    /// Drop the registration; its stream ends once drained.
    pub fn remove(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    /// Drop the registration for `key` only if it is still `registration`;
    /// a newer subscription to the same query is left alone.
    pub fn remove_if(&self, key: &str, registration: u64) -> bool {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.registration == registration => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Drop every registration, returning their keys.
    pub fn clear(&self) -> Vec<String> {
        self.entries().drain().map(|(key, _)| key).collect()
    }

    /// Confirmed subscriptions that predate link `epoch` and need re-issuing.
    pub fn stale(&self, epoch: u64) -> Vec<String> {
        self.entries()
            .iter()
            .filter(|(_, e)| matches!(e.confirmed_epoch, Some(c) if c < epoch))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Events dropped so far for `key` because its consumer was full.
    pub fn dropped_events(&self, key: &str) -> Option<u64> {
        self.entries()
            .get(key)
            .map(|e| e.dropped.load(Ordering::Relaxed))
    }

    /// Forward `event` without blocking. Returns the number of
    /// subscriptions it was delivered to.
    ///
    /// The node sends one frame per subscription, naming it in `query`, so
    /// a frame whose query is live goes to that subscription only. Frames
    /// naming no live subscription fall back to attribute matching.
    pub fn dispatch(&self, event: &Event) -> usize {
        let frame_key = Query::parse(&event.query).ok().map(|q| q.canonical());
        let entries = self.entries();

        if let Some(entry) = frame_key.as_deref().and_then(|k| entries.get(k)) {
            return usize::from(deliver(entry, event));
        }
        if event.events.is_empty() {
            return 0;
        }
        entries
            .values()
            .filter(|entry| entry.query.matches(&event.events))
            .filter(|entry| deliver(entry, event))
            .count()
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns `true` if there are no live subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn deliver(entry: &SubscriptionEntry, event: &Event) -> bool {
    let key = entry.query.canonical();
    match entry.sender.try_send(event.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            let total = entry.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                query = %key,
                capacity = entry.capacity,
                dropped = total,
                "subscriber buffer full, dropping event"
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(query = %key, "subscriber dropped its stream, event discarded");
            false
        }
    }
}

/// The events of one subscription, in arrival order.
///
/// Ends (`None`) after `unsubscribe` or client shutdown, once every event
/// already queued has been taken.
pub struct EventStream {
    query: String,
    registration: u64,
    rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventStream {
    /// Canonical query this stream was registered under.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Registration token, for [`SubscriptionRegistry::remove_if`].
    pub fn registration(&self) -> u64 {
        self.registration
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Events the registry had to drop because this stream was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("query", &self.query)
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(query: &str, attrs: &[(&str, &str)]) -> Event {
        let mut events: HashMap<String, Vec<String>> = HashMap::new();
        for (k, v) in attrs {
            events.entry(k.to_string()).or_default().push(v.to_string());
        }
        Event {
            query: query.into(),
            data: json!({"type": "tendermint/event/NewBlock", "value": {}}),
            events,
        }
    }

    fn q(s: &str) -> Query {
        Query::parse(s).unwrap()
    }

    #[test]
    fn reserve_and_dispatch() {
        let reg = SubscriptionRegistry::new();
        let mut stream = reg.reserve(q("tm.event = 'NewBlock'"), 10).unwrap();

        assert_eq!(reg.dispatch(&event("tm.event='NewBlock'", &[])), 1);

        let got = stream.try_recv().unwrap();
        assert_eq!(got.event_type(), Some("tendermint/event/NewBlock"));
    }

    #[test]
    fn duplicate_reserve_is_rejected() {
        let reg = SubscriptionRegistry::new();
        let _first = reg.reserve(q("tm.event = 'Tx'"), 10).unwrap();
        let second = reg.reserve(q("tm.event='Tx'"), 10);
        assert!(matches!(second, Err(RpcError::DuplicateSubscription { .. })));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_ends_stream_after_drain() {
        let reg = SubscriptionRegistry::new();
        let mut stream = reg.reserve(q("tm.event = 'Tx'"), 10).unwrap();
        reg.dispatch(&event("tm.event = 'Tx'", &[]));
        assert!(reg.remove("tm.event = 'Tx'"));
        assert!(!reg.remove("tm.event = 'Tx'"));

        assert!(stream.try_recv().is_some());
        assert!(stream.try_recv().is_none());
        assert_eq!(reg.dispatch(&event("tm.event = 'Tx'", &[])), 0);
    }

    #[test]
    fn frame_for_a_live_query_reaches_only_that_subscription() {
        let reg = SubscriptionRegistry::new();
        let mut all_tx = reg.reserve(q("tm.event = 'Tx'"), 10).unwrap();
        let mut high = reg.reserve(q("tm.event = 'Tx' AND tx.height > 100"), 10).unwrap();
        let attrs = [("tm.event", "Tx"), ("tx.height", "150")];

        // One node event arrives as one frame per matching subscription.
        assert_eq!(reg.dispatch(&event("tm.event = 'Tx'", &attrs)), 1);
        assert_eq!(reg.dispatch(&event("tm.event='Tx' AND tx.height>100", &attrs)), 1);

        assert!(all_tx.try_recv().is_some());
        assert!(all_tx.try_recv().is_none());
        assert!(high.try_recv().is_some());
        assert!(high.try_recv().is_none());
    }

    #[test]
    fn unknown_query_falls_back_to_attribute_matching() {
        let reg = SubscriptionRegistry::new();
        let mut all_tx = reg.reserve(q("tm.event = 'Tx'"), 10).unwrap();
        let mut high = reg.reserve(q("tm.event = 'Tx' AND tx.height > 100"), 10).unwrap();
        let mut blocks = reg.reserve(q("tm.event = 'NewBlock'"), 10).unwrap();

        let delivered = reg.dispatch(&event(
            "tm.event = 'Tx' AND transfer.sender EXISTS",
            &[("tm.event", "Tx"), ("tx.height", "150")],
        ));
        assert_eq!(delivered, 2);
        assert!(all_tx.try_recv().is_some());
        assert!(high.try_recv().is_some());
        assert!(blocks.try_recv().is_none());

        assert_eq!(reg.dispatch(&event("tm.event = 'Vote'", &[])), 0);
    }

    #[test]
    fn full_buffer_drops_newest_without_blocking() {
        let reg = SubscriptionRegistry::new();
        let mut slow = reg.reserve(q("tm.event = 'NewBlock'"), 1).unwrap();
        let mut fast = reg.reserve(q("tm.event = 'Tx'"), 10).unwrap();

        for _ in 0..3 {
            reg.dispatch(&event("tm.event = 'NewBlock'", &[]));
            reg.dispatch(&event("tm.event = 'Tx'", &[]));
        }

        assert_eq!(slow.dropped(), 2);
        assert_eq!(reg.dropped_events("tm.event = 'NewBlock'"), Some(2));
        assert!(slow.try_recv().is_some());
        assert!(slow.try_recv().is_none());

        let mut fast_count = 0;
        while fast.try_recv().is_some() {
            fast_count += 1;
        }
        assert_eq!(fast_count, 3);
        assert_eq!(fast.dropped(), 0);
    }

    #[test]
    fn remove_if_spares_a_newer_registration() {
        let reg = SubscriptionRegistry::new();
        let first = reg.reserve(q("tm.event = 'Tx'"), 1).unwrap();
        let stale_token = first.registration();
        assert!(reg.remove("tm.event = 'Tx'"));

        let mut second = reg.reserve(q("tm.event = 'Tx'"), 1).unwrap();
        assert_ne!(second.registration(), stale_token);
        assert!(!reg.remove_if("tm.event = 'Tx'", stale_token));
        assert_eq!(reg.len(), 1);

        reg.dispatch(&event("tm.event = 'Tx'", &[]));
        assert!(second.try_recv().is_some());

        assert!(reg.remove_if("tm.event = 'Tx'", second.registration()));
        assert!(reg.is_empty());
    }

    #[test]
    fn stale_lists_subscriptions_from_older_links() {
        let reg = SubscriptionRegistry::new();
        let _a = reg.reserve(q("tm.event = 'Tx'"), 1).unwrap();
        let _b = reg.reserve(q("tm.event = 'NewBlock'"), 1).unwrap();
        let _c = reg.reserve(q("tm.event = 'Vote'"), 1).unwrap();
        reg.confirm("tm.event = 'Tx'", 1);
        reg.confirm("tm.event = 'NewBlock'", 2);

        assert_eq!(reg.stale(2), vec!["tm.event = 'Tx'".to_string()]);
        let mut stale = reg.stale(3);
        stale.sort();
        assert_eq!(stale, vec!["tm.event = 'NewBlock'".to_string(), "tm.event = 'Tx'".to_string()]);
    }

    #[test]
    fn clear_ends_every_stream() {
        let reg = SubscriptionRegistry::new();
        let mut a = reg.reserve(q("tm.event = 'Tx'"), 1).unwrap();
        let mut b = reg.reserve(q("tm.event = 'Vote'"), 1).unwrap();
        assert_eq!(reg.clear().len(), 2);
        assert!(reg.is_empty());
        assert!(a.try_recv().is_none());
        assert!(b.try_recv().is_none());
    }
}
