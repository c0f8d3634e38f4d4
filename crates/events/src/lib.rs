//! Local event fan-out hub.
//!
//! Each node hosts one [`EventHub`]. The consensus apply path publishes every
//! derived event; SSE subscribers drain a bounded per-client queue, filtered
//! by session. A subscriber that cannot keep up loses its oldest queued
//! events rather than slowing the state machine down. The hub is strictly
//! local: it reflects the events this node has applied, which is sufficient
//! because every committed event eventually applies on every node.

use cohort_core::Event;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Queue capacity per subscriber when none is configured.
pub const DEFAULT_CLIENT_QUEUE: usize = 256;

struct ClientSlot {
    session_filter: Option<String>,
    queue: Mutex<VecDeque<Event>>,
    dropped: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl ClientSlot {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// Per-client counters surfaced for diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub client_id: String,
    pub queued: usize,
    pub dropped: u64,
    pub session_filter: Option<String>,
}

/// The hub. Cheap to share; publish is lock-per-client and never blocks on
/// slow consumers.
pub struct EventHub {
    capacity: usize,
    clients: Mutex<HashMap<String, Arc<ClientSlot>>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a subscriber. Re-using a client id replaces the previous
    /// subscription, which then terminates.
    pub fn subscribe(
        self: &Arc<Self>,
        client_id: impl Into<String>,
        session_filter: Option<String>,
    ) -> Subscription {
        let client_id = client_id.into();
        let slot = Arc::new(ClientSlot {
            session_filter,
            queue: Mutex::new(VecDeque::with_capacity(self.capacity.min(64))),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let previous = self
            .clients
            .lock()
            .insert(client_id.clone(), slot.clone());
        if let Some(previous) = previous {
            previous.close();
        }
        debug!(client_id = %client_id, "sse subscriber registered");
        Subscription {
            hub: self.clone(),
            client_id,
            slot,
        }
    }

    /// Enqueues an event to every matching subscriber. Overflow drops the
    /// oldest unsent event and bumps the client's drop counter.
    pub fn publish(&self, event: &Event) {
        let clients = self.clients.lock();
        for slot in clients.values() {
            if let Some(filter) = &slot.session_filter {
                if filter != &event.session_id {
                    continue;
                }
            }
            let mut queue = slot.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                slot.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event.clone());
            drop(queue);
            slot.notify.notify_one();
        }
    }

    /// Publishes a batch in order.
    pub fn publish_all(&self, events: &[Event]) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn stats(&self) -> Vec<ClientStats> {
        let clients = self.clients.lock();
        let mut stats: Vec<ClientStats> = clients
            .iter()
            .map(|(id, slot)| ClientStats {
                client_id: id.clone(),
                queued: slot.queue.lock().len(),
                dropped: slot.dropped.load(Ordering::Relaxed),
                session_filter: slot.session_filter.clone(),
            })
            .collect();
        stats.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        stats
    }

    fn unregister(&self, client_id: &str, slot: &Arc<ClientSlot>) {
        let mut clients = self.clients.lock();
        // Only remove the entry if it is still ours; a replacement
        // subscription may have taken the id over.
        if let Some(current) = clients.get(client_id) {
            if Arc::ptr_eq(current, slot) {
                clients.remove(client_id);
            }
        }
    }
}

/// A live subscription; dropping it unregisters the client.
pub struct Subscription {
    hub: Arc<EventHub>,
    client_id: String,
    slot: Arc<ClientSlot>,
}

impl Subscription {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Next event, in publish order. `None` once the subscription was
    /// replaced or the hub let it go.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            if let Some(event) = self.slot.queue.lock().pop_front() {
                return Some(event);
            }
            if self.slot.closed.load(Ordering::Acquire) {
                return None;
            }
            self.slot.notify.notified().await;
        }
    }

    /// Adapts the subscription into a stream for SSE replies.
    pub fn into_stream(self) -> impl futures::Stream<Item = Event> + Send {
        futures::stream::unfold(self, |sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.slot.close();
        self.hub.unregister(&self.client_id, &self.slot);
        debug!(client_id = %self.client_id, "sse subscriber unregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(session_id: &str, n: u64) -> Event {
        let at = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Event {
            event_id: Event::derive_id("tx", session_id, n),
            session_id: session_id.to_string(),
            step_id: None,
            event_type: "STEP_CLAIMED".to_string(),
            actor: "user:alice".to_string(),
            payload: serde_json::json!({ "n": n }),
            created_at: at,
            tx_id: "tx".to_string(),
            commit_time: at,
        }
    }

    #[tokio::test]
    async fn delivers_in_order_with_session_filter() {
        let hub = EventHub::new(8);
        let all = hub.subscribe("all", None);
        let only_s1 = hub.subscribe("s1-only", Some("s1".to_string()));

        hub.publish(&event("s1", 1));
        hub.publish(&event("s2", 2));
        hub.publish(&event("s1", 3));

        assert_eq!(all.recv().await.unwrap().payload["n"], 1);
        assert_eq!(all.recv().await.unwrap().payload["n"], 2);
        assert_eq!(all.recv().await.unwrap().payload["n"], 3);

        assert_eq!(only_s1.recv().await.unwrap().payload["n"], 1);
        assert_eq!(only_s1.recv().await.unwrap().payload["n"], 3);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let hub = EventHub::new(2);
        let sub = hub.subscribe("slow", None);

        hub.publish(&event("s1", 1));
        hub.publish(&event("s1", 2));
        hub.publish(&event("s1", 3));

        let stats = hub.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].dropped, 1);
        assert_eq!(stats[0].queued, 2);

        // The oldest event was sacrificed.
        assert_eq!(sub.recv().await.unwrap().payload["n"], 2);
        assert_eq!(sub.recv().await.unwrap().payload["n"], 3);
    }

    #[tokio::test]
    async fn drop_unregisters_the_client() {
        let hub = EventHub::new(8);
        let sub = hub.subscribe("gone", None);
        assert_eq!(hub.client_count(), 1);
        drop(sub);
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn resubscribing_replaces_the_previous_stream() {
        let hub = EventHub::new(8);
        let old = hub.subscribe("dup", None);
        let new = hub.subscribe("dup", None);
        assert_eq!(hub.client_count(), 1);

        // The replaced subscription terminates.
        assert!(old.recv().await.is_none());

        hub.publish(&event("s1", 7));
        assert_eq!(new.recv().await.unwrap().payload["n"], 7);

        // Dropping the stale handle must not evict the live one.
        drop(old);
        assert_eq!(hub.client_count(), 1);
    }
}
